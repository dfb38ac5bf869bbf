#![forbid(unsafe_code)]

// Overlay timestamps - the `H:mm:ss:SSS` clock rendered into video frames,
// plus the reference clock the harness compares overlays against.

use crate::types::{HarnessError, HarnessResult};
use chrono::{Local, Timelike, Utc};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

const MS_PER_SECOND: u64 = 1_000;
const MS_PER_MINUTE: u64 = 60 * MS_PER_SECOND;
const MS_PER_HOUR: u64 = 60 * MS_PER_MINUTE;
const MS_PER_DAY: u64 = 24 * MS_PER_HOUR;

/// Time of day decoded from an overlay label, held as milliseconds since midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OverlayTime(u64);

impl OverlayTime {
    pub fn from_millis(ms: u64) -> Self {
        Self(ms % MS_PER_DAY)
    }

    pub fn from_hms_milli(hours: u64, minutes: u64, seconds: u64, millis: u64) -> Self {
        Self::from_millis(hours * MS_PER_HOUR + minutes * MS_PER_MINUTE + seconds * MS_PER_SECOND + millis)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    pub fn since_midnight(&self) -> Duration {
        Duration::from_millis(self.0)
    }

    /// Signed difference `self - other` in milliseconds, taking the short
    /// way around midnight.
    pub fn signed_millis_since(&self, other: OverlayTime) -> i64 {
        let day = MS_PER_DAY as i64;
        let raw = (self.0 as i64 - other.0 as i64).rem_euclid(day);
        if raw >= day / 2 {
            raw - day
        } else {
            raw
        }
    }

    /// Shift by a signed millisecond offset, wrapping around midnight.
    pub fn shifted(&self, offset_ms: i64) -> Self {
        let day = MS_PER_DAY as i64;
        Self((self.0 as i64 + offset_ms).rem_euclid(day) as u64)
    }

    /// Truncated comparison key.
    ///
    /// `dropped_fields` trailing label fields are discarded: 0 keeps
    /// milliseconds, 1 keeps whole seconds, 2 whole minutes, 3 whole hours.
    pub fn truncated_key(&self, dropped_fields: usize) -> u64 {
        match truncation_unit_ms(dropped_fields) {
            Some(unit) => self.0 / unit,
            None => 0,
        }
    }
}

/// Milliseconds covered by one step of a key with `dropped_fields` trailing
/// fields removed. `None` once every field is dropped.
pub fn truncation_unit_ms(dropped_fields: usize) -> Option<u64> {
    match dropped_fields {
        0 => Some(1),
        1 => Some(MS_PER_SECOND),
        2 => Some(MS_PER_MINUTE),
        3 => Some(MS_PER_HOUR),
        _ => None,
    }
}

/// Distinct truncated keys in one day, `None` once every field is dropped
pub fn keys_per_day(dropped_fields: usize) -> Option<u64> {
    truncation_unit_ms(dropped_fields).map(|unit| MS_PER_DAY / unit)
}

impl fmt::Display for OverlayTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hours = self.0 / MS_PER_HOUR;
        let minutes = (self.0 % MS_PER_HOUR) / MS_PER_MINUTE;
        let seconds = (self.0 % MS_PER_MINUTE) / MS_PER_SECOND;
        let millis = self.0 % MS_PER_SECOND;
        write!(f, "{hours}:{minutes:02}:{seconds:02}:{millis:03}")
    }
}

impl FromStr for OverlayTime {
    type Err = HarnessError;

    fn from_str(text: &str) -> HarnessResult<Self> {
        let parse_failure = |reason: &str| HarnessError::ParseFailure {
            text: text.to_string(),
            reason: reason.to_string(),
        };

        let fields: Vec<&str> = text.trim().split(':').collect();
        if fields.len() != 4 {
            return Err(parse_failure("expected four ':'-separated fields"));
        }

        let mut values = [0u64; 4];
        for (slot, field) in values.iter_mut().zip(&fields) {
            if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
                return Err(parse_failure("non-numeric field"));
            }
            *slot = field.parse().map_err(|_| parse_failure("field out of range"))?;
        }

        let [hours, minutes, seconds, millis] = values;
        if hours > 23 || minutes > 59 || seconds > 59 || fields[3].len() > 3 {
            return Err(parse_failure("field out of range"));
        }

        Ok(Self::from_hms_milli(hours, minutes, seconds, millis))
    }
}

/// Clock the harness treats as ground truth for overlay synchronization.
pub trait ReferenceClock: Send + Sync {
    /// Time of day as the shared overlay would render it right now
    fn time_of_day(&self) -> OverlayTime;

    /// Milliseconds since the Unix epoch, used to stamp captured samples
    fn wall_clock_ms(&self) -> i64;
}

/// Host clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ReferenceClock for SystemClock {
    fn time_of_day(&self) -> OverlayTime {
        let now = Local::now();
        OverlayTime::from_millis(
            now.num_seconds_from_midnight() as u64 * MS_PER_SECOND
                + (now.nanosecond() / 1_000_000).min(999) as u64,
        )
    }

    fn wall_clock_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Clock driven by the tokio timer, so paused-time tests stay deterministic.
#[derive(Debug, Clone)]
pub struct RuntimeClock {
    origin: tokio::time::Instant,
    origin_time_of_day: OverlayTime,
    origin_wall_ms: i64,
}

impl RuntimeClock {
    pub fn starting_at(time_of_day: OverlayTime, wall_ms: i64) -> Self {
        Self {
            origin: tokio::time::Instant::now(),
            origin_time_of_day: time_of_day,
            origin_wall_ms: wall_ms,
        }
    }

    /// Anchored to the host clock at construction
    pub fn from_system() -> Self {
        let system = SystemClock;
        Self::starting_at(system.time_of_day(), system.wall_clock_ms())
    }

    fn elapsed_ms(&self) -> i64 {
        self.origin.elapsed().as_millis() as i64
    }
}

impl ReferenceClock for RuntimeClock {
    fn time_of_day(&self) -> OverlayTime {
        self.origin_time_of_day.shifted(self.elapsed_ms())
    }

    fn wall_clock_ms(&self) -> i64 {
        self.origin_wall_ms + self.elapsed_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_labels() {
        let t: OverlayTime = "0:00:01:050".parse().unwrap();
        assert_eq!(t.as_millis(), 1_050);

        let t: OverlayTime = "13:05:09:7".parse().unwrap();
        assert_eq!(t, OverlayTime::from_hms_milli(13, 5, 9, 7));

        let t: OverlayTime = " 1:00:00:000 ".parse().unwrap();
        assert_eq!(t.since_midnight(), Duration::from_secs(3600));
    }

    #[test]
    fn test_reject_garbage() {
        for bad in ["", "0:00:01", "0:00:0l:000", "24:00:00:000", "0:60:00:000", "0:00:61:000", "0:00:01:1000", "0:00::000"] {
            let err = bad.parse::<OverlayTime>().unwrap_err();
            assert!(matches!(err, HarnessError::ParseFailure { .. }), "{bad} parsed");
        }
    }

    #[test]
    fn test_display_round_trip() {
        let t = OverlayTime::from_hms_milli(9, 3, 7, 42);
        assert_eq!(t.to_string(), "9:03:07:042");
        assert_eq!(t.to_string().parse::<OverlayTime>().unwrap(), t);
    }

    #[test]
    fn test_truncated_key() {
        let t = OverlayTime::from_hms_milli(0, 2, 5, 999);
        assert_eq!(t.truncated_key(0), 125_999);
        assert_eq!(t.truncated_key(1), 125);
        assert_eq!(t.truncated_key(2), 2);
        assert_eq!(t.truncated_key(3), 0);
        assert_eq!(t.truncated_key(9), 0);
        assert_eq!(keys_per_day(1), Some(86_400));
        assert_eq!(keys_per_day(3), Some(24));
        assert_eq!(keys_per_day(4), None);
    }

    #[test]
    fn test_shift_wraps_midnight() {
        let t = OverlayTime::from_hms_milli(0, 0, 0, 100);
        assert_eq!(t.shifted(-200), OverlayTime::from_hms_milli(23, 59, 59, 900));
        assert_eq!(t.shifted(-200).shifted(200), t);
        assert_eq!(t.signed_millis_since(OverlayTime::from_millis(150)), -50);
        let before_midnight = OverlayTime::from_hms_milli(23, 59, 59, 900);
        assert_eq!(before_midnight.signed_millis_since(t), -200);
        assert_eq!(t.signed_millis_since(before_midnight), 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runtime_clock_follows_timer() {
        let clock = RuntimeClock::starting_at(OverlayTime::from_millis(1_000), 5_000);
        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(clock.time_of_day(), OverlayTime::from_millis(1_250));
        assert_eq!(clock.wall_clock_ms(), 5_250);
    }
}
