#![forbid(unsafe_code)]

// Clock synchronization - reads the reference clock overlay each page renders
// and records how far every participant's displayed clock is from ours.

use crate::driver::InstrumentedPage;
use crate::overlay::{OverlayTime, ReferenceClock};
use crate::types::{HarnessError, HarnessResult, ParticipantId, VideoTag};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Retry bounds for reading one participant's overlay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub retry_delay: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            attempt_timeout: Duration::from_secs(2),
            retry_delay: Duration::from_millis(200),
        }
    }
}

/// One page to synchronize
#[derive(Clone)]
pub struct SyncTarget {
    pub participant_id: ParticipantId,
    pub page: Arc<dyn InstrumentedPage>,
    pub tag: VideoTag,
}

/// Participant -> signed offset (displayed minus reference), plus who failed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOffsetTable {
    offsets_ms: BTreeMap<ParticipantId, i64>,
    failures: BTreeMap<ParticipantId, String>,
}

impl SyncOffsetTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_offset(&mut self, participant: ParticipantId, offset_ms: i64) {
        self.failures.remove(&participant);
        self.offsets_ms.insert(participant, offset_ms);
    }

    pub fn insert_failure(&mut self, participant: ParticipantId, reason: String) {
        self.offsets_ms.remove(&participant);
        self.failures.insert(participant, reason);
    }

    /// Record the outcome of `ClockSyncEngine::sync_one`
    pub fn record(&mut self, participant: ParticipantId, outcome: &HarnessResult<i64>) {
        match outcome {
            Ok(offset) => self.insert_offset(participant, *offset),
            Err(e) => self.insert_failure(participant, e.to_string()),
        }
    }

    pub fn offset_ms(&self, participant: &ParticipantId) -> Option<i64> {
        self.offsets_ms.get(participant).copied()
    }

    pub fn is_synced(&self, participant: &ParticipantId) -> bool {
        self.offsets_ms.contains_key(participant)
    }

    pub fn offsets(&self) -> &BTreeMap<ParticipantId, i64> {
        &self.offsets_ms
    }

    pub fn failures(&self) -> &BTreeMap<ParticipantId, String> {
        &self.failures
    }

    /// Map a displayed overlay time onto the reference axis
    pub fn normalize(&self, participant: &ParticipantId, displayed: OverlayTime) -> Option<OverlayTime> {
        self.offset_ms(participant).map(|offset| displayed.shifted(-offset))
    }

    pub fn merge(&mut self, other: SyncOffsetTable) {
        for (participant, offset) in other.offsets_ms {
            self.insert_offset(participant, offset);
        }
        for (participant, reason) in other.failures {
            self.insert_failure(participant, reason);
        }
    }
}

pub struct ClockSyncEngine {
    clock: Arc<dyn ReferenceClock>,
    settings: SyncSettings,
}

impl ClockSyncEngine {
    pub fn new(clock: Arc<dyn ReferenceClock>, settings: SyncSettings) -> Self {
        Self { clock, settings }
    }

    /// Synchronize every target concurrently; failures stay per participant.
    pub async fn synchronize(&self, targets: &[SyncTarget]) -> SyncOffsetTable {
        let outcomes = join_all(targets.iter().map(|t| self.sync_one(t))).await;

        let mut table = SyncOffsetTable::new();
        for (target, outcome) in targets.iter().zip(outcomes) {
            table.record(target.participant_id.clone(), &outcome);
        }

        info!(
            "Clock sync done: {} synced, {} failed",
            table.offsets_ms.len(),
            table.failures.len()
        );
        table
    }

    /// Read one participant's overlay and return its offset in milliseconds.
    ///
    /// # Errors
    /// Returns `HarnessError::SyncTimeout` once `max_attempts` reads failed,
    /// timed out or produced unparsable text.
    pub async fn sync_one(&self, target: &SyncTarget) -> HarnessResult<i64> {
        let id = &target.participant_id;
        let attempts = self.settings.max_attempts.max(1);
        let mut overlay_shown = false;

        for attempt in 1..=attempts {
            if attempt > 1 {
                sleep(self.settings.retry_delay).await;
            }

            if !overlay_shown {
                match target.page.show_sync_overlay(target.tag).await {
                    Ok(()) => overlay_shown = true,
                    Err(e) => {
                        debug!("{}: sync overlay not shown (attempt {}): {:#}", id, attempt, e);
                        continue;
                    }
                }
            }

            // Pages grab the overlay as soon as asked; decoding it takes the rest of the read
            let reference = self.clock.time_of_day();
            let text = match timeout(self.settings.attempt_timeout, target.page.read_sync_overlay(target.tag)).await {
                Ok(Ok(text)) => text,
                Ok(Err(e)) => {
                    debug!("{}: overlay read failed (attempt {}): {:#}", id, attempt, e);
                    continue;
                }
                Err(_) => {
                    debug!("{}: overlay read timed out (attempt {})", id, attempt);
                    continue;
                }
            };

            match text.parse::<OverlayTime>() {
                Ok(displayed) => {
                    let offset = displayed.signed_millis_since(reference);
                    debug!("{}: overlay {} vs reference {} -> offset {}ms", id, displayed, reference, offset);
                    return Ok(offset);
                }
                Err(e) => {
                    debug!("{}: {} (attempt {})", id, e, attempt);
                }
            }
        }

        warn!("{}: clock sync gave up after {} attempts", id, attempts);
        Err(HarnessError::SyncTimeout { participant: id.clone(), attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::RuntimeClock;
    use crate::sim::{SimPage, SimPageConfig};
    use crate::types::Role;

    fn clock() -> Arc<RuntimeClock> {
        Arc::new(RuntimeClock::starting_at(OverlayTime::from_hms_milli(10, 0, 0, 0), 1_700_000_000_000))
    }

    fn target(id: ParticipantId, page: Arc<SimPage>, tag: VideoTag) -> SyncTarget {
        SyncTarget { participant_id: id, page, tag }
    }

    #[tokio::test(start_paused = true)]
    async fn test_offsets_follow_page_skew() {
        let clock = clock();
        let presenter = Arc::new(SimPage::new(
            SimPageConfig { clock_skew_ms: 120, ..SimPageConfig::new(ParticipantId::presenter(), Role::Presenter) },
            clock.clone(),
        ));
        let viewer = Arc::new(SimPage::new(
            SimPageConfig { clock_skew_ms: -40, ..SimPageConfig::new(ParticipantId::viewer(0), Role::Viewer) },
            clock.clone(),
        ));

        let engine = ClockSyncEngine::new(clock, SyncSettings::default());
        let table = engine
            .synchronize(&[
                target(ParticipantId::presenter(), presenter, VideoTag::Local),
                target(ParticipantId::viewer(0), viewer, VideoTag::Remote),
            ])
            .await;

        assert_eq!(table.offset_ms(&ParticipantId::presenter()), Some(120));
        assert_eq!(table.offset_ms(&ParticipantId::viewer(0)), Some(-40));
        assert!(table.failures().is_empty());
        assert_eq!(
            table.normalize(&ParticipantId::presenter(), OverlayTime::from_millis(1_120)),
            Some(OverlayTime::from_millis(1_000))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_failures() {
        let clock = clock();
        let page = Arc::new(SimPage::new(
            SimPageConfig { sync_read_failures: 2, ..SimPageConfig::new(ParticipantId::viewer(0), Role::Viewer) },
            clock.clone(),
        ));
        let engine = ClockSyncEngine::new(clock, SyncSettings { max_attempts: 3, ..SyncSettings::default() });

        let offset = engine.sync_one(&target(ParticipantId::viewer(0), page, VideoTag::Remote)).await;
        assert_eq!(offset.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_overlay_fails_only_that_participant() {
        let clock = clock();
        let good = Arc::new(SimPage::new(SimPageConfig::new(ParticipantId::presenter(), Role::Presenter), clock.clone()));
        let bad = Arc::new(SimPage::new(
            SimPageConfig { sync_read_failures: u32::MAX, ..SimPageConfig::new(ParticipantId::viewer(0), Role::Viewer) },
            clock.clone(),
        ));
        let settings = SyncSettings { max_attempts: 4, ..SyncSettings::default() };
        let engine = ClockSyncEngine::new(clock, settings);

        let table = engine
            .synchronize(&[
                target(ParticipantId::presenter(), good, VideoTag::Local),
                target(ParticipantId::viewer(0), bad.clone(), VideoTag::Remote),
            ])
            .await;

        assert!(table.is_synced(&ParticipantId::presenter()));
        assert!(!table.is_synced(&ParticipantId::viewer(0)));
        assert!(table.failures().contains_key(&ParticipantId::viewer(0)));
        assert_eq!(bad.sync_reads(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_decode_is_not_counted_as_skew() {
        let clock = clock();
        let read_delay = Duration::from_millis(300);
        let synced = Arc::new(SimPage::new(
            SimPageConfig { sync_read_delay: read_delay, ..SimPageConfig::new(ParticipantId::viewer(0), Role::Viewer) },
            clock.clone(),
        ));
        let skewed = Arc::new(SimPage::new(
            SimPageConfig {
                sync_read_delay: read_delay,
                clock_skew_ms: 120,
                ..SimPageConfig::new(ParticipantId::presenter(), Role::Presenter)
            },
            clock.clone(),
        ));
        let engine = ClockSyncEngine::new(clock, SyncSettings::default());

        let offset = engine.sync_one(&target(ParticipantId::viewer(0), synced, VideoTag::Remote)).await;
        assert_eq!(offset.unwrap(), 0);
        let offset = engine.sync_one(&target(ParticipantId::presenter(), skewed, VideoTag::Local)).await;
        assert_eq!(offset.unwrap(), 120);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_overlay_is_bounded_by_timeout() {
        let clock = clock();
        let page = Arc::new(SimPage::new(
            SimPageConfig { sync_read_delay: Duration::from_secs(60), ..SimPageConfig::new(ParticipantId::viewer(3), Role::Viewer) },
            clock.clone(),
        ));
        let settings = SyncSettings {
            max_attempts: 2,
            attempt_timeout: Duration::from_millis(500),
            retry_delay: Duration::from_millis(100),
        };
        let engine = ClockSyncEngine::new(clock, settings);

        let started = tokio::time::Instant::now();
        let err = engine.sync_one(&target(ParticipantId::viewer(3), page, VideoTag::Remote)).await.unwrap_err();
        assert!(matches!(err, HarnessError::SyncTimeout { attempts: 2, .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_table_merge_overrides() {
        let mut table = SyncOffsetTable::new();
        table.insert_failure(ParticipantId::viewer(1), "nope".into());
        let mut later = SyncOffsetTable::new();
        later.insert_offset(ParticipantId::viewer(1), 15);
        table.merge(later);
        assert_eq!(table.offset_ms(&ParticipantId::viewer(1)), Some(15));
        assert!(table.failures().is_empty());
    }
}
