#![forbid(unsafe_code)]

// Session metrics - append-only per-participant sample and stats series,
// frozen into an immutable snapshot when capture ends.

use crate::types::{HarnessError, HarnessResult, ParticipantId, StatsSnapshot, TimestampSample};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, Mutex};

/// Everything captured during a session, grouped by participant in arrival order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetrics {
    pub ocr_series: BTreeMap<ParticipantId, Vec<TimestampSample>>,
    pub stats_series: BTreeMap<ParticipantId, Vec<StatsSnapshot>>,
}

impl SessionMetrics {
    pub fn samples(&self, participant: &ParticipantId) -> &[TimestampSample] {
        self.ocr_series.get(participant).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn stats(&self, participant: &ParticipantId) -> &[StatsSnapshot] {
        self.stats_series.get(participant).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn total_samples(&self) -> usize {
        self.ocr_series.values().map(Vec::len).sum()
    }
}

enum State {
    Collecting(SessionMetrics),
    Finalized(Arc<SessionMetrics>),
}

/// Thread-safe collector shared by the capture tasks
pub struct MetricsAggregator {
    state: Mutex<State>,
    rejected: AtomicU64,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Collecting(SessionMetrics::default())),
            rejected: AtomicU64::new(0),
        }
    }

    /// Append an overlay sample.
    ///
    /// # Errors
    /// `StateError` after `finalize`; `OutOfOrderSample` if the sample was
    /// captured before the participant's previous one (it is dropped).
    pub fn record(&self, participant: &ParticipantId, sample: TimestampSample) -> HarnessResult<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let metrics = match &mut *state {
            State::Collecting(metrics) => metrics,
            State::Finalized(_) => {
                return Err(HarnessError::StateError(format!("sample for {participant} after finalize")));
            }
        };

        let series = metrics.ocr_series.entry(participant.clone()).or_default();
        if let Some(last) = series.last() {
            if sample.captured_at_ms < last.captured_at_ms {
                self.rejected.fetch_add(1, Relaxed);
                return Err(HarnessError::OutOfOrderSample {
                    participant: participant.clone(),
                    captured_at_ms: sample.captured_at_ms,
                    last_ms: last.captured_at_ms,
                });
            }
        }
        series.push(sample);
        Ok(())
    }

    /// Append a stats snapshot; same rules as `record`.
    pub fn record_stats(&self, participant: &ParticipantId, snapshot: StatsSnapshot) -> HarnessResult<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let metrics = match &mut *state {
            State::Collecting(metrics) => metrics,
            State::Finalized(_) => {
                return Err(HarnessError::StateError(format!("stats for {participant} after finalize")));
            }
        };

        let series = metrics.stats_series.entry(participant.clone()).or_default();
        if let Some(last) = series.last() {
            if snapshot.captured_at_ms < last.captured_at_ms {
                self.rejected.fetch_add(1, Relaxed);
                return Err(HarnessError::OutOfOrderSample {
                    participant: participant.clone(),
                    captured_at_ms: snapshot.captured_at_ms,
                    last_ms: last.captured_at_ms,
                });
            }
        }
        series.push(snapshot);
        Ok(())
    }

    /// Freeze the collected series. Later calls return the same snapshot.
    pub fn finalize(&self) -> Arc<SessionMetrics> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let snapshot = match &mut *state {
            State::Finalized(snapshot) => return snapshot.clone(),
            State::Collecting(metrics) => Arc::new(std::mem::take(metrics)),
        };
        *state = State::Finalized(snapshot.clone());
        snapshot
    }

    pub fn is_finalized(&self) -> bool {
        matches!(*self.state.lock().unwrap_or_else(|e| e.into_inner()), State::Finalized(_))
    }

    /// Samples and snapshots dropped for arriving out of order
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VideoTag;

    fn sample(id: &ParticipantId, at: i64, text: &str) -> TimestampSample {
        TimestampSample {
            participant_id: id.clone(),
            video_tag: VideoTag::Local,
            captured_at_ms: at,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_groups_by_participant_in_arrival_order() {
        let aggregator = MetricsAggregator::new();
        let p = ParticipantId::presenter();
        let v = ParticipantId::viewer(0);

        aggregator.record(&p, sample(&p, 10, "a")).unwrap();
        aggregator.record(&v, sample(&v, 5, "x")).unwrap();
        aggregator.record(&p, sample(&p, 20, "b")).unwrap();
        aggregator
            .record_stats(&v, StatsSnapshot { captured_at_ms: 7, values: BTreeMap::new() })
            .unwrap();

        let metrics = aggregator.finalize();
        let texts: Vec<&str> = metrics.samples(&p).iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b"]);
        assert_eq!(metrics.samples(&v).len(), 1);
        assert_eq!(metrics.stats(&v).len(), 1);
        assert!(metrics.stats(&p).is_empty());
        assert_eq!(metrics.total_samples(), 3);
    }

    #[test]
    fn test_record_after_finalize_is_state_error() {
        let aggregator = MetricsAggregator::new();
        let p = ParticipantId::presenter();
        aggregator.record(&p, sample(&p, 1, "a")).unwrap();

        let first = aggregator.finalize();
        let err = aggregator.record(&p, sample(&p, 2, "b")).unwrap_err();
        assert!(matches!(err, HarnessError::StateError(_)));
        let err = aggregator
            .record_stats(&p, StatsSnapshot { captured_at_ms: 3, values: BTreeMap::new() })
            .unwrap_err();
        assert!(matches!(err, HarnessError::StateError(_)));

        let second = aggregator.finalize();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.samples(&p).len(), 1);
        assert!(aggregator.is_finalized());
    }

    #[test]
    fn test_out_of_order_sample_is_rejected() {
        let aggregator = MetricsAggregator::new();
        let v = ParticipantId::viewer(1);
        aggregator.record(&v, sample(&v, 100, "a")).unwrap();
        aggregator.record(&v, sample(&v, 100, "b")).unwrap();

        let err = aggregator.record(&v, sample(&v, 99, "c")).unwrap_err();
        assert!(matches!(err, HarnessError::OutOfOrderSample { last_ms: 100, .. }));
        assert_eq!(aggregator.rejected(), 1);
        assert_eq!(aggregator.finalize().samples(&v).len(), 2);
    }

    #[test]
    fn test_concurrent_recording() {
        let aggregator = Arc::new(MetricsAggregator::new());
        let handles: Vec<_> = (0..4)
            .map(|n| {
                let aggregator = aggregator.clone();
                std::thread::spawn(move || {
                    let id = ParticipantId::viewer(n);
                    for at in 0..100 {
                        aggregator.record(&id, sample(&id, at, "t")).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(aggregator.finalize().total_samples(), 400);
    }
}
