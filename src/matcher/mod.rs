#![forbid(unsafe_code)]

// Sample matching - pairs presenter and viewer overlay samples into latency
// observations using a truncated-key window.

use crate::clock_sync::SyncOffsetTable;
use crate::overlay::{keys_per_day, truncation_unit_ms, OverlayTime};
use crate::types::{LatencyObservation, ParticipantId, TimestampSample};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// Which sample field decides whether two samples are candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchKey {
    /// Compare the decoded overlay labels
    OverlayText,
    /// Compare capture instants; latency still comes from the labels
    CaptureTime,
}

/// Tolerance used when deciding two samples may correspond
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchWindow {
    pub key: MatchKey,
    /// Trailing label fields ignored when building the comparison key
    pub dropped_fields: usize,
    /// Maximum key steps between candidates (1 = adjacent seconds)
    pub max_key_distance: u64,
}

impl Default for MatchWindow {
    fn default() -> Self {
        Self {
            key: MatchKey::OverlayText,
            dropped_fields: 1,
            max_key_distance: 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchOutcome {
    pub observations: Vec<LatencyObservation>,
    /// Labels that could not be parsed, in the order met
    pub parse_failures: Vec<String>,
    pub unmatched_presenter: usize,
    /// Set when either side lacks a clock offset
    pub excluded: Option<ParticipantId>,
}

struct Prepared<'a> {
    sample: &'a TimestampSample,
    time: OverlayTime,
    key: u64,
}

pub struct SampleMatcher {
    window: MatchWindow,
}

impl SampleMatcher {
    pub fn new(window: MatchWindow) -> Self {
        Self { window }
    }

    pub fn window(&self) -> &MatchWindow {
        &self.window
    }

    /// Pair samples first-fit in presenter order; each viewer sample is used at most once.
    ///
    /// Among candidates inside the key window the closest one wins, ties go to
    /// the earlier viewer sample. Unparsable labels are skipped and listed in
    /// the outcome; a presenter sample without a candidate yields nothing.
    /// A pair where either side has no clock offset is excluded outright, even
    /// when a series is empty.
    pub fn match_series(
        &self,
        presenter: (&ParticipantId, &[TimestampSample]),
        viewer: (&ParticipantId, &[TimestampSample]),
        offsets: &SyncOffsetTable,
    ) -> MatchOutcome {
        let mut outcome = MatchOutcome::default();
        let ((p_id, presenter), (v_id, viewer)) = (presenter, viewer);

        let (p_offset, v_offset) = match (offsets.offset_ms(p_id), offsets.offset_ms(v_id)) {
            (Some(p), Some(v)) => (p, v),
            (None, _) => {
                outcome.excluded = Some(p_id.clone());
                return outcome;
            }
            (_, None) => {
                outcome.excluded = Some(v_id.clone());
                return outcome;
            }
        };
        if viewer.is_empty() {
            outcome.unmatched_presenter = presenter.len();
            return outcome;
        }

        let presenter = self.prepare(presenter, &mut outcome.parse_failures);
        let viewer = self.prepare(viewer, &mut outcome.parse_failures);

        let mut by_key: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
        for (idx, v) in viewer.iter().enumerate() {
            by_key.entry(v.key).or_default().push(idx);
        }
        let mut consumed = vec![false; viewer.len()];

        for p in &presenter {
            let best = self
                .key_ranges(p.key)
                .into_iter()
                .flat_map(|(lo, hi)| by_key.range(lo..=hi))
                .flat_map(|(_, idxs)| idxs.iter().copied())
                .filter(|&idx| !consumed[idx])
                .min_by_key(|&idx| (self.distance(p, &viewer[idx]), idx));

            let Some(idx) = best else {
                outcome.unmatched_presenter += 1;
                continue;
            };
            consumed[idx] = true;

            let v = &viewer[idx];
            let latency_ms = p.time.shifted(-p_offset).signed_millis_since(v.time.shifted(-v_offset));
            outcome.observations.push(LatencyObservation {
                presenter_sample: p.sample.clone(),
                viewer_sample: v.sample.clone(),
                latency_ms,
            });
        }

        debug!(
            "Matched {} -> {}: {} observations, {} unmatched, {} unparsable",
            p_id,
            v_id,
            outcome.observations.len(),
            outcome.unmatched_presenter,
            outcome.parse_failures.len()
        );
        outcome
    }

    /// Drop repeated labels (first wins) and unparsable ones, attach keys.
    fn prepare<'a>(&self, series: &'a [TimestampSample], parse_failures: &mut Vec<String>) -> Vec<Prepared<'a>> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut prepared = Vec::with_capacity(series.len());

        for sample in series {
            if !seen.insert(sample.text.as_str()) {
                continue;
            }
            let time = match sample.text.parse::<OverlayTime>() {
                Ok(t) => t,
                Err(_) => {
                    parse_failures.push(sample.text.clone());
                    continue;
                }
            };
            let key = match self.window.key {
                MatchKey::OverlayText => time.truncated_key(self.window.dropped_fields),
                MatchKey::CaptureTime => match truncation_unit_ms(self.window.dropped_fields) {
                    Some(unit) => sample.captured_at_ms.max(0) as u64 / unit,
                    None => 0,
                },
            };
            prepared.push(Prepared { sample, time, key });
        }
        prepared
    }

    /// Inclusive key ranges within `max_key_distance` of `key`.
    ///
    /// Label keys wrap at midnight, so a window near either end of the day
    /// splits into two ranges. Capture-time keys never wrap.
    fn key_ranges(&self, key: u64) -> Vec<(u64, u64)> {
        let d = self.window.max_key_distance;
        let per_day = match self.window.key {
            MatchKey::OverlayText => keys_per_day(self.window.dropped_fields),
            MatchKey::CaptureTime => None,
        };

        match per_day {
            Some(n) if d.saturating_mul(2) < n => {
                // Unroll onto [0, 3n) so both neighbours of the day are covered
                let (lo, hi) = (key + n - d, key + n + d);
                (0..3)
                    .filter_map(|day| {
                        let base = day * n;
                        let (start, end) = (lo.max(base), hi.min(base + n - 1));
                        (start <= end).then(|| (start - base, end - base))
                    })
                    .collect()
            }
            Some(_) => vec![(0, u64::MAX)],
            None => vec![(key.saturating_sub(d), key.saturating_add(d))],
        }
    }

    fn distance(&self, p: &Prepared<'_>, v: &Prepared<'_>) -> u64 {
        match self.window.key {
            MatchKey::OverlayText => p.time.signed_millis_since(v.time).unsigned_abs(),
            MatchKey::CaptureTime => p.sample.captured_at_ms.abs_diff(v.sample.captured_at_ms),
        }
    }
}
