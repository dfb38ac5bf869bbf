#![forbid(unsafe_code)]

// Session report - latency statistics per viewer and overall, ramp summary
// and the non-fatal failures collected along the way.

use crate::clock_sync::SyncOffsetTable;
use crate::config::Scenario;
use crate::matcher::MatchOutcome;
use crate::ramp::{RampFailure, RampReport};
use crate::session::{CaptureTally, SessionState};
use crate::types::{LatencyObservation, ParticipantId};
use serde::Serialize;
use std::collections::BTreeMap;

/// Distribution of a series of millisecond values
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyStats {
    pub count: usize,
    pub min_ms: i64,
    pub max_ms: i64,
    pub avg_ms: i64,
    pub p50_ms: i64,
    pub p95_ms: i64,
    pub p99_ms: i64,
}

impl LatencyStats {
    /// `None` for an empty series
    pub fn from_samples(samples: &[i64]) -> Option<Self> {
        let mut sorted = samples.to_vec();
        sorted.sort_unstable();
        let (&min_ms, &max_ms) = (sorted.first()?, sorted.last()?);
        let count = sorted.len();
        Some(Self {
            count,
            min_ms,
            max_ms,
            avg_ms: sorted.iter().sum::<i64>() / count as i64,
            p50_ms: percentile(&sorted, 0.50),
            p95_ms: percentile(&sorted, 0.95),
            p99_ms: percentile(&sorted, 0.99),
        })
    }
}

fn percentile(sorted_data: &[i64], p: f64) -> i64 {
    if sorted_data.is_empty() {
        return 0;
    }
    let idx = (p * (sorted_data.len() - 1) as f64).round() as usize;
    sorted_data[idx.min(sorted_data.len() - 1)]
}

/// Matching results for one presenter/viewer pair
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerLatency {
    pub participant_id: ParticipantId,
    pub latency: Option<LatencyStats>,
    pub matched: usize,
    pub unmatched_presenter: usize,
    pub parse_failures: usize,
    /// No clock offset for this pair; nothing was matched
    pub excluded: bool,
}

impl ViewerLatency {
    pub fn from_outcome(participant_id: ParticipantId, outcome: &MatchOutcome) -> Self {
        let latencies: Vec<i64> = outcome.observations.iter().map(|o| o.latency_ms).collect();
        Self {
            participant_id,
            latency: LatencyStats::from_samples(&latencies),
            matched: outcome.observations.len(),
            unmatched_presenter: outcome.unmatched_presenter,
            parse_failures: outcome.parse_failures.len(),
            excluded: outcome.excluded.is_some(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RampSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failures: Vec<RampFailure>,
    pub setup_time: Option<LatencyStats>,
    pub elapsed_ms: u64,
}

impl RampSummary {
    pub fn from_report<T>(report: &RampReport<T>) -> Self {
        let setup_times: Vec<i64> = report.setup_times_ms().into_iter().map(|ms| ms as i64).collect();
        Self {
            attempted: report.len(),
            succeeded: report.succeeded(),
            failures: report.failures(),
            setup_time: LatencyStats::from_samples(&setup_times),
            elapsed_ms: report.elapsed.as_millis() as u64,
        }
    }
}

/// Everything a finished session hands back to the caller
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    pub scenario: Scenario,
    pub final_state: SessionState,
    /// Session start until presenter and primary viewer were capturing
    pub primary_setup_ms: u64,
    pub viewers: Vec<ViewerLatency>,
    /// Exported as its own series
    #[serde(skip)]
    pub observations: BTreeMap<ParticipantId, Vec<LatencyObservation>>,
    pub overall: Option<LatencyStats>,
    pub ramp: Option<RampSummary>,
    pub sync: SyncOffsetTable,
    pub total_samples: usize,
    pub rejected_samples: u64,
    /// One entry per capture pump
    pub capture: Vec<CaptureTally>,
    pub export_errors: Vec<String>,
    /// Driver or page calls that failed during teardown
    pub release_failures: usize,
}

impl SessionReport {
    pub fn new(
        scenario: Scenario,
        outcomes: &BTreeMap<ParticipantId, MatchOutcome>,
        ramp: Option<RampSummary>,
        sync: SyncOffsetTable,
    ) -> Self {
        let viewers = outcomes
            .iter()
            .map(|(id, outcome)| ViewerLatency::from_outcome(id.clone(), outcome))
            .collect();
        let all: Vec<i64> = outcomes
            .values()
            .flat_map(|o| o.observations.iter().map(|obs| obs.latency_ms))
            .collect();

        Self {
            scenario,
            final_state: SessionState::Exported,
            primary_setup_ms: 0,
            viewers,
            observations: outcomes
                .iter()
                .map(|(id, outcome)| (id.clone(), outcome.observations.clone()))
                .collect(),
            overall: LatencyStats::from_samples(&all),
            ramp,
            sync,
            total_samples: 0,
            rejected_samples: 0,
            capture: Vec::new(),
            export_errors: Vec::new(),
            release_failures: 0,
        }
    }

    pub fn parse_failures(&self) -> usize {
        self.viewers.iter().map(|v| v.parse_failures).sum()
    }

    /// Overlay and stats reads that failed or timed out during capture
    pub fn read_errors(&self) -> u64 {
        self.capture.iter().map(|t| t.read_errors).sum()
    }

    pub fn print_summary(&self) {
        println!("\n=== Fan-out Latency Summary ===");
        println!("Scenario: {:?}", self.scenario);
        println!("Final State: {}", self.final_state);
        println!("Primary Setup: {} ms", self.primary_setup_ms);

        if let Some(ramp) = &self.ramp {
            println!("\nRamp:");
            println!("  Viewers Attempted: {}", ramp.attempted);
            println!("  Viewers Connected: {}", ramp.succeeded);
            println!("  Failures: {}", ramp.failures.len());
            println!("  Elapsed: {} ms ({:.2} s)", ramp.elapsed_ms, ramp.elapsed_ms as f64 / 1000.0);
            if let Some(setup) = &ramp.setup_time {
                println!(
                    "  Setup Time: avg={}ms p50={}ms p95={}ms p99={}ms",
                    setup.avg_ms, setup.p50_ms, setup.p95_ms, setup.p99_ms
                );
            }
            for failure in ramp.failures.iter().take(10) {
                println!("    attempt {}: {}", failure.index, failure.reason);
            }
        }

        println!("\nClock Sync:");
        for (id, offset) in self.sync.offsets() {
            println!("  {}: {} ms", id, offset);
        }
        for (id, reason) in self.sync.failures() {
            println!("  {}: FAILED ({})", id, reason);
        }

        println!("\nLatency (presenter - viewer):");
        for viewer in &self.viewers {
            match (&viewer.latency, viewer.excluded) {
                (_, true) => println!("  {}: excluded (no clock offset)", viewer.participant_id),
                (Some(stats), false) => println!(
                    "  {}: avg={}ms min={}ms max={}ms p50={}ms p95={}ms p99={}ms (n={})",
                    viewer.participant_id,
                    stats.avg_ms,
                    stats.min_ms,
                    stats.max_ms,
                    stats.p50_ms,
                    stats.p95_ms,
                    stats.p99_ms,
                    stats.count
                ),
                (None, false) => println!("  {}: no matched samples", viewer.participant_id),
            }
        }
        if let Some(overall) = &self.overall {
            println!(
                "  overall: avg={}ms p50={}ms p95={}ms p99={}ms (n={})",
                overall.avg_ms, overall.p50_ms, overall.p95_ms, overall.p99_ms, overall.count
            );
        }

        println!("\nSamples:");
        println!("  Total Captured: {}", self.total_samples);
        println!("  Unparsable Labels: {}", self.parse_failures());
        println!("  Out-of-order Rejected: {}", self.rejected_samples);
        println!("  Read Errors: {}", self.read_errors());
        for tally in self.capture.iter().filter(|t| t.read_errors > 0) {
            if let Some(id) = &tally.participant_id {
                println!("    {}: {} failed reads", id, tally.read_errors);
            }
        }
        if !self.export_errors.is_empty() {
            println!("  Export Errors: {}", self.export_errors.len());
        }
        if self.release_failures > 0 {
            println!("  Release Failures: {}", self.release_failures);
        }
        println!("===============================\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TimestampSample, VideoTag};

    fn observation(latency_ms: i64) -> LatencyObservation {
        let sample = |id: ParticipantId| TimestampSample {
            participant_id: id,
            video_tag: VideoTag::Local,
            captured_at_ms: 0,
            text: "0:00:00:000".to_string(),
        };
        LatencyObservation {
            presenter_sample: sample(ParticipantId::presenter()),
            viewer_sample: sample(ParticipantId::viewer(0)),
            latency_ms,
        }
    }

    #[test]
    fn test_latency_stats() {
        let samples: Vec<i64> = (1..=100).collect();
        let stats = LatencyStats::from_samples(&samples).unwrap();
        assert_eq!(stats.count, 100);
        assert_eq!(stats.min_ms, 1);
        assert_eq!(stats.max_ms, 100);
        assert_eq!(stats.avg_ms, 50);
        assert_eq!(stats.p50_ms, 51);
        assert_eq!(stats.p95_ms, 95);
        assert_eq!(stats.p99_ms, 99);
    }

    #[test]
    fn test_negative_latencies_and_empty_series() {
        let stats = LatencyStats::from_samples(&[-70, -50, -60]).unwrap();
        assert_eq!(stats.min_ms, -70);
        assert_eq!(stats.max_ms, -50);
        assert_eq!(stats.avg_ms, -60);
        assert!(LatencyStats::from_samples(&[]).is_none());
    }

    #[test]
    fn test_report_aggregates_viewers() {
        let mut outcomes = BTreeMap::new();
        outcomes.insert(
            ParticipantId::viewer(0),
            MatchOutcome {
                observations: vec![observation(40), observation(60)],
                parse_failures: vec!["garbage".to_string()],
                ..MatchOutcome::default()
            },
        );
        outcomes.insert(
            ParticipantId::viewer(1),
            MatchOutcome {
                excluded: Some(ParticipantId::viewer(1)),
                ..MatchOutcome::default()
            },
        );

        let report = SessionReport::new(Scenario::OneToMany, &outcomes, None, SyncOffsetTable::new());
        assert_eq!(report.viewers.len(), 2);
        assert_eq!(report.viewers[0].matched, 2);
        assert!(report.viewers[1].excluded);
        assert_eq!(report.overall.as_ref().unwrap().avg_ms, 50);
        assert_eq!(report.parse_failures(), 1);
        assert_eq!(report.observations[&ParticipantId::viewer(0)].len(), 2);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["scenario"], "one-to-many");
        assert_eq!(json["viewers"][0]["latency"]["p50Ms"], 60);
    }
}
