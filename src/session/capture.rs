#![forbid(unsafe_code)]

// Capture pumps - one ticker loop per measured page feeding overlay samples
// and stats snapshots into the shared aggregator until cancelled.

use crate::driver::InstrumentedPage;
use crate::metrics::MetricsAggregator;
use crate::types::{HarnessError, ParticipantId};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct CaptureSettings {
    pub sample_interval: Duration,
    pub stats_interval: Duration,
    /// Bound on a single page read
    pub read_timeout: Duration,
}

/// Counters for one finished pump
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureTally {
    pub participant_id: Option<ParticipantId>,
    pub samples: u64,
    pub snapshots: u64,
    pub read_errors: u64,
    pub rejected: u64,
}

pub async fn capture_loop(
    participant_id: ParticipantId,
    page: Arc<dyn InstrumentedPage>,
    aggregator: Arc<MetricsAggregator>,
    settings: CaptureSettings,
    cancel_token: CancellationToken,
) -> CaptureTally {
    let mut samples = tokio::time::interval(settings.sample_interval);
    samples.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut stats = tokio::time::interval(settings.stats_interval);
    stats.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut tally = CaptureTally {
        participant_id: Some(participant_id.clone()),
        ..CaptureTally::default()
    };

    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                debug!("{}: capture loop shutting down", participant_id);
                break;
            }
            _ = samples.tick() => {
                match tokio::time::timeout(settings.read_timeout, page.read_overlay_sample()).await {
                    Ok(Ok(Some(sample))) => match aggregator.record(&participant_id, sample) {
                        Ok(()) => tally.samples += 1,
                        Err(HarnessError::OutOfOrderSample { .. }) => tally.rejected += 1,
                        Err(e) => {
                            warn!("{}: sample dropped: {}", participant_id, e);
                            break;
                        }
                    },
                    Ok(Ok(None)) => {}
                    Ok(Err(err)) => {
                        tally.read_errors += 1;
                        debug!("{}: overlay read failed: {err:#}", participant_id);
                    }
                    Err(_) => {
                        tally.read_errors += 1;
                        warn!("{}: overlay read timeout (> {}ms)", participant_id, settings.read_timeout.as_millis());
                    }
                }
            }
            _ = stats.tick() => {
                match tokio::time::timeout(settings.read_timeout, page.read_stats_snapshot()).await {
                    Ok(Ok(snapshot)) => match aggregator.record_stats(&participant_id, snapshot) {
                        Ok(()) => tally.snapshots += 1,
                        Err(HarnessError::OutOfOrderSample { .. }) => tally.rejected += 1,
                        Err(e) => {
                            warn!("{}: stats dropped: {}", participant_id, e);
                            break;
                        }
                    },
                    Ok(Err(err)) => {
                        tally.read_errors += 1;
                        debug!("{}: stats read failed: {err:#}", participant_id);
                    }
                    Err(_) => tally.read_errors += 1,
                }
            }
        }
    }
    tally
}

/// Every pump started for a session, stopped together
pub struct CaptureSet {
    aggregator: Arc<MetricsAggregator>,
    settings: CaptureSettings,
    cancel_token: CancellationToken,
    handles: Mutex<Vec<JoinHandle<CaptureTally>>>,
}

impl CaptureSet {
    pub fn new(aggregator: Arc<MetricsAggregator>, settings: CaptureSettings) -> Self {
        Self {
            aggregator,
            settings,
            cancel_token: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Start a pump for one page. Ignored once the set is stopped.
    pub fn spawn(&self, participant_id: ParticipantId, page: Arc<dyn InstrumentedPage>) {
        if self.cancel_token.is_cancelled() {
            warn!("{}: capture set already stopped", participant_id);
            return;
        }
        let handle = tokio::spawn(capture_loop(
            participant_id,
            page,
            self.aggregator.clone(),
            self.settings,
            self.cancel_token.child_token(),
        ));
        self.handles.lock().unwrap_or_else(|e| e.into_inner()).push(handle);
    }

    pub fn len(&self) -> usize {
        self.handles.lock().map(|h| h.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every pump and wait for all of them to exit
    pub async fn stop(&self) -> Vec<CaptureTally> {
        self.cancel_token.cancel();
        let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(|e| e.into_inner()));

        let mut tallies = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(tally) => tallies.push(tally),
                Err(e) => warn!("Capture task aborted: {}", e),
            }
        }
        info!(
            "Capture stopped: {} pumps, {} samples",
            tallies.len(),
            tallies.iter().map(|t| t.samples).sum::<u64>()
        );
        tallies
    }
}
