#![forbid(unsafe_code)]

// Viewer ramp-up - rate-gated, concurrency-bounded connection attempts joined
// behind a single barrier.

use crate::types::{HarnessError, HarnessResult};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Immutable population growth plan for one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RampPlan {
    pub target_population: usize,
    /// Minimum spacing between two attempt starts
    pub ramp_interval: Duration,
    /// Maximum attempts in flight
    pub concurrency_limit: usize,
}

/// Outcome of one dispatched attempt, stored at its dispatch index
#[derive(Debug)]
pub struct RampSlot<T> {
    pub index: usize,
    /// Offset from ramp start to the moment the attempt was launched
    pub dispatched_after: Duration,
    /// Launch to completion
    pub setup_time: Duration,
    pub result: HarnessResult<T>,
}

/// A failed slot, detached from the generic payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RampFailure {
    pub index: usize,
    pub reason: String,
}

/// Every slot of a finished ramp, in dispatch order
#[derive(Debug)]
pub struct RampReport<T> {
    pub slots: Vec<RampSlot<T>>,
    pub elapsed: Duration,
}

impl<T> RampReport<T> {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.slots.iter().filter(|s| s.result.is_ok()).count()
    }

    pub fn failures(&self) -> Vec<RampFailure> {
        self.slots
            .iter()
            .filter_map(|slot| match &slot.result {
                Err(e) => Some(RampFailure { index: slot.index, reason: e.to_string() }),
                Ok(_) => None,
            })
            .collect()
    }

    /// Setup times of successful attempts, in milliseconds
    pub fn setup_times_ms(&self) -> Vec<u64> {
        self.slots
            .iter()
            .filter(|s| s.result.is_ok())
            .map(|s| s.setup_time.as_millis() as u64)
            .collect()
    }
}

pub struct RampController {
    plan: RampPlan,
}

impl RampController {
    pub fn new(plan: RampPlan) -> Self {
        Self { plan }
    }

    pub fn plan(&self) -> &RampPlan {
        &self.plan
    }

    /// Launch `target_population` attempts and wait for all of them.
    ///
    /// Attempt starts are spaced by at least `ramp_interval` and never more
    /// than `concurrency_limit` run at once. Failures (including panics) land
    /// in their own slot and do not stop the ramp.
    pub async fn ramp_up<T, F, Fut>(&self, connect: F) -> RampReport<T>
    where
        T: Send + 'static,
        F: Fn(usize) -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let target = self.plan.target_population;
        let limit = self.plan.concurrency_limit.max(1);
        let start = Instant::now();

        info!(
            "Ramping {} viewers (interval {}ms, concurrency {})",
            target,
            self.plan.ramp_interval.as_millis(),
            limit
        );

        let semaphore = Arc::new(Semaphore::new(limit));
        let mut slots: Vec<Option<RampSlot<T>>> = (0..target).map(|_| None).collect();
        let mut in_flight: Vec<(usize, Duration, JoinHandle<(anyhow::Result<T>, Duration)>)> =
            Vec::with_capacity(target);
        let mut next_start = start;

        for index in 0..target {
            sleep_until(next_start).await;

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    slots[index] = Some(RampSlot {
                        index,
                        dispatched_after: start.elapsed(),
                        setup_time: Duration::ZERO,
                        result: Err(HarnessError::RampAttemptFailure { index, reason: e.to_string() }),
                    });
                    continue;
                }
            };

            let dispatched = Instant::now();
            next_start = dispatched + self.plan.ramp_interval;
            debug!("Dispatching ramp attempt {} at +{}ms", index, (dispatched - start).as_millis());

            let attempt = connect(index);
            let handle = tokio::spawn(async move {
                let _permit = permit;
                let launched = Instant::now();
                let result = attempt.await;
                (result, launched.elapsed())
            });
            in_flight.push((index, dispatched - start, handle));
        }

        // Join barrier: every launched attempt, not just the last one
        for (index, dispatched_after, handle) in in_flight {
            let (result, setup_time) = match handle.await {
                Ok((Ok(value), setup_time)) => (Ok(value), setup_time),
                Ok((Err(e), setup_time)) => {
                    warn!("Ramp attempt {} failed: {:#}", index, e);
                    (
                        Err(HarnessError::RampAttemptFailure { index, reason: format!("{e:#}") }),
                        setup_time,
                    )
                }
                Err(e) => {
                    warn!("Ramp attempt {} aborted: {}", index, e);
                    (
                        Err(HarnessError::RampAttemptFailure { index, reason: format!("worker aborted: {e}") }),
                        Duration::ZERO,
                    )
                }
            };
            slots[index] = Some(RampSlot { index, dispatched_after, setup_time, result });
        }

        let report = RampReport {
            slots: slots.into_iter().flatten().collect(),
            elapsed: start.elapsed(),
        };
        info!(
            "Ramp finished in {}ms: {}/{} viewers connected",
            report.elapsed.as_millis(),
            report.succeeded(),
            target
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    fn plan(target: usize, interval_ms: u64, limit: usize) -> RampPlan {
        RampPlan {
            target_population: target,
            ramp_interval: Duration::from_millis(interval_ms),
            concurrency_limit: limit,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_attempt_gets_a_slot() {
        let controller = RampController::new(plan(7, 10, 3));
        let report = controller
            .ramp_up(|i| async move {
                if i % 3 == 0 {
                    anyhow::bail!("viewer {i} refused");
                }
                Ok(i)
            })
            .await;

        assert_eq!(report.len(), 7);
        assert_eq!(report.succeeded(), 4);
        let failed: Vec<usize> = report.failures().iter().map(|f| f.index).collect();
        assert_eq!(failed, vec![0, 3, 6]);
        assert!(matches!(
            report.slots[3].result,
            Err(HarnessError::RampAttemptFailure { index: 3, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_order_survives_reordered_completion() {
        let n = 6;
        let controller = RampController::new(plan(n, 5, n));
        let report = controller
            .ramp_up(move |i| async move {
                // Earlier attempts finish last
                sleep(Duration::from_millis(((n - i) * 100) as u64)).await;
                Ok(i * 10)
            })
            .await;

        let values: Vec<usize> = report.slots.iter().map(|s| *s.result.as_ref().unwrap()).collect();
        assert_eq!(values, vec![0, 10, 20, 30, 40, 50]);
        for (i, slot) in report.slots.iter().enumerate() {
            assert_eq!(slot.index, i);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_gate_spacing() {
        let interval = Duration::from_millis(250);
        let controller = RampController::new(plan(5, 250, 5));
        let report = controller.ramp_up(|i| async move { Ok(i) }).await;

        for pair in report.slots.windows(2) {
            assert!(pair[1].dispatched_after - pair[0].dispatched_after >= interval);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_bound() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let controller = RampController::new(plan(10, 1, 2));

        let report = controller
            .ramp_up(|_| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(50)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert_eq!(report.succeeded(), 10);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_barrier_waits_for_slow_attempts() {
        let controller = RampController::new(plan(3, 10, 3));
        let report = controller
            .ramp_up(|i| async move {
                if i == 0 {
                    sleep(Duration::from_secs(5)).await;
                }
                Ok(i)
            })
            .await;

        assert!(report.elapsed >= Duration::from_secs(5));
        assert_eq!(report.slots[0].setup_time, Duration::from_secs(5));
        assert_eq!(report.succeeded(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_worker_is_a_failed_slot() {
        let controller = RampController::new(plan(3, 1, 3));
        let report = controller
            .ramp_up(|i| async move {
                if i == 1 {
                    panic!("worker blew up");
                }
                Ok(i)
            })
            .await;

        assert_eq!(report.len(), 3);
        assert_eq!(report.succeeded(), 2);
        assert!(report.slots[1].result.is_err());
    }

    #[tokio::test]
    async fn test_empty_plan() {
        let controller = RampController::new(plan(0, 1000, 0));
        let report = controller.ramp_up(|i| async move { Ok(i) }).await;
        assert!(report.is_empty());
    }
}
