#![forbid(unsafe_code)]

// Session orchestration - drives one presenter and its viewers through
// setup, clock sync, capture, ramp-up, draining and export.

pub mod capture;
pub mod state;

pub use capture::{CaptureSet, CaptureSettings, CaptureTally};
pub use state::{CapturePhase, SessionState, StateTrail};

use crate::clock_sync::{ClockSyncEngine, SyncOffsetTable, SyncTarget};
use crate::config::HarnessConfig;
use crate::driver::{
    export_series, EndpointHandle, Exporter, InstrumentedPage, MediaDriver, PageProvider, SessionHandle,
    SourceHandle, ViewerHandle,
};
use crate::matcher::SampleMatcher;
use crate::metrics::MetricsAggregator;
use crate::overlay::ReferenceClock;
use crate::ramp::{RampController, RampPlan, RampReport};
use crate::report::{RampSummary, SessionReport};
use crate::types::{ChannelMode, HarnessError, HarnessResult, ParticipantId, Role, StreamDirection, VideoTag};
use anyhow::Context;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const PLAYING_EVENT: &str = "playing";

/// A connected presenter or viewer and the page observing it
#[derive(Clone)]
pub struct Participant {
    pub id: ParticipantId,
    pub role: Role,
    pub endpoint: EndpointHandle,
    pub page: Arc<dyn InstrumentedPage>,
    /// Clock-synced and captured, not just load
    pub measured: bool,
}

impl Participant {
    fn sync_target(&self) -> SyncTarget {
        SyncTarget {
            participant_id: self.id.clone(),
            page: self.page.clone(),
            tag: VideoTag::for_role(self.role),
        }
    }
}

/// Everything the orchestrator talks to outside itself
#[derive(Clone)]
pub struct Collaborators {
    pub driver: Arc<dyn MediaDriver>,
    pub pages: Arc<dyn PageProvider>,
    pub exporter: Arc<dyn Exporter>,
    pub clock: Arc<dyn ReferenceClock>,
}

#[derive(Default)]
struct Resources {
    session: Option<SessionHandle>,
    source: Option<SourceHandle>,
    participants: Vec<Participant>,
}

struct RampedViewer {
    participant: Participant,
    sync: Option<HarnessResult<i64>>,
}

/// Shared by every ramp worker
struct RampContext {
    driver: Arc<dyn MediaDriver>,
    pages: Arc<dyn PageProvider>,
    sync: Arc<ClockSyncEngine>,
    session: SessionHandle,
    source: SourceHandle,
    channel: ChannelMode,
    playing_timeout: Duration,
    /// Present when ramped viewers are measured too
    capture: Option<Arc<CaptureSet>>,
}

impl RampContext {
    async fn connect_viewer(&self, ordinal: usize) -> anyhow::Result<RampedViewer> {
        let id = ParticipantId::viewer(ordinal);
        let viewer = self
            .driver
            .attach_viewer(&self.session, &self.source)
            .await
            .with_context(|| format!("attach {id}"))?;

        let page = match self.pages.open_page(Role::Viewer, ordinal).await {
            Ok(page) => page,
            Err(e) => {
                self.detach(&viewer).await;
                return Err(e.context(format!("open page for {id}")));
            }
        };

        let participant = Participant {
            id,
            role: Role::Viewer,
            endpoint: EndpointHandle::Viewer(viewer.clone()),
            page,
            measured: self.capture.is_some(),
        };
        match self.bring_up(&participant).await {
            Ok(sync) => Ok(RampedViewer { participant, sync }),
            Err(e) => {
                if let Err(close_err) = participant.page.close().await {
                    warn!("{}: page close failed: {:#}", participant.id, close_err);
                }
                self.detach(&viewer).await;
                Err(e)
            }
        }
    }

    async fn bring_up(&self, participant: &Participant) -> anyhow::Result<Option<HarnessResult<i64>>> {
        let sync = match &self.capture {
            Some(_) => Some(self.sync.sync_one(&participant.sync_target()).await),
            None => None,
        };
        start_stream(participant, self.channel, self.playing_timeout)
            .await
            .with_context(|| format!("{} never started playing", participant.id))?;

        if let Some(capture) = &self.capture {
            participant.page.start_capture().await?;
            capture.spawn(participant.id.clone(), participant.page.clone());
        }
        Ok(sync)
    }

    async fn detach(&self, viewer: &ViewerHandle) {
        if let Err(e) = self.driver.detach_viewer(&self.session, viewer).await {
            warn!("Failed to detach {}: {:#}", viewer, e);
        }
    }
}

async fn start_stream(
    participant: &Participant,
    channel: ChannelMode,
    playing_timeout: Duration,
) -> anyhow::Result<()> {
    let page = &participant.page;
    page.subscribe_event(PLAYING_EVENT).await?;
    page.init_stream(&participant.endpoint, channel, StreamDirection::for_role(participant.role))
        .await?;
    page.wait_for_event(PLAYING_EVENT, playing_timeout).await
}

fn setup_failure(step: &str, err: anyhow::Error) -> HarnessError {
    HarnessError::SetupFailure(format!("{step}: {err:#}"))
}

fn export_error(name: &str, result: anyhow::Result<()>) -> Option<String> {
    let err = HarnessError::Export(format!("{name}: {:#}", result.err()?));
    warn!("{}", err);
    Some(err.to_string())
}

pub struct SessionOrchestrator {
    config: HarnessConfig,
    collab: Collaborators,
    sync: Arc<ClockSyncEngine>,
    trail: StateTrail,
    shutdown: CancellationToken,
}

impl SessionOrchestrator {
    pub fn new(config: HarnessConfig, collab: Collaborators) -> Self {
        let sync = Arc::new(ClockSyncEngine::new(collab.clock.clone(), config.sync));
        Self {
            config,
            collab,
            sync,
            trail: StateTrail::default(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelling the token cuts the steady capture phase short
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn state(&self) -> SessionState {
        self.trail.current()
    }

    pub fn trail(&self) -> &[SessionState] {
        self.trail.visited()
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            sample_interval: self.config.sample_interval,
            stats_interval: self.config.stats_interval,
            read_timeout: self.config.read_timeout,
        }
    }

    /// Run the whole session once.
    ///
    /// # Errors
    /// A fatal error (setup failure, presenter or primary viewer clock sync
    /// failure, illegal state transition) releases every resource, leaves the
    /// session `Closed` and skips export. Non-fatal problems end up in the
    /// report. A session whose teardown could not be confirmed stays
    /// `Exported`.
    pub async fn run(&mut self) -> HarnessResult<SessionReport> {
        if self.trail.current() != SessionState::Init {
            return Err(HarnessError::StateError(format!(
                "session already ran (state {})",
                self.trail.current()
            )));
        }

        let started = Instant::now();
        let aggregator = Arc::new(MetricsAggregator::new());
        let capture = Arc::new(CaptureSet::new(aggregator.clone(), self.capture_settings()));
        let mut res = Resources::default();

        let offsets = match self.setup(&mut res, &capture).await {
            Ok(offsets) => offsets,
            Err(e) => {
                error!("Session setup failed: {}", e);
                self.abort(&mut res, &capture).await;
                return Err(e);
            }
        };
        let primary_setup_ms = started.elapsed().as_millis() as u64;
        info!("Presenter and primary viewer capturing after {}ms", primary_setup_ms);

        match self.capture_and_export(&mut res, &capture, &aggregator, offsets).await {
            Ok(mut report) => {
                report.primary_setup_ms = primary_setup_ms;
                report.final_state = self.trail.current();
                Ok(report)
            }
            Err(e) => {
                error!("Session aborted: {}", e);
                self.abort(&mut res, &capture).await;
                Err(e)
            }
        }
    }

    /// Init and Syncing: connect presenter and primary viewer, sync their
    /// clocks, bring both streams to `playing` and start capturing.
    async fn setup(&mut self, res: &mut Resources, capture: &CaptureSet) -> HarnessResult<SyncOffsetTable> {
        self.config.validate()?;
        let driver = self.collab.driver.clone();
        let pages = self.collab.pages.clone();

        let session = driver
            .create_session()
            .await
            .map_err(|e| setup_failure("create session", e))?;
        res.session = Some(session.clone());
        let source = driver
            .connect_source(&session)
            .await
            .map_err(|e| setup_failure("connect presenter", e))?;
        res.source = Some(source.clone());

        let presenter_page = pages
            .open_page(Role::Presenter, 0)
            .await
            .map_err(|e| setup_failure("open presenter page", e))?;
        res.participants.push(Participant {
            id: ParticipantId::presenter(),
            role: Role::Presenter,
            endpoint: EndpointHandle::Source(source.clone()),
            page: presenter_page,
            measured: true,
        });

        let viewer = driver
            .attach_viewer(&session, &source)
            .await
            .map_err(|e| setup_failure("attach primary viewer", e))?;
        let viewer_page = match pages.open_page(Role::Viewer, 0).await {
            Ok(page) => page,
            Err(e) => {
                if let Err(detach_err) = driver.detach_viewer(&session, &viewer).await {
                    warn!("Failed to detach {}: {:#}", viewer, detach_err);
                }
                return Err(setup_failure("open primary viewer page", e));
            }
        };
        res.participants.push(Participant {
            id: ParticipantId::viewer(0),
            role: Role::Viewer,
            endpoint: EndpointHandle::Viewer(viewer),
            page: viewer_page,
            measured: true,
        });

        self.trail.advance(SessionState::Syncing)?;
        let targets: Vec<SyncTarget> = res.participants.iter().map(Participant::sync_target).collect();
        let offsets = self.sync.synchronize(&targets).await;
        if let Some((id, reason)) = offsets.failures().iter().next() {
            return Err(HarnessError::SetupFailure(format!("{id} clock sync failed: {reason}")));
        }

        for participant in &res.participants {
            start_stream(participant, self.config.channel, self.config.playing_timeout)
                .await
                .map_err(|e| setup_failure(&format!("start {} stream", participant.id), e))?;
        }
        for participant in &res.participants {
            participant
                .page
                .start_capture()
                .await
                .map_err(|e| setup_failure(&format!("start {} capture", participant.id), e))?;
            capture.spawn(participant.id.clone(), participant.page.clone());
        }
        Ok(offsets)
    }

    async fn capture_and_export(
        &mut self,
        res: &mut Resources,
        capture: &Arc<CaptureSet>,
        aggregator: &MetricsAggregator,
        mut offsets: SyncOffsetTable,
    ) -> HarnessResult<SessionReport> {
        let ramp = match self.config.ramp_plan() {
            Some(plan) => {
                self.trail.advance(SessionState::Capturing(CapturePhase::Ramping))?;
                let report = self.ramp(plan, res, capture).await?;
                let summary = RampSummary::from_report(&report);
                for slot in report.slots {
                    if let Ok(viewer) = slot.result {
                        if let Some(outcome) = &viewer.sync {
                            offsets.record(viewer.participant.id.clone(), outcome);
                        }
                        res.participants.push(viewer.participant);
                    }
                }
                self.trail.advance(SessionState::Capturing(CapturePhase::Steady))?;
                Some(summary)
            }
            None => {
                self.trail.advance(SessionState::Capturing(CapturePhase::Steady))?;
                None
            }
        };

        tokio::select! {
            _ = sleep(self.config.play_duration) => {}
            _ = self.shutdown.cancelled() => info!("Shutdown requested, ending capture early"),
        }

        self.trail.advance(SessionState::Draining)?;
        let tallies = capture.stop().await;
        let measured_viewers: Vec<ParticipantId> = res
            .participants
            .iter()
            .filter(|p| p.measured && p.role == Role::Viewer)
            .map(|p| p.id.clone())
            .collect();
        for participant in res.participants.iter().filter(|p| p.measured) {
            if let Err(e) = participant.page.end_capture().await {
                warn!("{}: end capture failed: {:#}", participant.id, e);
            }
        }
        let metrics = aggregator.finalize();
        let release_failures = self.release(res).await;

        let matcher = SampleMatcher::new(self.config.match_window);
        let presenter = ParticipantId::presenter();
        let presenter_samples = metrics.samples(&presenter);
        let outcomes: BTreeMap<_, _> = measured_viewers
            .into_iter()
            .map(|id| {
                let outcome = matcher.match_series(
                    (&presenter, presenter_samples),
                    (&id, metrics.samples(&id)),
                    &offsets,
                );
                (id, outcome)
            })
            .collect();

        let mut report = SessionReport::new(self.config.scenario, &outcomes, ramp, offsets);
        report.total_samples = metrics.total_samples();
        report.rejected_samples = aggregator.rejected();
        report.capture = tallies;
        report.release_failures = release_failures;

        let exporter = self.collab.exporter.clone();
        report.export_errors = [
            ("ocr", export_series(exporter.as_ref(), "ocr", &metrics.ocr_series)),
            ("stats", export_series(exporter.as_ref(), "stats", &metrics.stats_series)),
            ("latency", export_series(exporter.as_ref(), "latency", &report.observations)),
        ]
        .into_iter()
        .filter_map(|(name, result)| export_error(name, result))
        .collect();
        if let Some(err) = export_error("summary", export_series(exporter.as_ref(), "summary", &report)) {
            report.export_errors.push(err);
        }

        self.trail.advance(SessionState::Exported)?;
        if release_failures > 0 {
            warn!("{} teardown call(s) failed, session left {}", release_failures, self.trail.current());
            return Ok(report);
        }
        self.trail.advance(SessionState::Closed)?;
        Ok(report)
    }

    /// Capturing(Ramping): grow the viewer population behind the ramp barrier
    async fn ramp(
        &self,
        plan: RampPlan,
        res: &Resources,
        capture: &Arc<CaptureSet>,
    ) -> HarnessResult<RampReport<RampedViewer>> {
        let (Some(session), Some(source)) = (res.session.clone(), res.source.clone()) else {
            return Err(HarnessError::StateError("ramp without a connected source".to_string()));
        };
        let ctx = Arc::new(RampContext {
            driver: self.collab.driver.clone(),
            pages: self.collab.pages.clone(),
            sync: self.sync.clone(),
            session,
            source,
            channel: self.config.channel,
            playing_timeout: self.config.playing_timeout,
            capture: self.config.capture_ramped_viewers.then(|| capture.clone()),
        });

        let controller = RampController::new(plan);
        Ok(controller
            .ramp_up(|index| {
                let ctx = ctx.clone();
                // Ordinal 0 is the primary viewer
                async move { ctx.connect_viewer(index + 1).await }
            })
            .await)
    }

    /// Close pages, detach viewers and release the session. Returns how many
    /// of those calls failed; each failure is logged.
    async fn release(&self, res: &mut Resources) -> usize {
        let session = res.session.take();
        res.source = None;
        let mut failures = 0;

        for participant in res.participants.drain(..).rev() {
            if let Err(e) = participant.page.close().await {
                warn!("{}: page close failed: {:#}", participant.id, e);
                failures += 1;
            }
            if let (EndpointHandle::Viewer(viewer), Some(session)) = (&participant.endpoint, &session) {
                if let Err(e) = self.collab.driver.detach_viewer(session, viewer).await {
                    warn!("Failed to detach {}: {:#}", participant.id, e);
                    failures += 1;
                }
            }
        }

        if let Some(session) = session {
            match self.collab.driver.release_session(&session).await {
                Ok(()) => info!("Released session {}", session),
                Err(e) => {
                    warn!("Failed to release session {}: {:#}", session, e);
                    failures += 1;
                }
            }
        }
        failures
    }

    /// Fatal path: stop capture, release everything, end `Closed` without export
    async fn abort(&mut self, res: &mut Resources, capture: &CaptureSet) {
        capture.stop().await;
        let failures = self.release(res).await;
        if failures > 0 {
            warn!("{} teardown call(s) failed while aborting", failures);
        }
        if matches!(self.trail.current(), SessionState::Capturing(_)) {
            let _ = self.trail.advance(SessionState::Draining);
        }
        if let Err(e) = self.trail.advance(SessionState::Closed) {
            warn!("Session could not close cleanly: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Scenario;
    use crate::overlay::{OverlayTime, RuntimeClock};
    use crate::sim::{MemoryExporter, SimDriver, SimDriverConfig, SimPageProvider};
    use CapturePhase::*;
    use SessionState::*;

    struct Rig {
        driver: Arc<SimDriver>,
        pages: Arc<SimPageProvider>,
        exporter: Arc<MemoryExporter>,
    }

    impl Rig {
        fn new(driver_config: SimDriverConfig, configure: impl FnOnce(&mut SimPageProvider)) -> Self {
            let clock = Arc::new(RuntimeClock::starting_at(
                OverlayTime::from_hms_milli(10, 0, 0, 0),
                1_700_000_000_000,
            ));
            let mut pages = SimPageProvider::new(clock).with_viewer_lag(80, 0);
            configure(&mut pages);
            Self {
                driver: Arc::new(SimDriver::new(driver_config)),
                pages: Arc::new(pages),
                exporter: Arc::new(MemoryExporter::new()),
            }
        }

        fn orchestrator(&self, config: HarnessConfig) -> SessionOrchestrator {
            let clock = Arc::new(RuntimeClock::starting_at(
                OverlayTime::from_hms_milli(10, 0, 0, 0),
                1_700_000_000_000,
            ));
            SessionOrchestrator::new(
                config,
                Collaborators {
                    driver: self.driver.clone(),
                    pages: self.pages.clone(),
                    exporter: self.exporter.clone(),
                    clock,
                },
            )
        }

        fn assert_released(&self) {
            assert_eq!(self.driver.active_viewers(), 0);
            assert_eq!(self.driver.open_sessions(), 0);
            assert_eq!(self.driver.released_sessions().len(), 1);
            assert!(self.pages.opened_pages().iter().all(|p| p.is_closed()));
        }
    }

    fn config(viewers: usize) -> HarnessConfig {
        HarnessConfig {
            viewers,
            ramp_interval: Duration::from_millis(100),
            play_duration: Duration::from_secs(1),
            playing_timeout: Duration::from_secs(2),
            ..HarnessConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_to_many_happy_path() {
        let rig = Rig::new(SimDriverConfig::default(), |_| {});
        let mut orchestrator = rig.orchestrator(config(4));
        let report = orchestrator.run().await.unwrap();

        assert_eq!(
            orchestrator.trail(),
            &[Init, Syncing, Capturing(Ramping), Capturing(Steady), Draining, Exported, Closed]
        );
        assert_eq!(report.final_state, Closed);
        assert_eq!(report.scenario, Scenario::OneToMany);

        let ramp = report.ramp.as_ref().unwrap();
        assert_eq!(ramp.attempted, 3);
        assert_eq!(ramp.succeeded, 3);
        assert!(ramp.failures.is_empty());

        // Ramped viewers are load only by default
        assert_eq!(report.viewers.len(), 1);
        let primary = &report.viewers[0];
        assert_eq!(primary.participant_id, ParticipantId::viewer(0));
        let stats = primary.latency.as_ref().unwrap();
        assert!(stats.count >= 10);
        assert_eq!(stats.min_ms, 80);
        assert_eq!(stats.max_ms, 80);

        assert_eq!(rig.exporter.names(), vec!["ocr", "stats", "latency", "summary"]);
        let summary = rig.exporter.series("summary").unwrap();
        assert_eq!(summary["ramp"]["succeeded"], 3);
        assert_eq!(rig.driver.total_attached(), 4);
        rig.assert_released();
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_to_one_skips_ramp() {
        let rig = Rig::new(SimDriverConfig::default(), |_| {});
        let config = HarnessConfig {
            play_duration: Duration::from_millis(500),
            ..HarnessConfig::one_to_one()
        };
        let mut orchestrator = rig.orchestrator(config);
        let report = orchestrator.run().await.unwrap();

        assert_eq!(orchestrator.trail(), &[Init, Syncing, Capturing(Steady), Draining, Exported, Closed]);
        assert!(report.ramp.is_none());
        assert_eq!(report.viewers.len(), 1);
        assert!(report.overall.is_some());
        rig.assert_released();
    }

    #[tokio::test(start_paused = true)]
    async fn test_presenter_sync_failure_is_fatal() {
        let rig = Rig::new(SimDriverConfig::default(), |pages| {
            pages.unreadable_overlays.insert((Role::Presenter, 0));
        });
        let mut orchestrator = rig.orchestrator(config(4));
        let err = orchestrator.run().await.unwrap_err();

        assert!(matches!(err, HarnessError::SetupFailure(_)));
        assert_eq!(orchestrator.trail(), &[Init, Syncing, Closed]);
        assert!(rig.exporter.is_empty());
        assert_eq!(rig.driver.total_attached(), 1);
        rig.assert_released();
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_creation_failure_is_fatal() {
        let rig = Rig::new(
            SimDriverConfig {
                fail_create_session: true,
                ..SimDriverConfig::default()
            },
            |_| {},
        );
        let mut orchestrator = rig.orchestrator(config(2));
        let err = orchestrator.run().await.unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(orchestrator.state(), Closed);
        assert_eq!(orchestrator.trail(), &[Init, Closed]);
        assert!(rig.exporter.is_empty());
        assert!(rig.pages.opened_pages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramp_failures_are_reported_not_fatal() {
        let rig = Rig::new(SimDriverConfig::default(), |pages| {
            pages.unavailable_viewers.insert(2);
            pages.stalled_viewers.insert(3);
        });
        let mut orchestrator = rig.orchestrator(config(5));
        let report = orchestrator.run().await.unwrap();

        let ramp = report.ramp.as_ref().unwrap();
        assert_eq!(ramp.attempted, 4);
        assert_eq!(ramp.succeeded, 2);
        let failed: Vec<usize> = ramp.failures.iter().map(|f| f.index).collect();
        assert_eq!(failed, vec![1, 2]);

        assert_eq!(rig.driver.total_attached(), 5);
        assert_eq!(rig.driver.total_detached(), 5);
        assert!(rig.exporter.series("summary").is_some());
        rig.assert_released();
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_viewer_sync_failure_is_fatal() {
        let rig = Rig::new(SimDriverConfig::default(), |pages| {
            pages.unreadable_overlays.insert((Role::Viewer, 0));
        });
        let mut orchestrator = rig.orchestrator(config(3));
        let err = orchestrator.run().await.unwrap_err();

        match err {
            HarnessError::SetupFailure(msg) => assert!(msg.contains("viewer-0")),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(orchestrator.trail(), &[Init, Syncing, Closed]);
        assert!(rig.exporter.is_empty());
        assert_eq!(rig.driver.total_attached(), 1);
        rig.assert_released();
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_read_errors_reach_the_report() {
        let rig = Rig::new(SimDriverConfig::default(), |pages| {
            pages.failing_stats.insert((Role::Viewer, 0));
        });
        let mut orchestrator = rig.orchestrator(config(1));
        let report = orchestrator.run().await.unwrap();

        assert_eq!(report.final_state, Closed);
        assert_eq!(report.capture.len(), 2);
        let viewer = report
            .capture
            .iter()
            .find(|t| t.participant_id == Some(ParticipantId::viewer(0)))
            .unwrap();
        assert!(viewer.read_errors > 0);
        assert_eq!(viewer.snapshots, 0);
        assert!(viewer.samples > 0);
        assert_eq!(report.read_errors(), viewer.read_errors);
        assert!(report.viewers[0].latency.is_some());

        let summary = rig.exporter.series("summary").unwrap();
        assert_eq!(summary["capture"].as_array().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_teardown_stays_exported() {
        let rig = Rig::new(
            SimDriverConfig {
                fail_release_session: true,
                ..SimDriverConfig::default()
            },
            |_| {},
        );
        let mut orchestrator = rig.orchestrator(config(2));
        let report = orchestrator.run().await.unwrap();

        assert_eq!(report.release_failures, 1);
        assert_eq!(report.final_state, Exported);
        assert_eq!(orchestrator.state(), Exported);
        assert!(!orchestrator.trail().contains(&Closed));
        assert_eq!(rig.driver.open_sessions(), 1);
        assert!(rig.exporter.series("summary").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_measured_ramped_viewers() {
        let rig = Rig::new(SimDriverConfig::default(), |_| {});
        let config = HarnessConfig {
            capture_ramped_viewers: true,
            ..config(3)
        };
        let mut orchestrator = rig.orchestrator(config);
        let report = orchestrator.run().await.unwrap();

        let ids: Vec<&ParticipantId> = report.viewers.iter().map(|v| &v.participant_id).collect();
        assert_eq!(ids, vec![&ParticipantId::viewer(0), &ParticipantId::viewer(1), &ParticipantId::viewer(2)]);
        assert!(report.viewers.iter().all(|v| v.matched > 0));
        assert!(report.sync.is_synced(&ParticipantId::viewer(2)));
        rig.assert_released();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cuts_capture_short() {
        let rig = Rig::new(SimDriverConfig::default(), |_| {});
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let config = HarnessConfig {
            play_duration: Duration::from_secs(3600),
            ..config(1)
        };
        let mut orchestrator = rig.orchestrator(config).with_shutdown(shutdown);
        let report = orchestrator.run().await.unwrap();

        assert_eq!(report.final_state, Closed);
        rig.assert_released();
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_run_is_state_error() {
        let rig = Rig::new(SimDriverConfig::default(), |_| {});
        let mut orchestrator = rig.orchestrator(config(1));
        orchestrator.run().await.unwrap();

        let err = orchestrator.run().await.unwrap_err();
        assert!(matches!(err, HarnessError::StateError(_)));
    }
}
