#![forbid(unsafe_code)]

// Simulated instrumented page - renders the reference clock (skewed, lagged
// and jittered per participant) and serves decoded overlay frames.

use crate::driver::{EndpointHandle, InstrumentedPage, PageProvider};
use crate::overlay::ReferenceClock;
use crate::types::{
    ChannelMode, ParticipantId, Role, StatsSnapshot, StreamDirection, TimestampSample, VideoTag,
};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rand::Rng;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Behaviour of one simulated page
#[derive(Debug, Clone)]
pub struct SimPageConfig {
    pub participant_id: ParticipantId,
    pub role: Role,
    /// How far a viewer's rendered overlay trails the presenter's
    pub lag_ms: u64,
    /// Uniform +/- noise added to every viewer frame
    pub jitter_ms: u64,
    /// Constant error of this page's overlay clock
    pub clock_skew_ms: i64,
    /// Number of initial sync overlay reads that fail
    pub sync_read_failures: u32,
    /// Decode time after the overlay text was grabbed
    pub sync_read_delay: Duration,
    /// Every stats read fails
    pub fail_stats: bool,
    pub playing_delay: Duration,
    pub fail_playing: bool,
    /// Every n-th captured frame decodes to garbage
    pub garble_every: Option<u64>,
}

impl SimPageConfig {
    pub fn new(participant_id: ParticipantId, role: Role) -> Self {
        Self {
            participant_id,
            role,
            lag_ms: 0,
            jitter_ms: 0,
            clock_skew_ms: 0,
            sync_read_failures: 0,
            sync_read_delay: Duration::ZERO,
            fail_stats: false,
            playing_delay: Duration::ZERO,
            fail_playing: false,
            garble_every: None,
        }
    }
}

#[derive(Default)]
struct PageState {
    endpoint: Option<EndpointHandle>,
    subscribed: HashSet<String>,
    overlays: HashSet<VideoTag>,
    sync_reads: u32,
    capturing: bool,
    frames: u64,
    closed: bool,
}

pub struct SimPage {
    config: SimPageConfig,
    clock: Arc<dyn ReferenceClock>,
    state: Mutex<PageState>,
}

impl SimPage {
    pub fn new(config: SimPageConfig, clock: Arc<dyn ReferenceClock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(PageState::default()),
        }
    }

    pub fn participant_id(&self) -> &ParticipantId {
        &self.config.participant_id
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut PageState) -> Result<R>) -> Result<R> {
        let mut state = self.state.lock().map_err(|_| anyhow!("page state poisoned"))?;
        if state.closed {
            bail!("page {} is closed", self.config.participant_id);
        }
        f(&mut state)
    }

    fn peek<R: Default>(&self, f: impl FnOnce(&PageState) -> R) -> R {
        self.state.lock().map(|s| f(&s)).unwrap_or_default()
    }

    pub fn sync_reads(&self) -> u32 {
        self.peek(|s| s.sync_reads)
    }

    pub fn captured_frames(&self) -> u64 {
        self.peek(|s| s.frames)
    }

    pub fn is_capturing(&self) -> bool {
        self.peek(|s| s.capturing)
    }

    pub fn is_closed(&self) -> bool {
        self.peek(|s| s.closed)
    }

    fn frame_offset_ms(&self) -> i64 {
        let mut offset = self.config.clock_skew_ms;
        if self.config.role == Role::Viewer {
            offset -= self.config.lag_ms as i64;
            if self.config.jitter_ms > 0 {
                let j = self.config.jitter_ms as i64;
                offset += rand::thread_rng().gen_range(-j..=j);
            }
        }
        offset
    }
}

#[async_trait]
impl InstrumentedPage for SimPage {
    async fn init_stream(
        &self,
        endpoint: &EndpointHandle,
        channel: ChannelMode,
        direction: StreamDirection,
    ) -> Result<()> {
        debug!(
            "{}: init stream on {} ({:?}, {:?})",
            self.config.participant_id,
            endpoint.id(),
            channel,
            direction
        );
        self.with_state(|s| {
            s.endpoint = Some(endpoint.clone());
            Ok(())
        })
    }

    async fn subscribe_event(&self, name: &str) -> Result<()> {
        self.with_state(|s| {
            s.subscribed.insert(name.to_string());
            Ok(())
        })
    }

    async fn wait_for_event(&self, name: &str, timeout: Duration) -> Result<()> {
        self.with_state(|s| {
            if !s.subscribed.contains(name) {
                bail!("not subscribed to {name}");
            }
            if s.endpoint.is_none() {
                bail!("stream not initialised");
            }
            Ok(())
        })?;

        if self.config.fail_playing || self.config.playing_delay > timeout {
            sleep(timeout).await;
            bail!(
                "{}: timed out after {}ms waiting for {}",
                self.config.participant_id,
                timeout.as_millis(),
                name
            );
        }
        sleep(self.config.playing_delay).await;
        Ok(())
    }

    async fn show_sync_overlay(&self, tag: VideoTag) -> Result<()> {
        self.with_state(|s| {
            s.overlays.insert(tag);
            Ok(())
        })
    }

    async fn read_sync_overlay(&self, tag: VideoTag) -> Result<String> {
        let attempt = self.with_state(|s| {
            s.sync_reads += 1;
            Ok(s.sync_reads)
        })?;

        let grabbed = self.with_state(|s| {
            if !s.overlays.contains(&tag) {
                bail!("no sync overlay on {}", tag.id());
            }
            Ok(self.clock.time_of_day().shifted(self.config.clock_skew_ms).to_string())
        })?;

        if !self.config.sync_read_delay.is_zero() {
            sleep(self.config.sync_read_delay).await;
        }
        if attempt <= self.config.sync_read_failures {
            bail!("overlay on {} not readable yet", tag.id());
        }
        Ok(grabbed)
    }

    async fn start_capture(&self) -> Result<()> {
        self.with_state(|s| {
            s.capturing = true;
            Ok(())
        })
    }

    async fn end_capture(&self) -> Result<()> {
        self.with_state(|s| {
            s.capturing = false;
            Ok(())
        })
    }

    async fn read_overlay_sample(&self) -> Result<Option<TimestampSample>> {
        let offset = self.frame_offset_ms();
        self.with_state(|s| {
            if !s.capturing {
                return Ok(None);
            }
            s.frames += 1;

            let mut text = self.clock.time_of_day().shifted(offset).to_string();
            if matches!(self.config.garble_every, Some(n) if n > 0 && s.frames % n == 0) {
                text = text.replacen(':', ";", 1);
            }

            Ok(Some(TimestampSample {
                participant_id: self.config.participant_id.clone(),
                video_tag: VideoTag::for_role(self.config.role),
                captured_at_ms: self.clock.wall_clock_ms(),
                text,
            }))
        })
    }

    async fn read_stats_snapshot(&self) -> Result<StatsSnapshot> {
        let captured_at_ms = self.clock.wall_clock_ms();
        self.with_state(|s| {
            if self.config.fail_stats {
                bail!("stats unavailable on {}", self.config.participant_id);
            }
            let mut values = BTreeMap::new();
            let frames = s.frames.to_string();
            match self.config.role {
                Role::Presenter => {
                    values.insert("framesSent".to_string(), frames);
                    values.insert("packetsSent".to_string(), (s.frames * 3).to_string());
                }
                Role::Viewer => {
                    values.insert("framesDecoded".to_string(), frames);
                    values.insert("packetsReceived".to_string(), (s.frames * 3).to_string());
                    values.insert("jitterMs".to_string(), self.config.jitter_ms.to_string());
                }
            }
            Ok(StatsSnapshot { captured_at_ms, values })
        })
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| anyhow!("page state poisoned"))?;
        state.capturing = false;
        state.closed = true;
        Ok(())
    }
}

/// Page factory with per-ordinal failure injection
pub struct SimPageProvider {
    clock: Arc<dyn ReferenceClock>,
    /// Applied to every viewer page
    pub viewer_lag_ms: u64,
    pub viewer_jitter_ms: u64,
    /// Viewer ordinals whose page cannot be opened
    pub unavailable_viewers: HashSet<usize>,
    /// Viewer ordinals that never reach `playing`
    pub stalled_viewers: HashSet<usize>,
    /// Ordinals (presenter included as 0 with `Role::Presenter`) whose overlay never reads
    pub unreadable_overlays: HashSet<(Role, usize)>,
    pub skew_ms: BTreeMap<(Role, usize), i64>,
    /// Pages whose stats reads always fail
    pub failing_stats: HashSet<(Role, usize)>,
    pub garble_every: Option<u64>,
    opened: Mutex<Vec<Arc<SimPage>>>,
}

impl SimPageProvider {
    pub fn new(clock: Arc<dyn ReferenceClock>) -> Self {
        Self {
            clock,
            viewer_lag_ms: 0,
            viewer_jitter_ms: 0,
            unavailable_viewers: HashSet::new(),
            stalled_viewers: HashSet::new(),
            unreadable_overlays: HashSet::new(),
            skew_ms: BTreeMap::new(),
            failing_stats: HashSet::new(),
            garble_every: None,
            opened: Mutex::new(Vec::new()),
        }
    }

    pub fn with_viewer_lag(mut self, lag_ms: u64, jitter_ms: u64) -> Self {
        self.viewer_lag_ms = lag_ms;
        self.viewer_jitter_ms = jitter_ms;
        self
    }

    /// Every page opened so far, in opening order
    pub fn opened_pages(&self) -> Vec<Arc<SimPage>> {
        self.opened.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn page(&self, participant: &ParticipantId) -> Option<Arc<SimPage>> {
        self.opened_pages()
            .into_iter()
            .find(|p| p.participant_id() == participant)
    }
}

#[async_trait]
impl PageProvider for SimPageProvider {
    async fn open_page(&self, role: Role, ordinal: usize) -> Result<Arc<dyn InstrumentedPage>> {
        let participant_id = match role {
            Role::Presenter => ParticipantId::presenter(),
            Role::Viewer => ParticipantId::viewer(ordinal),
        };
        if role == Role::Viewer && self.unavailable_viewers.contains(&ordinal) {
            bail!("no browser available for {participant_id}");
        }

        let config = SimPageConfig {
            lag_ms: self.viewer_lag_ms,
            jitter_ms: self.viewer_jitter_ms,
            clock_skew_ms: self.skew_ms.get(&(role, ordinal)).copied().unwrap_or(0),
            sync_read_failures: if self.unreadable_overlays.contains(&(role, ordinal)) { u32::MAX } else { 0 },
            fail_playing: role == Role::Viewer && self.stalled_viewers.contains(&ordinal),
            fail_stats: self.failing_stats.contains(&(role, ordinal)),
            garble_every: self.garble_every,
            ..SimPageConfig::new(participant_id, role)
        };

        let page = Arc::new(SimPage::new(config, self.clock.clone()));
        self.opened
            .lock()
            .map_err(|_| anyhow!("page registry poisoned"))?
            .push(page.clone());
        Ok(page)
    }
}
