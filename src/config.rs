#![forbid(unsafe_code)]

// Harness configuration - defaults, FANOUT_* environment overrides and validation

use crate::clock_sync::SyncSettings;
use crate::matcher::{MatchKey, MatchWindow};
use crate::ramp::RampPlan;
use crate::types::{ChannelMode, HarnessError, HarnessResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Session shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Scenario {
    /// Presenter and a single viewer
    OneToOne,
    /// Presenter, a measured primary viewer, then a ramped viewer population
    OneToMany,
}

/// Main harness configuration
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub scenario: Scenario,
    /// Total viewers including the primary one
    pub viewers: usize,
    pub ramp_interval: Duration,
    pub concurrency_limit: usize,
    pub play_duration: Duration,
    /// Bound on waiting for a page's `playing` event
    pub playing_timeout: Duration,
    pub channel: ChannelMode,
    pub sync: SyncSettings,
    pub match_window: MatchWindow,
    pub sample_interval: Duration,
    pub stats_interval: Duration,
    /// Bound on one overlay or stats read during capture
    pub read_timeout: Duration,
    /// Clock-sync and capture ramped viewers too, not just the primary one
    pub capture_ramped_viewers: bool,
    pub output_dir: PathBuf,
    pub run_name: String,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            scenario: Scenario::OneToMany,
            viewers: 30,
            ramp_interval: Duration::from_secs(1),
            concurrency_limit: 29,
            play_duration: Duration::from_secs(10),
            playing_timeout: Duration::from_secs(120),
            channel: ChannelMode::AudioAndVideo,
            sync: SyncSettings::default(),
            match_window: MatchWindow {
                key: MatchKey::CaptureTime,
                ..MatchWindow::default()
            },
            sample_interval: Duration::from_millis(100),
            stats_interval: Duration::from_secs(1),
            read_timeout: Duration::from_secs(2),
            capture_ramped_viewers: false,
            output_dir: PathBuf::from("results"),
            run_name: "one-to-many".to_string(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring invalid {}={}", name, raw);
            None
        }
    }
}

impl HarnessConfig {
    pub fn one_to_one() -> Self {
        Self {
            scenario: Scenario::OneToOne,
            viewers: 1,
            run_name: "one-to-one".to_string(),
            ..Self::default()
        }
    }

    /// Apply FANOUT_* environment overrides on top of the current values
    pub fn apply_env(mut self) -> Self {
        if let Some(v) = env_parse("FANOUT_VIEWERS") {
            self.viewers = v;
        }
        if let Some(ms) = env_parse::<u64>("FANOUT_RAMP_INTERVAL_MS") {
            self.ramp_interval = Duration::from_millis(ms);
        }
        if let Some(v) = env_parse("FANOUT_CONCURRENCY") {
            self.concurrency_limit = v;
        }
        if let Some(secs) = env_parse::<u64>("FANOUT_PLAY_SECS") {
            self.play_duration = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("FANOUT_PLAYING_TIMEOUT_SECS") {
            self.playing_timeout = Duration::from_secs(secs);
        }
        if let Some(attempts) = env_parse("FANOUT_SYNC_ATTEMPTS") {
            self.sync.max_attempts = attempts;
        }
        if let Ok(dir) = std::env::var("FANOUT_OUTPUT_DIR") {
            info!("Using FANOUT_OUTPUT_DIR={}", dir);
            self.output_dir = PathBuf::from(dir);
        }
        self
    }

    /// Ramp plan for the viewers beyond the primary one, if the scenario ramps
    pub fn ramp_plan(&self) -> Option<RampPlan> {
        match self.scenario {
            Scenario::OneToOne => None,
            Scenario::OneToMany => Some(RampPlan {
                target_population: self.viewers.saturating_sub(1),
                ramp_interval: self.ramp_interval,
                concurrency_limit: self.concurrency_limit,
            }),
        }
    }

    /// # Errors
    /// `SetupFailure` describing the first invalid setting
    pub fn validate(&self) -> HarnessResult<()> {
        let invalid = |msg: &str| Err(HarnessError::SetupFailure(format!("invalid configuration: {msg}")));
        if self.viewers == 0 {
            return invalid("at least one viewer is required");
        }
        if self.scenario == Scenario::OneToOne && self.viewers != 1 {
            return invalid("one-to-one sessions have exactly one viewer");
        }
        if self.sample_interval.is_zero() || self.stats_interval.is_zero() {
            return invalid("capture intervals must be positive");
        }
        if self.sync.max_attempts == 0 {
            return invalid("clock sync needs at least one attempt");
        }
        Ok(())
    }
}
