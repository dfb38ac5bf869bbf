#![forbid(unsafe_code)]

//! Fan-out latency harness binary
//!
//! Usage:
//!   cargo run -- --scenario one-to-one --play-secs 20
//!   cargo run -- --viewers 30 --ramp-interval-ms 1000 --lag-ms 120 --jitter-ms 15

use anyhow::Result;
use clap::Parser;
use fanout_latency::config::{HarnessConfig, Scenario};
use fanout_latency::matcher::MatchKey;
use fanout_latency::overlay::RuntimeClock;
use fanout_latency::session::{Collaborators, SessionOrchestrator};
use fanout_latency::sim::{JsonFileExporter, SimDriver, SimPageProvider};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "fanout-latency")]
#[command(about = "Measure presenter-to-viewer latency while ramping a viewer population", long_about = None)]
struct Args {
    #[arg(long, value_enum, default_value = "one-to-many")]
    scenario: Scenario,

    /// Total viewers, the primary one included
    #[arg(long)]
    viewers: Option<usize>,

    #[arg(long)]
    ramp_interval_ms: Option<u64>,

    #[arg(long)]
    concurrency: Option<usize>,

    #[arg(long)]
    play_secs: Option<u64>,

    /// Also clock-sync and capture the ramped viewers
    #[arg(long)]
    capture_ramped: bool,

    /// Match on overlay labels instead of capture instants
    #[arg(long)]
    match_overlay_text: bool,

    #[arg(short, long, env = "FANOUT_OUTPUT_DIR")]
    output: Option<PathBuf>,

    /// Simulated viewer lag behind the presenter
    #[arg(long, default_value = "100")]
    lag_ms: u64,

    #[arg(long, default_value = "10")]
    jitter_ms: u64,
}

impl Args {
    fn into_config(self) -> HarnessConfig {
        let mut config = match self.scenario {
            Scenario::OneToOne => HarnessConfig::one_to_one(),
            Scenario::OneToMany => HarnessConfig::default(),
        }
        .apply_env();

        if let Some(viewers) = self.viewers {
            config.viewers = viewers;
        }
        if let Some(ms) = self.ramp_interval_ms {
            config.ramp_interval = Duration::from_millis(ms);
        }
        if let Some(limit) = self.concurrency {
            config.concurrency_limit = limit;
        }
        if let Some(secs) = self.play_secs {
            config.play_duration = Duration::from_secs(secs);
        }
        if let Some(dir) = self.output {
            config.output_dir = dir;
        }
        if self.match_overlay_text {
            config.match_window.key = MatchKey::OverlayText;
        }
        config.capture_ramped_viewers = self.capture_ramped;
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fanout_latency=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let (lag_ms, jitter_ms) = (args.lag_ms, args.jitter_ms);
    let config = args.into_config();
    info!(
        "Fan-out latency harness - {:?}, {} viewer(s), {}s play",
        config.scenario,
        config.viewers,
        config.play_duration.as_secs()
    );

    let clock = Arc::new(RuntimeClock::from_system());
    let pages = SimPageProvider::new(clock.clone()).with_viewer_lag(lag_ms, jitter_ms);
    let exporter = JsonFileExporter::new(&config.output_dir, &config.run_name);
    let collab = Collaborators {
        driver: Arc::new(SimDriver::default()),
        pages: Arc::new(pages),
        exporter: Arc::new(exporter),
        clock,
    };

    let shutdown = CancellationToken::new();
    let mut orchestrator = SessionOrchestrator::new(config, collab).with_shutdown(shutdown.clone());

    let run = orchestrator.run();
    tokio::pin!(run);
    let result = tokio::select! {
        result = &mut run => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, draining session...");
            shutdown.cancel();
            run.await
        }
    };

    match result {
        Ok(report) => {
            report.print_summary();
            info!("Session finished");
            Ok(())
        }
        Err(e) => {
            error!("Session failed: {}", e);
            Err(e.into())
        }
    }
}
