#![forbid(unsafe_code)]

// Fan-out latency harness - one presenter, many viewers, end-to-end latency
// measured from clock overlays burned into the presenter's video

pub mod clock_sync;
pub mod config;
pub mod driver;
pub mod matcher;
pub mod metrics;
pub mod overlay;
pub mod ramp;
pub mod report;
pub mod session;
pub mod sim;
pub mod types;

pub use config::{HarnessConfig, Scenario};
pub use session::{Collaborators, SessionOrchestrator, SessionState};
pub use types::{HarnessError, HarnessResult};
