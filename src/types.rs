#![forbid(unsafe_code)]

// Common types and error handling shared by the harness modules

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Error taxonomy for a harness session.
///
/// `SetupFailure` and `StateError` are fatal. Everything else is recorded
/// next to the successful results and surfaced in the report.
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Setup failure: {0}")]
    SetupFailure(String),

    #[error("Ramp attempt {index} failed: {reason}")]
    RampAttemptFailure { index: usize, reason: String },

    #[error("Clock sync timed out for {participant} after {attempts} attempts")]
    SyncTimeout { participant: ParticipantId, attempts: u32 },

    #[error("Unparsable overlay timestamp {text:?}: {reason}")]
    ParseFailure { text: String, reason: String },

    #[error("Invalid state: {0}")]
    StateError(String),

    #[error("Out-of-order sample for {participant}: {captured_at_ms} < {last_ms}")]
    OutOfOrderSample {
        participant: ParticipantId,
        captured_at_ms: i64,
        last_ms: i64,
    },

    #[error("Export error: {0}")]
    Export(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl HarnessError {
    /// Fatal errors abort the session and skip export.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HarnessError::SetupFailure(_) | HarnessError::StateError(_))
    }
}

/// Result type alias for harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Stable participant identifier (`presenter`, `viewer-0`, `viewer-1`, ...)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn presenter() -> Self {
        Self("presenter".to_string())
    }

    /// Viewer 0 is the primary viewer; ramped viewers start at 1.
    pub fn viewer(n: usize) -> Self {
        Self(format!("viewer-{n}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    Presenter,
    Viewer,
}

/// Video element the overlay is read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VideoTag {
    Local,
    Remote,
}

impl VideoTag {
    pub fn id(&self) -> &'static str {
        match self {
            VideoTag::Local => "local",
            VideoTag::Remote => "remote",
        }
    }

    /// Presenters render their own camera; viewers render what they receive.
    pub fn for_role(role: Role) -> Self {
        match role {
            Role::Presenter => VideoTag::Local,
            Role::Viewer => VideoTag::Remote,
        }
    }
}

/// One decoded overlay reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimestampSample {
    pub participant_id: ParticipantId,
    pub video_tag: VideoTag,
    /// Milliseconds since the Unix epoch when the frame was grabbed
    pub captured_at_ms: i64,
    pub text: String,
}

/// Keyed peer-connection statistics taken at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub captured_at_ms: i64,
    pub values: BTreeMap<String, String>,
}

/// A matched presenter/viewer pair.
///
/// `latency_ms` is presenter time minus viewer time after clock offsets are
/// removed, so a viewer showing a later label yields a negative value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyObservation {
    pub presenter_sample: TimestampSample,
    pub viewer_sample: TimestampSample,
    pub latency_ms: i64,
}

/// Media channels negotiated on a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelMode {
    AudioAndVideo,
    VideoOnly,
    AudioOnly,
}

/// Direction of a participant's stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamDirection {
    SendOnly,
    RecvOnly,
    SendRecv,
}

impl StreamDirection {
    pub fn for_role(role: Role) -> Self {
        match role {
            Role::Presenter => StreamDirection::SendOnly,
            Role::Viewer => StreamDirection::RecvOnly,
        }
    }
}
