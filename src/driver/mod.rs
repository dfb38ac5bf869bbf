#![forbid(unsafe_code)]

// Collaborator seams - media session driver, instrumented pages and exporter.
// The harness only talks to the system under test through these traits.

use crate::types::{ChannelMode, Role, StatsSnapshot, StreamDirection, TimestampSample, VideoTag};
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

macro_rules! opaque_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn id(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

opaque_handle!(
    /// Media session (pipeline) on the system under test
    SessionHandle
);
opaque_handle!(
    /// The presenter's shared output every viewer attaches to
    SourceHandle
);
opaque_handle!(
    /// One viewer's attachment to the shared source
    ViewerHandle
);

/// Endpoint a page negotiates its stream against
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointHandle {
    Source(SourceHandle),
    Viewer(ViewerHandle),
}

impl EndpointHandle {
    pub fn id(&self) -> &str {
        match self {
            EndpointHandle::Source(h) => h.id(),
            EndpointHandle::Viewer(h) => h.id(),
        }
    }
}

/// Media session driver
#[async_trait]
pub trait MediaDriver: Send + Sync {
    async fn create_session(&self) -> Result<SessionHandle>;

    async fn connect_source(&self, session: &SessionHandle) -> Result<SourceHandle>;

    async fn attach_viewer(&self, session: &SessionHandle, source: &SourceHandle) -> Result<ViewerHandle>;

    async fn detach_viewer(&self, session: &SessionHandle, viewer: &ViewerHandle) -> Result<()>;

    async fn release_session(&self, session: &SessionHandle) -> Result<()>;
}

/// Instrumented page rendering one participant's stream
#[async_trait]
pub trait InstrumentedPage: Send + Sync {
    async fn init_stream(
        &self,
        endpoint: &EndpointHandle,
        channel: ChannelMode,
        direction: StreamDirection,
    ) -> Result<()>;

    async fn subscribe_event(&self, name: &str) -> Result<()>;

    async fn wait_for_event(&self, name: &str, timeout: Duration) -> Result<()>;

    /// Render the shared reference clock on `tag`
    async fn show_sync_overlay(&self, tag: VideoTag) -> Result<()>;

    /// Decoded text currently displayed by the sync overlay on `tag`
    async fn read_sync_overlay(&self, tag: VideoTag) -> Result<String>;

    async fn start_capture(&self) -> Result<()>;

    async fn end_capture(&self) -> Result<()>;

    /// Next decoded overlay frame, `None` if nothing new was captured
    async fn read_overlay_sample(&self) -> Result<Option<TimestampSample>>;

    async fn read_stats_snapshot(&self) -> Result<StatsSnapshot>;

    async fn close(&self) -> Result<()>;
}

/// Opens instrumented pages for participants
#[async_trait]
pub trait PageProvider: Send + Sync {
    /// `ordinal` is 0 for the presenter and the primary viewer, ramp index + 1 otherwise
    async fn open_page(&self, role: Role, ordinal: usize) -> Result<Arc<dyn InstrumentedPage>>;
}

/// Receives the finished, aggregated series
pub trait Exporter: Send + Sync {
    fn write_series(&self, name: &str, payload: &serde_json::Value) -> Result<()>;
}

/// Serialize and hand a series to an exporter
pub fn export_series<T: Serialize + ?Sized>(exporter: &dyn Exporter, name: &str, series: &T) -> Result<()> {
    let payload = serde_json::to_value(series)?;
    exporter.write_series(name, &payload)
}
