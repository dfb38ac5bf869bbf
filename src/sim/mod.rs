#![forbid(unsafe_code)]

// In-process collaborators - stand in for the media server, browsers and
// result sink so a full session can run without external infrastructure.

pub mod driver;
pub mod exporter;
pub mod page;

pub use driver::{SimDriver, SimDriverConfig};
pub use exporter::{JsonFileExporter, MemoryExporter};
pub use page::{SimPage, SimPageConfig, SimPageProvider};
