#![forbid(unsafe_code)]

// Exporters - pretty JSON files on disk, or an in-memory log for tests

use crate::driver::Exporter;
use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::info;

/// Writes each series to `<dir>/<prefix>-<name>.json`
pub struct JsonFileExporter {
    dir: PathBuf,
    prefix: String,
}

impl JsonFileExporter {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}-{}.json", self.prefix, name))
    }
}

impl Exporter for JsonFileExporter {
    fn write_series(&self, name: &str, payload: &serde_json::Value) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let path = self.path_for(name);
        let json = serde_json::to_string_pretty(payload)?;
        std::fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))?;
        info!("Series {} saved to: {}", name, path.display());
        Ok(())
    }
}

/// Keeps every written series in memory
#[derive(Default)]
pub struct MemoryExporter {
    writes: Mutex<Vec<(String, serde_json::Value)>>,
}

impl MemoryExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn names(&self) -> Vec<String> {
        self.writes
            .lock()
            .map(|w| w.iter().map(|(name, _)| name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn series(&self, name: &str) -> Option<serde_json::Value> {
        self.writes
            .lock()
            .ok()?
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.names().is_empty()
    }
}

impl Exporter for MemoryExporter {
    fn write_series(&self, name: &str, payload: &serde_json::Value) -> Result<()> {
        self.writes
            .lock()
            .map_err(|_| anyhow!("export log poisoned"))?
            .push((name.to_string(), payload.clone()));
        Ok(())
    }
}
