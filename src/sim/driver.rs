#![forbid(unsafe_code)]

// Simulated media session driver - one shared source per session, viewers
// attach to it, optional capacity limit and failure switches.

use crate::driver::{MediaDriver, SessionHandle, SourceHandle, ViewerHandle};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct SimDriverConfig {
    pub fail_create_session: bool,
    pub fail_connect_source: bool,
    /// Session release reports an error and leaves the session open
    pub fail_release_session: bool,
    /// Attaches beyond this many concurrent viewers are refused
    pub max_viewers: Option<usize>,
    pub attach_delay: Duration,
}

#[derive(Default)]
struct DriverState {
    sessions: HashSet<String>,
    sources: HashMap<String, String>,
    viewers: HashMap<String, String>,
    released: Vec<String>,
    total_attached: usize,
    total_detached: usize,
}

pub struct SimDriver {
    config: SimDriverConfig,
    state: Mutex<DriverState>,
}

impl SimDriver {
    pub fn new(config: SimDriverConfig) -> Self {
        Self {
            config,
            state: Mutex::new(DriverState::default()),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut DriverState) -> Result<R>) -> Result<R> {
        let mut state = self.state.lock().map_err(|_| anyhow!("driver state poisoned"))?;
        f(&mut state)
    }

    /// Viewers currently attached
    pub fn active_viewers(&self) -> usize {
        self.state.lock().map(|s| s.viewers.len()).unwrap_or(0)
    }

    pub fn total_attached(&self) -> usize {
        self.state.lock().map(|s| s.total_attached).unwrap_or(0)
    }

    pub fn total_detached(&self) -> usize {
        self.state.lock().map(|s| s.total_detached).unwrap_or(0)
    }

    pub fn open_sessions(&self) -> usize {
        self.state.lock().map(|s| s.sessions.len()).unwrap_or(0)
    }

    pub fn released_sessions(&self) -> Vec<String> {
        self.state.lock().map(|s| s.released.clone()).unwrap_or_default()
    }
}

impl Default for SimDriver {
    fn default() -> Self {
        Self::new(SimDriverConfig::default())
    }
}

#[async_trait]
impl MediaDriver for SimDriver {
    async fn create_session(&self) -> Result<SessionHandle> {
        if self.config.fail_create_session {
            bail!("media server unreachable");
        }
        let id = format!("session-{}", Uuid::new_v4());
        self.with_state(|s| {
            s.sessions.insert(id.clone());
            Ok(())
        })?;
        debug!("Created session {}", id);
        Ok(SessionHandle::new(id))
    }

    async fn connect_source(&self, session: &SessionHandle) -> Result<SourceHandle> {
        if self.config.fail_connect_source {
            bail!("presenter endpoint rejected");
        }
        let id = format!("source-{}", Uuid::new_v4());
        self.with_state(|s| {
            if !s.sessions.contains(session.id()) {
                bail!("unknown session {session}");
            }
            if s.sources.values().any(|owner| owner == session.id()) {
                bail!("session {session} already has a source");
            }
            s.sources.insert(id.clone(), session.id().to_string());
            Ok(())
        })?;
        Ok(SourceHandle::new(id))
    }

    async fn attach_viewer(&self, session: &SessionHandle, source: &SourceHandle) -> Result<ViewerHandle> {
        if !self.config.attach_delay.is_zero() {
            sleep(self.config.attach_delay).await;
        }
        let id = format!("viewer-ep-{}", Uuid::new_v4());
        self.with_state(|s| {
            if s.sources.get(source.id()).map(String::as_str) != Some(session.id()) {
                bail!("source {source} does not belong to session {session}");
            }
            if let Some(max) = self.config.max_viewers {
                if s.viewers.len() >= max {
                    bail!("viewer capacity {max} reached");
                }
            }
            s.viewers.insert(id.clone(), source.id().to_string());
            s.total_attached += 1;
            Ok(())
        })?;
        Ok(ViewerHandle::new(id))
    }

    async fn detach_viewer(&self, _session: &SessionHandle, viewer: &ViewerHandle) -> Result<()> {
        self.with_state(|s| {
            if s.viewers.remove(viewer.id()).is_none() {
                bail!("viewer {viewer} is not attached");
            }
            s.total_detached += 1;
            Ok(())
        })
    }

    async fn release_session(&self, session: &SessionHandle) -> Result<()> {
        if self.config.fail_release_session {
            bail!("media server refused to release {session}");
        }
        self.with_state(|s| {
            if !s.sessions.remove(session.id()) {
                bail!("unknown session {session}");
            }
            let sources: Vec<String> = s
                .sources
                .iter()
                .filter(|(_, owner)| owner.as_str() == session.id())
                .map(|(id, _)| id.clone())
                .collect();
            for source in &sources {
                s.sources.remove(source);
            }
            s.viewers.retain(|_, src| !sources.contains(src));
            s.released.push(session.id().to_string());
            Ok(())
        })
    }
}
