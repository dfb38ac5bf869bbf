#![forbid(unsafe_code)]

// Session lifecycle states and the transitions allowed between them

use crate::types::{HarnessError, HarnessResult};
use serde::Serialize;
use std::fmt;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CapturePhase {
    /// Viewer population is still growing
    Ramping,
    Steady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Init,
    Syncing,
    Capturing(CapturePhase),
    Draining,
    Exported,
    Closed,
}

impl SessionState {
    /// Forward edges of the lifecycle plus the fatal-teardown edges into `Closed`
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use CapturePhase::*;
        use SessionState::*;
        matches!(
            (self, next),
            (Init, Syncing)
                | (Syncing, Capturing(_))
                | (Capturing(Ramping), Capturing(Steady))
                | (Capturing(_), Draining)
                | (Draining, Exported)
                | (Exported, Closed)
                | (Init | Syncing | Draining, Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Closed
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Init => f.write_str("init"),
            SessionState::Syncing => f.write_str("syncing"),
            SessionState::Capturing(CapturePhase::Ramping) => f.write_str("capturing (ramping)"),
            SessionState::Capturing(CapturePhase::Steady) => f.write_str("capturing (steady)"),
            SessionState::Draining => f.write_str("draining"),
            SessionState::Exported => f.write_str("exported"),
            SessionState::Closed => f.write_str("closed"),
        }
    }
}

/// Current state plus every state visited, in order
#[derive(Debug, Clone)]
pub struct StateTrail {
    current: SessionState,
    visited: Vec<SessionState>,
}

impl Default for StateTrail {
    fn default() -> Self {
        Self {
            current: SessionState::Init,
            visited: vec![SessionState::Init],
        }
    }
}

impl StateTrail {
    pub fn current(&self) -> SessionState {
        self.current
    }

    pub fn visited(&self) -> &[SessionState] {
        &self.visited
    }

    /// # Errors
    /// `StateError` for an edge the lifecycle does not allow
    pub fn advance(&mut self, next: SessionState) -> HarnessResult<()> {
        if !self.current.can_transition_to(next) {
            return Err(HarnessError::StateError(format!(
                "cannot move from {} to {}",
                self.current, next
            )));
        }
        info!("Session state: {} -> {}", self.current, next);
        self.current = next;
        self.visited.push(next);
        Ok(())
    }
}
