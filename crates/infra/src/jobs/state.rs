//! Lifecycle state machine of the job manager itself.
//!
//! ```text
//! CREATED ──▶ INITIALIZED ──▶ RUNNING ◀──▶ SUSPENDED
//!    │             │             │             │
//!    └─────────────┴─────────────┴─────────────┴──▶ SHUTDOWN (terminal)
//! ```
//!
//! RUNNING and SUSPENDED may also transition to themselves, which makes
//! repeated start/suspend commands harmless.

use serde::{Deserialize, Serialize};

use super::error::StateManagementError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManagerState {
    Created,
    Initialized,
    Running,
    Suspended,
    Shutdown,
}

impl ManagerState {
    pub const ALL: [ManagerState; 5] = [
        ManagerState::Created,
        ManagerState::Initialized,
        ManagerState::Running,
        ManagerState::Suspended,
        ManagerState::Shutdown,
    ];

    /// States reachable from this one in a single step.
    pub fn transitions(self) -> &'static [ManagerState] {
        use ManagerState::*;

        match self {
            Created => &[Initialized, Shutdown],
            Initialized => &[Running, Suspended, Shutdown],
            Running => &[Running, Suspended, Shutdown],
            Suspended => &[Running, Suspended, Shutdown],
            Shutdown => &[],
        }
    }

    pub fn is_valid_transition(self, target: ManagerState) -> bool {
        self.transitions().contains(&target)
    }

    pub fn is_terminal(self) -> bool {
        self.transitions().is_empty()
    }

    /// Move to `intended`, returning the state that was left.
    ///
    /// On an illegal transition `self` is not modified.
    pub fn transition_to(
        &mut self,
        intended: ManagerState,
    ) -> Result<ManagerState, StateManagementError> {
        if !self.is_valid_transition(intended) {
            return Err(StateManagementError::new(*self, intended));
        }
        Ok(std::mem::replace(self, intended))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ManagerState::Created => "CREATED",
            ManagerState::Initialized => "INITIALIZED",
            ManagerState::Running => "RUNNING",
            ManagerState::Suspended => "SUSPENDED",
            ManagerState::Shutdown => "SHUTDOWN",
        }
    }
}

impl std::fmt::Display for ManagerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
