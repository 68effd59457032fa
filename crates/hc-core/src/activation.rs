//! Controller activation state machine
//!
//! Enforces valid transitions of a controller's lifecycle:
//!
//! ```text
//! Inactive → Activating → Active ⇄ Paused
//!                 ↓          ⇅
//!              Inactive     Held
//!
//! Active/Paused/Held → Deactivating → Inactive
//! ```
//!
//! `Activating → Inactive` is the failed-initialization path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind of controller driving a loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerKind {
    Input,
    Pid,
    Function,
    Conditional,
    Trigger,
}

impl std::fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ControllerKind::Input => "input",
            ControllerKind::Pid => "pid",
            ControllerKind::Function => "function",
            ControllerKind::Conditional => "conditional",
            ControllerKind::Trigger => "trigger",
        };
        f.write_str(name)
    }
}

/// Activation state of a controller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationState {
    #[default]
    Inactive,
    Activating,
    Active,
    Paused,
    Held,
    Deactivating,
}

/// A state change the activation state machine forbids
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("controller cannot go from {from:?} to {to:?}: {reason}")]
pub struct InvalidTransition {
    pub from: ActivationState,
    pub to: ActivationState,
    pub reason: &'static str,
}

impl ActivationState {
    /// The state after moving to `to`, if that move is allowed
    pub fn try_transition(self, to: ActivationState) -> Result<ActivationState, InvalidTransition> {
        match refusal(self, to) {
            "" => Ok(to),
            reason => Err(InvalidTransition {
                from: self,
                to,
                reason,
            }),
        }
    }

    pub fn can_transition_to(self, to: ActivationState) -> bool {
        refusal(self, to).is_empty()
    }

    /// Whether a loop task exists for the controller in this state
    pub fn is_running(self) -> bool {
        matches!(
            self,
            ActivationState::Active | ActivationState::Paused | ActivationState::Held
        )
    }
}

/// Why `from -> to` is refused, empty when it is allowed
fn refusal(from: ActivationState, to: ActivationState) -> &'static str {
    use ActivationState::*;

    match (from, to) {
        (Inactive, Activating)
        | (Activating, Active | Inactive)
        | (Active, Paused | Held | Deactivating)
        | (Paused, Active | Held | Deactivating)
        | (Held, Active | Paused | Deactivating)
        | (Deactivating, Inactive) => "",
        (Inactive, Active) => "activation has not run",
        (Active | Paused | Held, Inactive) => "loop has not been stopped",
        (Active | Paused | Held, Activating) => "already active",
        (Activating, _) => "activation in progress",
        (Deactivating, _) => "deactivation in progress",
        (Inactive, _) => "not active",
        _ => "no such transition",
    }
}

/// Status snapshot of one controller, for UI/API consumption
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerStatus {
    pub controller_id: String,
    pub kind: ControllerKind,
    pub state: ActivationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_step: Option<DateTime<Utc>>,
    /// Kind-specific diagnostics (PID terms, autotune state, ...)
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl ControllerStatus {
    pub fn new(controller_id: impl Into<String>, kind: ControllerKind) -> Self {
        Self {
            controller_id: controller_id.into(),
            kind,
            state: ActivationState::Inactive,
            last_error: None,
            consecutive_failures: 0,
            last_step: None,
            detail: serde_json::Value::Null,
        }
    }

    pub fn activated(&self) -> bool {
        self.state.is_running()
    }

    pub fn paused(&self) -> bool {
        self.state == ActivationState::Paused
    }

    pub fn held(&self) -> bool {
        self.state == ActivationState::Held
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ActivationState::*;

    #[test]
    fn test_full_lifecycle_path() {
        let state = Inactive;
        let state = state.try_transition(Activating).unwrap();
        let state = state.try_transition(Active).unwrap();
        let state = state.try_transition(Paused).unwrap();
        let state = state.try_transition(Active).unwrap();
        let state = state.try_transition(Held).unwrap();
        let state = state.try_transition(Deactivating).unwrap();
        let state = state.try_transition(Inactive).unwrap();
        assert_eq!(state, Inactive);
    }

    #[test]
    fn test_failed_activation_returns_to_inactive() {
        assert!(Activating.can_transition_to(Inactive));
    }

    #[test]
    fn test_cannot_skip_activating() {
        let err = Inactive.try_transition(Active).unwrap_err();
        assert_eq!(err.from, Inactive);
        assert_eq!(err.to, Active);
        assert_eq!(err.reason, "activation has not run");
    }

    #[test]
    fn test_cannot_skip_deactivating() {
        assert!(!Active.can_transition_to(Inactive));
        assert!(!Paused.can_transition_to(Inactive));
    }

    #[test]
    fn test_no_double_activation() {
        assert!(!Active.can_transition_to(Activating));
        assert!(!Held.can_transition_to(Activating));
    }

    #[test]
    fn test_deactivating_is_one_way() {
        assert!(!Deactivating.can_transition_to(Active));
        assert!(!Deactivating.can_transition_to(Paused));
    }

    #[test]
    fn test_is_running() {
        assert!(Active.is_running());
        assert!(Paused.is_running());
        assert!(Held.is_running());
        assert!(!Inactive.is_running());
        assert!(!Activating.is_running());
        assert!(!Deactivating.is_running());
    }

    #[test]
    fn test_status_flags() {
        let mut status = ControllerStatus::new("pid_1", ControllerKind::Pid);
        assert!(!status.activated());

        status.state = Held;
        assert!(status.activated());
        assert!(status.held());
        assert!(!status.paused());
    }
}
