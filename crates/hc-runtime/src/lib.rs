//! Controller runtime for habctl
//!
//! One tokio task per active controller runs its step on a drift-free
//! periodic schedule. The runtime owns the activation state machine, the
//! pause/hold flags, failure containment and the command channel through
//! which settings and forced measurements reach a running loop.
//!
//! # Key Types
//!
//! - [`ControllerRuntime`] - activates, steers and stops controller loops
//! - [`ControllerFactory`] - builds a controller from its configuration
//! - [`TickSchedule`] - when the next step is due

mod runtime;
mod schedule;
mod slot;
mod task;

pub use runtime::{ControllerRuntime, CROSS_STOP_TIMEOUT, DEFAULT_MAX_CONSECUTIVE_FAILURES};
pub use schedule::TickSchedule;

use hc_config::ControllerConfig;
use hc_controllers::{Controller, ControllerError, ControllerResult};
use hc_core::InvalidTransition;
use std::time::Duration;
use thiserror::Error;

/// Builds controllers at activation time
pub trait ControllerFactory: Send + Sync {
    fn build(&self, config: &ControllerConfig) -> ControllerResult<Box<dyn Controller>>;
}

impl<F> ControllerFactory for F
where
    F: Fn(&ControllerConfig) -> ControllerResult<Box<dyn Controller>> + Send + Sync,
{
    fn build(&self, config: &ControllerConfig) -> ControllerResult<Box<dyn Controller>> {
        self(config)
    }
}

/// Errors from runtime operations
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("unknown controller '{0}'")]
    UnknownController(String),

    #[error("controller '{0}' is already active")]
    AlreadyActive(String),

    #[error("controller '{0}' is not active")]
    NotActive(String),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    #[error("activation of '{controller_id}' failed: {source}")]
    Activation {
        controller_id: String,
        #[source]
        source: ControllerError,
    },

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error("loop of controller '{0}' ended before replying")]
    LoopGone(String),

    #[error("controller '{0}' cannot wait on its own loop")]
    Reentrant(String),

    #[error("controller '{controller_id}' did not stop within {waited:?}")]
    StopTimeout {
        controller_id: String,
        waited: Duration,
    },
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
