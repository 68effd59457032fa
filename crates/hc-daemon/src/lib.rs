//! habctl daemon
//!
//! Wires the configuration, output arbiter, measurement store, action
//! pipeline and controller runtime into one [`Daemon`], the facade through
//! which callers (and action chains, via [`hc_core::DaemonHandle`]) steer
//! controllers and outputs.
//!
//! ```ignore
//! let config = hc_config::load_config("habctl.yaml")?;
//! let daemon = DaemonBuilder::new(config).build();
//! daemon.start().await;
//! ```

mod daemon;
mod factory;

pub use daemon::{Daemon, DaemonBuilder, DAEMON_ORIGIN, DEFAULT_SHUTDOWN_GRACE};
pub use factory::{DaemonControllerFactory, SensorMaker};

use hc_config::ConfigError;
use hc_core::{ControllerKind, HandleError};
use hc_output::OutputError;
use hc_runtime::RuntimeError;
use thiserror::Error;

/// Errors from daemon commands
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Output(#[from] OutputError),

    #[error(transparent)]
    Handle(#[from] HandleError),

    #[error("unknown controller '{0}'")]
    UnknownController(String),

    #[error("controller '{controller_id}' is a {actual} controller, not {expected}")]
    WrongKind {
        controller_id: String,
        expected: ControllerKind,
        actual: ControllerKind,
    },

    #[error("controller '{0}' must be deactivated first")]
    ControllerActive(String),

    #[error("action task failed: {0}")]
    Task(String),
}

pub type DaemonResult<T> = Result<T, DaemonError>;

impl From<DaemonError> for HandleError {
    fn from(err: DaemonError) -> Self {
        match err {
            DaemonError::Handle(inner) => inner,
            other => HandleError::Failed(other.to_string()),
        }
    }
}
