//! Daemon handle injected into actions and controllers
//!
//! Actions need to activate controllers, force measurements and adjust PID
//! loops. Rather than importing a process-wide singleton they receive a
//! [`DaemonHandle`], implemented by the daemon facade.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ControllerStatus, Measurement};

/// Errors returned through the daemon handle
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandleError {
    #[error("daemon is not available")]
    Unavailable,

    #[error("invalid PID setting '{field}': {reason}")]
    InvalidSetting { field: String, reason: String },

    #[error("{0}")]
    Failed(String),
}

pub type HandleResult<T> = Result<T, HandleError>;

/// Which side of the setpoint a controller acts on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Drive the raise output when below the setpoint
    #[default]
    Raise,
    /// Drive the lower output when above the setpoint
    Lower,
    /// Drive both outputs
    Both,
}

impl Direction {
    pub fn raises(self) -> bool {
        matches!(self, Direction::Raise | Direction::Both)
    }

    pub fn lowers(self) -> bool {
        matches!(self, Direction::Lower | Direction::Both)
    }
}

/// A PID field that may change while the controller is active
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "snake_case")]
pub enum PidSetting {
    Setpoint(f64),
    Kp(f64),
    Ki(f64),
    Kd(f64),
    IntegratorMin(f64),
    IntegratorMax(f64),
    Direction(Direction),
}

impl PidSetting {
    /// Build a setting from a field name and a loosely typed value
    pub fn parse(field: &str, value: &serde_json::Value) -> HandleResult<Self> {
        let invalid = |reason: &str| HandleError::InvalidSetting {
            field: field.to_string(),
            reason: reason.to_string(),
        };

        if field == "direction" {
            let direction: Direction = serde_json::from_value(value.clone())
                .map_err(|_| invalid("expected raise, lower or both"))?;
            return Ok(PidSetting::Direction(direction));
        }

        let number = match value {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
        .filter(|n| n.is_finite())
        .ok_or_else(|| invalid("expected a finite number"))?;

        match field {
            "setpoint" => Ok(PidSetting::Setpoint(number)),
            "kp" => Ok(PidSetting::Kp(number)),
            "ki" => Ok(PidSetting::Ki(number)),
            "kd" => Ok(PidSetting::Kd(number)),
            "integrator_min" => Ok(PidSetting::IntegratorMin(number)),
            "integrator_max" => Ok(PidSetting::IntegratorMax(number)),
            _ => Err(invalid("unknown field")),
        }
    }
}

/// Calls back into the daemon from actions and controllers
#[async_trait]
pub trait DaemonHandle: Send + Sync {
    async fn controller_activate(&self, controller_id: &str) -> HandleResult<()>;

    async fn controller_deactivate(&self, controller_id: &str) -> HandleResult<()>;

    async fn controller_pause(&self, controller_id: &str) -> HandleResult<()>;

    async fn controller_hold(&self, controller_id: &str) -> HandleResult<()>;

    async fn controller_resume(&self, controller_id: &str) -> HandleResult<()>;

    async fn pid_set(&self, controller_id: &str, setting: PidSetting) -> HandleResult<()>;

    /// Run an input's acquisition now and return what was stored
    async fn input_force_measurements(&self, controller_id: &str) -> HandleResult<Vec<Measurement>>;

    fn controller_status(&self, controller_id: &str) -> HandleResult<ControllerStatus>;
}
