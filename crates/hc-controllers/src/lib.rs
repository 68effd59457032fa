//! Controllers for habctl
//!
//! Each controller kind implements [`Controller`]: one `step` per tick of
//! its loop, plus optional `initialize` and `stop` hooks. The runtime owns
//! scheduling, pause/hold flags and failure containment; controllers only
//! read measurements, command outputs and run their action chains through
//! the [`ControllerEnv`] they are handed.
//!
//! # Key Types
//!
//! - [`Controller`] - one loop's behavior
//! - [`ControllerEnv`] - store, arbiter and action pipeline for one controller
//! - [`Tick`] - timing and flags of one step
//! - [`build_controller`] - controller for a configuration

pub mod algorithms;
mod conditional;
mod controller;
mod derived;
mod factory;
mod function;
mod input;
mod pid;
mod trigger;

pub use conditional::ConditionalController;
pub use controller::{Controller, ControllerEnv, StepOutcome, Tick};
pub use derived::{
    DifferenceController, RedundancyController, StatisticsController, VerificationController,
    VpdController,
};
pub use factory::build_controller;
pub use function::{AutotuneController, BangBangController, BangBangPwmController};
pub use input::{
    CommandSensor, InputController, LoadavgSensor, RawMeasurement, Sensor, SensorError,
    StaticSensor,
};
pub use pid::PidController;
pub use trigger::{
    DailyTimePointTrigger, DailyTimeSpanTrigger, DurationTimerTrigger, OutputStateTrigger,
};

use hc_actions::ExpressionError;
use hc_measurement_store::StoreError;
use hc_output::OutputError;
use thiserror::Error;

/// Errors raised inside a controller step or hook
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Output(#[from] OutputError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error(transparent)]
    Sensor(#[from] SensorError),

    #[error("{0} is not supported by this controller")]
    Unsupported(&'static str),

    #[error("panicked: {0}")]
    Panicked(String),
}

pub type ControllerResult<T> = Result<T, ControllerError>;
