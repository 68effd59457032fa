//! Configuration for habctl
//!
//! The daemon is configured from one YAML file (plus anything it includes)
//! deserialized into typed option sets per controller and action kind.
//! Loading validates references and ranges up front so that a controller
//! can only fail activation on conditions that depend on runtime state.
//!
//! ```ignore
//! let config = hc_config::load_config("/etc/habctl/habctl.yaml")?;
//! let shared = hc_config::SharedConfig::new(config);
//! ```

mod actions;
mod controllers;
mod daemon;
mod error;
mod loader;
mod provider;
mod secrets;
mod validate;

pub use actions::{ActionConfig, ActionKind, LogLevel};
pub use controllers::{
    AutotuneOptions, BangBangOptions, BangBangPwmOptions, ConditionConfig, ConditionalOptions,
    ControllerConfig, ControllerOptions, DifferenceOptions, InputOptions,
    OutputStateTriggerOptions, PidOptions, PidOutputConfig, RedundancyOptions, SensorConfig,
    StaticValue, Statistic, StatisticsOptions, TimerDailyTimePointOptions,
    TimerDailyTimeSpanOptions, TimerDurationOptions, VerificationOptions, VpdOptions,
};
pub use daemon::{
    secs, DaemonConfig, DaemonSettings, MeasurementRef, OutputConfig, OutputDriverConfig,
    OutputRef,
};
pub use error::{ConfigError, ConfigResult};
pub use loader::{load_config, ConfigLoader};
pub use provider::{ConfigProvider, SharedConfig};
pub use secrets::Secrets;
