//! Top-level daemon configuration

use crate::actions::ActionConfig;
use crate::controllers::ControllerConfig;
use crate::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Convert a seconds field to a [`Duration`], treating negative or
/// non-finite values as zero
pub fn secs(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds.max(0.0)).unwrap_or(Duration::ZERO)
}

/// The whole daemon configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    #[serde(default)]
    pub daemon: DaemonSettings,

    #[serde(default)]
    pub outputs: Vec<OutputConfig>,

    #[serde(default)]
    pub controllers: Vec<ControllerConfig>,

    /// Every action of every chain; `owner` links an action to its controller
    #[serde(default)]
    pub actions: Vec<ActionConfig>,
}

impl DaemonConfig {
    /// Deserialize an already tag-resolved YAML tree and validate it
    pub fn from_value(value: serde_yaml::Value) -> ConfigResult<Self> {
        let config: DaemonConfig = serde_yaml::from_value(value).map_err(ConfigError::Schema)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate YAML text without tag support
    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        let config: DaemonConfig = serde_yaml::from_str(content).map_err(ConfigError::Schema)?;
        config.validate()?;
        Ok(config)
    }

    pub fn controller(&self, id: &str) -> Option<&ControllerConfig> {
        self.controllers.iter().find(|c| c.id == id)
    }

    pub fn output(&self, id: &str) -> Option<&OutputConfig> {
        self.outputs.iter().find(|o| o.id == id)
    }

    pub fn action(&self, id: &str) -> Option<&ActionConfig> {
        self.actions.iter().find(|a| a.id == id)
    }

    /// Actions owned by `owner_id`, in stored order
    pub fn actions_for<'a>(&'a self, owner_id: &'a str) -> impl Iterator<Item = &'a ActionConfig> {
        self.actions.iter().filter(move |a| a.owner == owner_id)
    }
}

/// Process-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonSettings {
    /// Default tracing filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Consecutive failed steps before a controller is deactivated
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// Concurrent side-effect actions (email, webhook, ...)
    #[serde(default = "default_side_effect_workers")]
    pub side_effect_workers: usize,

    /// Points retained per measurement series
    #[serde(default = "default_measurement_capacity")]
    pub measurement_capacity: usize,

    /// Webhook used for notification actions without a dedicated sink
    #[serde(default)]
    pub notification_webhook: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_consecutive_failures() -> u32 {
    10
}

fn default_side_effect_workers() -> usize {
    4
}

fn default_measurement_capacity() -> usize {
    4096
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            max_consecutive_failures: default_max_consecutive_failures(),
            side_effect_workers: default_side_effect_workers(),
            measurement_capacity: default_measurement_capacity(),
            notification_webhook: None,
        }
    }
}

/// One physical or virtual output device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    pub id: String,

    #[serde(default)]
    pub name: String,

    pub driver: OutputDriverConfig,
}

impl OutputConfig {
    pub fn channel_count(&self) -> u32 {
        match &self.driver {
            OutputDriverConfig::Memory { channels } => *channels,
            OutputDriverConfig::Command { channels, .. } => *channels,
        }
    }
}

/// Built-in output drivers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum OutputDriverConfig {
    /// Virtual output keeping its state in memory
    Memory {
        #[serde(default = "one")]
        channels: u32,
    },

    /// Runs a shell command per state change
    Command {
        #[serde(default = "one")]
        channels: u32,
        on: String,
        off: String,
        #[serde(default)]
        pwm: Option<String>,
        #[serde(default)]
        value: Option<String>,
        #[serde(default)]
        volume: Option<String>,
        /// Seconds before a command is killed
        #[serde(default = "default_command_timeout")]
        timeout: f64,
    },
}

fn one() -> u32 {
    1
}

fn default_command_timeout() -> f64 {
    30.0
}

/// A measurement series, optionally narrowed to one kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeasurementRef {
    pub device_id: String,

    #[serde(default)]
    pub channel: u32,

    #[serde(default)]
    pub kind: Option<String>,
}

/// One channel of an output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputRef {
    pub output_id: String,

    #[serde(default)]
    pub channel: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secs_clamps() {
        assert_eq!(secs(1.5), Duration::from_millis(1500));
        assert_eq!(secs(-3.0), Duration::ZERO);
        assert_eq!(secs(f64::NAN), Duration::ZERO);
        assert_eq!(secs(f64::INFINITY), Duration::ZERO);
    }

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config.daemon.max_consecutive_failures, 10);
        assert_eq!(config.daemon.log_level, "info");
        assert!(config.controllers.is_empty());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let result = DaemonConfig::from_yaml_str("daemon:\n  log_levle: debug\n");
        assert!(matches!(result, Err(ConfigError::Schema(_))));
    }

    #[test]
    fn test_output_drivers() {
        let config = DaemonConfig::from_yaml_str(
            r#"
outputs:
  - id: lights
    driver: { type: memory, channels: 4 }
  - id: pump
    driver:
      type: command
      on: "gpio write {channel} 1"
      off: "gpio write {channel} 0"
"#,
        )
        .unwrap();

        assert_eq!(config.output("lights").unwrap().channel_count(), 4);
        match &config.output("pump").unwrap().driver {
            OutputDriverConfig::Command { channels, timeout, pwm, .. } => {
                assert_eq!(*channels, 1);
                assert_eq!(*timeout, 30.0);
                assert!(pwm.is_none());
            }
            other => panic!("unexpected driver {:?}", other),
        }
    }
}
