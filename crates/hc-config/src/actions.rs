//! Typed action option sets

use crate::daemon::{secs, MeasurementRef};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One element of an action chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionConfig {
    pub id: String,

    /// Controller whose chain this action belongs to
    pub owner: String,

    /// Run a side effect inline instead of on the worker pool, or wait for
    /// a ramp to finish
    #[serde(default)]
    pub wait: bool,

    /// Minimum seconds between two notifications from this action
    #[serde(default)]
    pub min_interval: Option<f64>,

    pub action: ActionKind,
}

impl ActionConfig {
    pub fn min_interval(&self) -> Option<Duration> {
        self.min_interval.map(secs)
    }
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

fn default_http_method() -> String {
    "POST".to_string()
}

/// What an action does, selected by `type`
///
/// Numeric fields can be overridden per invocation through the matching key
/// of the action context's value map (`duration`, `duty_cycle`, `setpoint`,
/// `controller_id`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum ActionKind {
    OutputOn {
        output_id: String,
        #[serde(default)]
        channel: u32,
    },
    OutputOff {
        output_id: String,
        #[serde(default)]
        channel: u32,
    },
    OutputDuration {
        output_id: String,
        #[serde(default)]
        channel: u32,
        /// Seconds
        duration: f64,
    },
    OutputPwm {
        output_id: String,
        #[serde(default)]
        channel: u32,
        duty_cycle: f64,
    },
    OutputRampPwm {
        output_id: String,
        #[serde(default)]
        channel: u32,
        start_duty: f64,
        end_duty: f64,
        increment: f64,
        /// Seconds between steps
        step_duration: f64,
    },
    OutputValue {
        output_id: String,
        #[serde(default)]
        channel: u32,
        value: f64,
    },
    OutputVolume {
        output_id: String,
        #[serde(default)]
        channel: u32,
        volume: f64,
    },
    /// Sleep before the next action of the chain
    PauseActions {
        duration: f64,
    },
    ControllerActivate {
        controller_id: String,
    },
    ControllerDeactivate {
        controller_id: String,
    },
    PidSetSetpoint {
        controller_id: String,
        setpoint: f64,
    },
    PidPause {
        controller_id: String,
    },
    PidHold {
        controller_id: String,
    },
    PidResume {
        controller_id: String,
    },
    InputForceMeasurements {
        controller_id: String,
    },
    /// Read a fresh measurement into the context value map under `key`
    ReadMeasurement {
        measurement: MeasurementRef,
        #[serde(default = "default_read_max_age")]
        max_age: f64,
        #[serde(default = "default_read_key")]
        key: String,
    },
    /// Replace input-pipeline values with an expression of `x`
    MeasurementEquation {
        equation: String,
        /// Every channel when unset
        #[serde(default)]
        channel: Option<u32>,
    },
    /// Convert input-pipeline values to another unit
    MeasurementConvertUnit {
        to: String,
        #[serde(default)]
        channel: Option<u32>,
    },
    /// Append to the chain message and log it
    LogMessage {
        message: String,
        #[serde(default = "default_log_level")]
        level: LogLevel,
    },
    FireEvent {
        event_type: String,
        #[serde(default)]
        data: serde_json::Value,
    },
    SendEmail {
        to: String,
        subject: String,
    },
    MqttPublish {
        topic: String,
        /// The chain message when unset
        #[serde(default)]
        payload: Option<String>,
    },
    Webhook {
        url: String,
        #[serde(default = "default_http_method")]
        method: String,
    },
    CameraCapture {
        camera_id: String,
    },
}

fn default_read_max_age() -> f64 {
    120.0
}

fn default_read_key() -> String {
    "measurement".to_string()
}

impl ActionKind {
    /// The `type` name as written in the configuration
    pub fn type_name(&self) -> &'static str {
        match self {
            ActionKind::OutputOn { .. } => "output_on",
            ActionKind::OutputOff { .. } => "output_off",
            ActionKind::OutputDuration { .. } => "output_duration",
            ActionKind::OutputPwm { .. } => "output_pwm",
            ActionKind::OutputRampPwm { .. } => "output_ramp_pwm",
            ActionKind::OutputValue { .. } => "output_value",
            ActionKind::OutputVolume { .. } => "output_volume",
            ActionKind::PauseActions { .. } => "pause_actions",
            ActionKind::ControllerActivate { .. } => "controller_activate",
            ActionKind::ControllerDeactivate { .. } => "controller_deactivate",
            ActionKind::PidSetSetpoint { .. } => "pid_set_setpoint",
            ActionKind::PidPause { .. } => "pid_pause",
            ActionKind::PidHold { .. } => "pid_hold",
            ActionKind::PidResume { .. } => "pid_resume",
            ActionKind::InputForceMeasurements { .. } => "input_force_measurements",
            ActionKind::ReadMeasurement { .. } => "read_measurement",
            ActionKind::MeasurementEquation { .. } => "measurement_equation",
            ActionKind::MeasurementConvertUnit { .. } => "measurement_convert_unit",
            ActionKind::LogMessage { .. } => "log_message",
            ActionKind::FireEvent { .. } => "fire_event",
            ActionKind::SendEmail { .. } => "send_email",
            ActionKind::MqttPublish { .. } => "mqtt_publish",
            ActionKind::Webhook { .. } => "webhook",
            ActionKind::CameraCapture { .. } => "camera_capture",
        }
    }

    /// Side effects that do not feed back into the chain
    pub fn is_side_effect(&self) -> bool {
        matches!(
            self,
            ActionKind::FireEvent { .. }
                | ActionKind::SendEmail { .. }
                | ActionKind::MqttPublish { .. }
                | ActionKind::Webhook { .. }
                | ActionKind::CameraCapture { .. }
        )
    }

    /// Output id and channel for output actions
    pub fn output_target(&self) -> Option<(&str, u32)> {
        match self {
            ActionKind::OutputOn { output_id, channel }
            | ActionKind::OutputOff { output_id, channel }
            | ActionKind::OutputDuration {
                output_id, channel, ..
            }
            | ActionKind::OutputPwm {
                output_id, channel, ..
            }
            | ActionKind::OutputRampPwm {
                output_id, channel, ..
            }
            | ActionKind::OutputValue {
                output_id, channel, ..
            }
            | ActionKind::OutputVolume {
                output_id, channel, ..
            } => Some((output_id.as_str(), *channel)),
            _ => None,
        }
    }

    /// Target controller for controller and PID actions
    pub fn controller_target(&self) -> Option<&str> {
        match self {
            ActionKind::ControllerActivate { controller_id }
            | ActionKind::ControllerDeactivate { controller_id }
            | ActionKind::PidSetSetpoint { controller_id, .. }
            | ActionKind::PidPause { controller_id }
            | ActionKind::PidHold { controller_id }
            | ActionKind::PidResume { controller_id }
            | ActionKind::InputForceMeasurements { controller_id } => Some(controller_id.as_str()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chain_elements() {
        let actions: Vec<ActionConfig> = serde_yaml::from_str(
            r#"
- id: a1
  owner: cond_hot
  action: { type: output_duration, output_id: fan, duration: 30 }
- id: a2
  owner: cond_hot
  min_interval: 600
  action: { type: webhook, url: "https://hooks.example/alert" }
- id: a3
  owner: cond_hot
  action: { type: log_message, message: "fan kicked" }
"#,
        )
        .unwrap();

        assert_eq!(actions[0].action.output_target(), Some(("fan", 0)));
        assert!(!actions[0].action.is_side_effect());

        assert!(actions[1].action.is_side_effect());
        assert_eq!(actions[1].min_interval(), Some(Duration::from_secs(600)));
        match &actions[1].action {
            ActionKind::Webhook { method, .. } => assert_eq!(method, "POST"),
            other => panic!("unexpected {:?}", other),
        }

        match &actions[2].action {
            ActionKind::LogMessage { level, .. } => assert_eq!(*level, LogLevel::Info),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_controller_target() {
        let kind: ActionKind =
            serde_yaml::from_str("{ type: pid_set_setpoint, controller_id: pid_1, setpoint: 6.2 }")
                .unwrap();
        assert_eq!(kind.controller_target(), Some("pid_1"));
        assert_eq!(kind.type_name(), "pid_set_setpoint");
    }

    #[test]
    fn test_unknown_action_type() {
        let result: Result<ActionKind, _> = serde_yaml::from_str("{ type: launch_rocket }");
        assert!(result.is_err());
    }
}
