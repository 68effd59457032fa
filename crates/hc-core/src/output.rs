//! Output commands and commanded state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Context;

/// On/off state of an output channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputState {
    On,
    Off,
    #[default]
    Unknown,
}

impl std::fmt::Display for OutputState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OutputState::On => "on",
            OutputState::Off => "off",
            OutputState::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// How the `amount` of a command is interpreted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Seconds to stay on; `0` means indefinitely
    #[default]
    Duration,
    /// Duty cycle in percent (0-100)
    Pwm,
    /// Arbitrary value (e.g. a DAC level)
    Value,
    /// Volume to dispense (e.g. ml for a peristaltic pump)
    Volume,
}

/// A request to change one output channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputCommand {
    pub output_id: String,
    pub channel: u32,
    pub state: OutputState,
    pub mode: OutputMode,
    pub amount: f64,
    /// Causality; `context.origin` names the requester
    pub context: Context,
}

impl OutputCommand {
    fn build(
        output_id: impl Into<String>,
        channel: u32,
        state: OutputState,
        mode: OutputMode,
        amount: f64,
    ) -> Self {
        Self {
            output_id: output_id.into(),
            channel,
            state,
            mode,
            amount,
            context: Context::new(),
        }
    }

    /// Turn on indefinitely
    pub fn on(output_id: impl Into<String>, channel: u32) -> Self {
        Self::build(output_id, channel, OutputState::On, OutputMode::Duration, 0.0)
    }

    pub fn off(output_id: impl Into<String>, channel: u32) -> Self {
        Self::build(output_id, channel, OutputState::Off, OutputMode::Duration, 0.0)
    }

    /// Turn on for `seconds`, after which the arbiter turns the channel off
    pub fn duration(output_id: impl Into<String>, channel: u32, seconds: f64) -> Self {
        Self::build(output_id, channel, OutputState::On, OutputMode::Duration, seconds)
    }

    /// Set a PWM duty cycle; a duty of zero is reported as `off`
    pub fn pwm(output_id: impl Into<String>, channel: u32, duty_cycle: f64) -> Self {
        let duty = duty_cycle.clamp(0.0, 100.0);
        let state = if duty > 0.0 {
            OutputState::On
        } else {
            OutputState::Off
        };
        Self::build(output_id, channel, state, OutputMode::Pwm, duty)
    }

    pub fn value(output_id: impl Into<String>, channel: u32, value: f64) -> Self {
        Self::build(output_id, channel, OutputState::On, OutputMode::Value, value)
    }

    pub fn volume(output_id: impl Into<String>, channel: u32, volume: f64) -> Self {
        Self::build(output_id, channel, OutputState::On, OutputMode::Volume, volume)
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    pub fn requested_by(&self) -> &str {
        self.context.origin()
    }
}

/// Authoritative last-commanded state of one channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputStatus {
    pub state: OutputState,
    pub mode: OutputMode,
    pub amount: f64,
    pub requested_by: String,
    pub updated: DateTime<Utc>,
}

impl OutputStatus {
    pub fn from_command(command: &OutputCommand) -> Self {
        Self {
            state: command.state,
            mode: command.mode,
            amount: command.amount,
            requested_by: command.requested_by().to_string(),
            updated: Utc::now(),
        }
    }
}
