//! Mutable state shared by the actions of one chain run

use crate::{ActionError, ActionResult};
use hc_core::{ChannelMeasurement, Context};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Context threaded through one action chain invocation
///
/// Created fresh for each run and dropped afterwards. Actions append to
/// `message`, read caller overrides from `value`, and in an input pipeline
/// rewrite `measurements` before they are stored.
#[derive(Debug, Clone, Default)]
pub struct ActionContext {
    /// Accumulated human-readable report, one line per entry
    pub message: String,

    /// Caller overrides and values produced by earlier actions
    pub value: Map<String, Value>,

    /// Per-channel measurements of an input pipeline
    pub measurements: Option<BTreeMap<u32, ChannelMeasurement>>,

    /// Controller that owns the chain
    pub owner_id: String,

    pub context: Context,
}

impl ActionContext {
    pub fn new(owner_id: impl Into<String>) -> Self {
        let owner_id = owner_id.into();
        Self {
            context: Context::with_origin(owner_id.clone()),
            owner_id,
            ..Default::default()
        }
    }

    /// Seed with an initial message
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Seed an override
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.value.insert(key.into(), value.into());
        self
    }

    pub fn with_measurements(mut self, measurements: BTreeMap<u32, ChannelMeasurement>) -> Self {
        self.measurements = Some(measurements);
        self
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    /// Add a line to the message
    pub fn append_message(&mut self, line: impl AsRef<str>) {
        if !self.message.is_empty() && !self.message.ends_with('\n') {
            self.message.push('\n');
        }
        self.message.push_str(line.as_ref());
    }

    /// Numeric override under `key`
    ///
    /// Absent or null is `None`; numbers and numeric strings are accepted;
    /// anything else is an error rather than a silent fallback.
    pub fn override_f64(&self, key: &str) -> ActionResult<Option<f64>> {
        let parsed = match self.value.get(key) {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
            Some(_) => None,
        };
        match parsed {
            Some(v) if v.is_finite() => Ok(Some(v)),
            _ => Err(ActionError::InvalidOverride {
                key: key.to_string(),
                reason: "expected a finite number".to_string(),
            }),
        }
    }

    /// String override under `key`
    pub fn override_str(&self, key: &str) -> ActionResult<Option<&str>> {
        match self.value.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(_) => Err(ActionError::InvalidOverride {
                key: key.to_string(),
                reason: "expected a string".to_string(),
            }),
        }
    }

    /// Channel override under `key`
    pub fn override_channel(&self, key: &str) -> ActionResult<Option<u32>> {
        match self.override_f64(key)? {
            None => Ok(None),
            Some(v) if v >= 0.0 && v.fract() == 0.0 && v <= u32::MAX as f64 => Ok(Some(v as u32)),
            Some(_) => Err(ActionError::InvalidOverride {
                key: key.to_string(),
                reason: "expected a channel number".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_lines() {
        let mut ctx = ActionContext::new("pid_1");
        ctx.append_message("first");
        ctx.append_message("second");
        assert_eq!(ctx.message, "first\nsecond");
        assert_eq!(ctx.context.origin(), "pid_1");
    }

    #[test]
    fn test_overrides() {
        let ctx = ActionContext::new("t")
            .with_value("duration", 12.5)
            .with_value("duty_cycle", "40")
            .with_value("controller_id", "pid_2")
            .with_value("broken", json!([1, 2]))
            .with_value("channel", 3);

        assert_eq!(ctx.override_f64("duration").unwrap(), Some(12.5));
        assert_eq!(ctx.override_f64("duty_cycle").unwrap(), Some(40.0));
        assert_eq!(ctx.override_f64("missing").unwrap(), None);
        assert!(ctx.override_f64("broken").is_err());
        assert_eq!(ctx.override_str("controller_id").unwrap(), Some("pid_2"));
        assert!(ctx.override_str("duration").is_err());
        assert_eq!(ctx.override_channel("channel").unwrap(), Some(3));
        assert!(ctx.override_channel("duration").is_err());
    }
}
