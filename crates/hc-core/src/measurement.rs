//! Measurement points

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Identifies one measurement series: a device and one of its channels
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MeasurementKey {
    pub device_id: String,
    pub channel: u32,
}

impl MeasurementKey {
    pub fn new(device_id: impl Into<String>, channel: u32) -> Self {
        Self {
            device_id: device_id.into(),
            channel,
        }
    }
}

impl std::fmt::Display for MeasurementKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.device_id, self.channel)
    }
}

/// An immutable measurement point
///
/// Created by acquisition (input loops) or derived computation (function
/// loops) and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub device_id: String,
    pub channel: u32,
    /// Measured quantity (e.g. `temperature`, `humidity`)
    pub kind: String,
    pub unit: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl Measurement {
    pub fn new(
        device_id: impl Into<String>,
        channel: u32,
        kind: impl Into<String>,
        unit: impl Into<String>,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            channel,
            kind: kind.into(),
            unit: unit.into(),
            value,
            timestamp,
        }
    }

    pub fn key(&self) -> MeasurementKey {
        MeasurementKey::new(self.device_id.clone(), self.channel)
    }

    /// Whether this point is at most `max_age` old at `now`.
    ///
    /// The boundary is inclusive: a point exactly `max_age` old is fresh.
    /// Points timestamped in the future count as fresh.
    pub fn is_fresh(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        match (now - self.timestamp).to_std() {
            Ok(age) => age <= max_age,
            Err(_) => true,
        }
    }
}

/// One channel's entry in an input pipeline's measurement map
///
/// Actions in the input pipeline may rewrite `value` and `unit` before the
/// point is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMeasurement {
    pub kind: String,
    pub unit: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl ChannelMeasurement {
    pub fn into_measurement(self, device_id: impl Into<String>, channel: u32) -> Measurement {
        Measurement::new(
            device_id,
            channel,
            self.kind,
            self.unit,
            self.value,
            self.timestamp,
        )
    }
}
