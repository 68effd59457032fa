//! Input controllers: acquire, post-process through the chain, store

use crate::controller::{Controller, ControllerEnv, StepOutcome, Tick};
use crate::ControllerResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hc_config::{SensorConfig, StaticValue};
use hc_core::{ChannelMeasurement, Context, Measurement};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Error reported by a sensor
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("sensor {sensor}: {message}")]
pub struct SensorError {
    pub sensor: String,
    pub message: String,
}

impl SensorError {
    fn new(sensor: &str, message: impl Into<String>) -> Self {
        Self {
            sensor: sensor.to_string(),
            message: message.into(),
        }
    }
}

/// One value as read from a sensor
#[derive(Debug, Clone, PartialEq)]
pub struct RawMeasurement {
    pub channel: u32,
    pub kind: String,
    pub unit: String,
    pub value: f64,
}

impl RawMeasurement {
    pub fn new(channel: u32, kind: impl Into<String>, unit: impl Into<String>, value: f64) -> Self {
        Self {
            channel,
            kind: kind.into(),
            unit: unit.into(),
            value,
        }
    }
}

/// Device seam for input controllers
#[async_trait]
pub trait Sensor: Send + Sync {
    fn name(&self) -> &str;

    async fn measure(&self) -> Result<Vec<RawMeasurement>, SensorError>;
}

/// Linux load averages from `/proc/loadavg`
pub struct LoadavgSensor {
    path: PathBuf,
}

impl LoadavgSensor {
    pub fn new() -> Self {
        Self::with_path("/proc/loadavg")
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for LoadavgSensor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sensor for LoadavgSensor {
    fn name(&self) -> &str {
        "loadavg"
    }

    async fn measure(&self) -> Result<Vec<RawMeasurement>, SensorError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| SensorError::new(self.name(), format!("{}: {}", self.path.display(), e)))?;

        let fields: Vec<&str> = content.split_whitespace().take(3).collect();
        if fields.len() < 3 {
            return Err(SensorError::new(self.name(), "expected three load averages"));
        }

        fields
            .iter()
            .enumerate()
            .map(|(channel, field)| {
                field
                    .parse::<f64>()
                    .map(|value| RawMeasurement::new(channel as u32, "load_average", "", value))
                    .map_err(|_| SensorError::new("loadavg", format!("not a number: {}", field)))
            })
            .collect()
    }
}

/// Runs a shell command and parses its output as one number
pub struct CommandSensor {
    command: String,
    kind: String,
    unit: String,
    timeout: Duration,
}

impl CommandSensor {
    pub fn new(command: impl Into<String>, kind: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            kind: kind.into(),
            unit: unit.into(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Sensor for CommandSensor {
    fn name(&self) -> &str {
        "command"
    }

    async fn measure(&self) -> Result<Vec<RawMeasurement>, SensorError> {
        debug!(command = %self.command, "Running sensor command");
        let run = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| {
                SensorError::new(self.name(), format!("timed out after {:?}", self.timeout))
            })?
            .map_err(|e| SensorError::new(self.name(), format!("failed to spawn: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SensorError::new(
                self.name(),
                format!("exited with {}: {}", output.status, stderr.trim()),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let value = stdout.trim().parse::<f64>().map_err(|_| {
            SensorError::new(self.name(), format!("output is not a number: {:?}", stdout.trim()))
        })?;
        Ok(vec![RawMeasurement::new(0, &self.kind, &self.unit, value)])
    }
}

/// Fixed values, for virtual inputs and tests
pub struct StaticSensor {
    values: Vec<RawMeasurement>,
}

impl StaticSensor {
    pub fn new(values: Vec<RawMeasurement>) -> Self {
        Self { values }
    }
}

impl From<&[StaticValue]> for StaticSensor {
    fn from(values: &[StaticValue]) -> Self {
        Self::new(
            values
                .iter()
                .map(|v| RawMeasurement::new(v.channel, &v.kind, &v.unit, v.value))
                .collect(),
        )
    }
}

#[async_trait]
impl Sensor for StaticSensor {
    fn name(&self) -> &str {
        "static"
    }

    async fn measure(&self) -> Result<Vec<RawMeasurement>, SensorError> {
        Ok(self.values.clone())
    }
}

/// Sensor for a configuration
pub fn sensor_for(config: &SensorConfig) -> Box<dyn Sensor> {
    match config {
        SensorConfig::Loadavg {} => Box::new(LoadavgSensor::new()),
        SensorConfig::Command {
            command,
            kind,
            unit,
            timeout,
        } => Box::new(
            CommandSensor::new(command, kind, unit).with_timeout(hc_config::secs(*timeout)),
        ),
        SensorConfig::Static { values } => Box::new(StaticSensor::from(values.as_slice())),
    }
}

/// Periodically measures a sensor and stores the points under its own id
///
/// Before storing, the raw values run through the controller's action
/// chain, which may rewrite them (equations, unit conversion).
pub struct InputController {
    sensor: Box<dyn Sensor>,
    last_written: usize,
}

impl InputController {
    pub fn new(sensor: Box<dyn Sensor>) -> Self {
        Self {
            sensor,
            last_written: 0,
        }
    }

    async fn acquire(
        &mut self,
        env: &ControllerEnv,
        now: DateTime<Utc>,
        context: &Context,
    ) -> ControllerResult<Vec<Measurement>> {
        let raw = self.sensor.measure().await?;

        let mut channels = BTreeMap::new();
        for m in raw {
            if !m.value.is_finite() {
                warn!(
                    controller_id = %env.controller_id,
                    channel = m.channel,
                    "Sensor returned a non-finite value, skipped"
                );
                continue;
            }
            channels.insert(
                m.channel,
                ChannelMeasurement {
                    kind: m.kind,
                    unit: m.unit,
                    value: m.value,
                    timestamp: now,
                },
            );
        }

        let ctx = env
            .run_actions(env.action_context(context).with_measurements(channels))
            .await;

        let mut written = Vec::new();
        for (channel, m) in ctx.measurements.unwrap_or_default() {
            if !m.value.is_finite() {
                warn!(
                    controller_id = %env.controller_id,
                    channel,
                    "Post-processing produced a non-finite value, skipped"
                );
                continue;
            }
            let measurement = m.into_measurement(env.controller_id.clone(), channel);
            env.store.write(measurement.clone()).await?;
            written.push(measurement);
        }
        self.last_written = written.len();
        env.log_step(format_args!("stored {} measurement(s)", written.len()));
        Ok(written)
    }
}

#[async_trait]
impl Controller for InputController {
    async fn step(&mut self, env: &ControllerEnv, tick: &Tick) -> ControllerResult<StepOutcome> {
        if tick.paused {
            return Ok(StepOutcome::Continue);
        }
        self.acquire(env, tick.now, &tick.context).await?;
        Ok(StepOutcome::Continue)
    }

    async fn force_measurements(
        &mut self,
        env: &ControllerEnv,
        context: &Context,
    ) -> ControllerResult<Vec<Measurement>> {
        self.acquire(env, Utc::now(), context).await
    }

    fn detail(&self) -> serde_json::Value {
        serde_json::json!({
            "sensor": self.sensor.name(),
            "last_written": self.last_written,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_err;

    #[tokio::test]
    async fn test_loadavg_parses_three_channels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loadavg");
        std::fs::write(&path, "0.52 0.58 0.59 1/467 12345\n").unwrap();

        let values = LoadavgSensor::with_path(&path).measure().await.unwrap();
        assert_eq!(values.len(), 3);
        assert_eq!(values[0].value, 0.52);
        assert_eq!(values[2].channel, 2);
        assert_eq!(values[2].value, 0.59);
    }

    #[tokio::test]
    async fn test_loadavg_missing_file() {
        let sensor = LoadavgSensor::with_path("/nonexistent/loadavg");
        assert_err!(sensor.measure().await);
    }

    #[tokio::test]
    async fn test_command_sensor() {
        let sensor = CommandSensor::new("echo 21.5", "temperature", "C");
        let values = sensor.measure().await.unwrap();
        assert_eq!(values, vec![RawMeasurement::new(0, "temperature", "C", 21.5)]);

        let broken = CommandSensor::new("echo warm", "temperature", "C");
        assert_err!(broken.measure().await);
    }
}
