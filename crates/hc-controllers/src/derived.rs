//! Function controllers writing derived measurements
//!
//! Each stores its result under its own controller id. A missing or stale
//! input means nothing is written for that step.

use crate::algorithms::stats;
use crate::controller::{Controller, ControllerEnv, StepOutcome, Tick};
use crate::ControllerResult;
use async_trait::async_trait;
use hc_config::{
    secs, DifferenceOptions, MeasurementRef, RedundancyOptions, StatisticsOptions,
    VerificationOptions, VpdOptions,
};
use hc_core::Measurement;
use tracing::warn;

fn skip(env: &ControllerEnv, reason: &str) -> ControllerResult<StepOutcome> {
    warn!(controller_id = %env.controller_id, reason, "Nothing derived this step");
    Ok(StepOutcome::Continue)
}

async fn read_all(
    env: &ControllerEnv,
    refs: &[MeasurementRef],
    max_age: f64,
) -> ControllerResult<Vec<Option<Measurement>>> {
    let mut points = Vec::with_capacity(refs.len());
    for r in refs {
        points.push(env.read_fresh(r, secs(max_age)).await?);
    }
    Ok(points)
}

/// Statistics over a window of recent points
pub struct StatisticsController {
    options: StatisticsOptions,
    last: Vec<(String, f64)>,
}

impl StatisticsController {
    pub fn new(options: StatisticsOptions) -> Self {
        Self {
            options,
            last: Vec::new(),
        }
    }
}

#[async_trait]
impl Controller for StatisticsController {
    async fn step(&mut self, env: &ControllerEnv, tick: &Tick) -> ControllerResult<StepOutcome> {
        if tick.paused {
            return Ok(StepOutcome::Continue);
        }

        let mut values = Vec::new();
        let mut unit = None;
        for r in &self.options.measurements {
            for point in env.read_window(r, secs(self.options.max_age)).await? {
                unit.get_or_insert_with(|| point.unit.clone());
                values.push(point.value);
            }
        }
        if values.is_empty() {
            return skip(env, "no points in window");
        }

        let unit = unit.unwrap_or_default();
        let mut results = Vec::with_capacity(self.options.statistics.len());
        for (channel, statistic) in self.options.statistics.iter().enumerate() {
            let Some(value) = stats::compute(*statistic, &values) else {
                continue;
            };
            env.write_derived(channel as u32, statistic.as_str(), &unit, value, tick.now)
                .await?;
            results.push((statistic.as_str().to_string(), value));
        }
        env.log_step(format_args!("{} points -> {:?}", values.len(), results));
        self.last = results;
        Ok(StepOutcome::Continue)
    }

    fn detail(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.last
                .iter()
                .map(|(name, value)| (name.clone(), serde_json::Value::from(*value)))
                .collect(),
        )
    }
}

/// `minuend - subtrahend`, optionally absolute
pub struct DifferenceController {
    options: DifferenceOptions,
}

impl DifferenceController {
    pub fn new(options: DifferenceOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Controller for DifferenceController {
    async fn step(&mut self, env: &ControllerEnv, tick: &Tick) -> ControllerResult<StepOutcome> {
        if tick.paused {
            return Ok(StepOutcome::Continue);
        }

        let max_age = secs(self.options.max_age);
        let a = env.read_fresh(&self.options.minuend, max_age).await?;
        let b = env.read_fresh(&self.options.subtrahend, max_age).await?;
        let (Some(a), Some(b)) = (a, b) else {
            return skip(env, "stale input");
        };

        let mut difference = a.value - b.value;
        if self.options.absolute {
            difference = difference.abs();
        }
        env.write_derived(0, "difference", &a.unit, difference, tick.now)
            .await?;
        Ok(StepOutcome::Continue)
    }
}

/// First fresh measurement of an ordered list
pub struct RedundancyController {
    options: RedundancyOptions,
}

impl RedundancyController {
    pub fn new(options: RedundancyOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Controller for RedundancyController {
    async fn step(&mut self, env: &ControllerEnv, tick: &Tick) -> ControllerResult<StepOutcome> {
        if tick.paused {
            return Ok(StepOutcome::Continue);
        }

        for r in &self.options.measurements {
            if let Some(point) = env.read_fresh(r, secs(self.options.max_age)).await? {
                env.log_step(format_args!("using {}/{}", r.device_id, r.channel));
                env.write_derived(0, &point.kind, &point.unit, point.value, tick.now)
                    .await?;
                return Ok(StepOutcome::Continue);
            }
        }
        skip(env, "no fresh measurement in list")
    }
}

/// Re-stores the first measurement when all others agree with it
pub struct VerificationController {
    options: VerificationOptions,
}

impl VerificationController {
    pub fn new(options: VerificationOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Controller for VerificationController {
    async fn step(&mut self, env: &ControllerEnv, tick: &Tick) -> ControllerResult<StepOutcome> {
        if tick.paused {
            return Ok(StepOutcome::Continue);
        }

        let points = read_all(env, &self.options.measurements, self.options.max_age).await?;
        let Some(points) = points.into_iter().collect::<Option<Vec<_>>>() else {
            return skip(env, "stale input");
        };
        let Some((first, others)) = points.split_first() else {
            return skip(env, "no measurements");
        };

        if let Some(outlier) = others
            .iter()
            .find(|p| (p.value - first.value).abs() > self.options.max_difference)
        {
            warn!(
                controller_id = %env.controller_id,
                reference = first.value,
                outlier = outlier.value,
                device_id = %outlier.device_id,
                "Measurements disagree, nothing stored"
            );
            return Ok(StepOutcome::Continue);
        }

        env.write_derived(0, &first.kind, &first.unit, first.value, tick.now)
            .await?;
        Ok(StepOutcome::Continue)
    }
}

/// Vapour-pressure deficit from temperature and humidity
pub struct VpdController {
    options: VpdOptions,
    last: Option<f64>,
}

impl VpdController {
    pub fn new(options: VpdOptions) -> Self {
        Self {
            options,
            last: None,
        }
    }
}

#[async_trait]
impl Controller for VpdController {
    async fn step(&mut self, env: &ControllerEnv, tick: &Tick) -> ControllerResult<StepOutcome> {
        if tick.paused {
            return Ok(StepOutcome::Continue);
        }

        let max_age = secs(self.options.max_age);
        let temperature = env.read_fresh(&self.options.temperature, max_age).await?;
        let humidity = env.read_fresh(&self.options.humidity, max_age).await?;
        let (Some(temperature), Some(humidity)) = (temperature, humidity) else {
            return skip(env, "stale input");
        };

        let Some(vpd) = stats::vapor_pressure_deficit(temperature.value, humidity.value) else {
            return skip(env, "humidity out of range");
        };
        env.write_derived(0, "vapor_pressure_deficit", "kPa", vpd, tick.now)
            .await?;
        self.last = Some(vpd);
        Ok(StepOutcome::Continue)
    }

    fn detail(&self) -> serde_json::Value {
        serde_json::json!({ "vpd_kpa": self.last })
    }
}
