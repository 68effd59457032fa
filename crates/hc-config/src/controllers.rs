//! Typed controller option sets

use crate::daemon::{secs, MeasurementRef, OutputRef};
use chrono::NaiveTime;
use hc_core::{ControllerKind, Direction, OutputMode, OutputState};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One controller: identity, clock and kind-specific options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerConfig {
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Activate when the daemon starts
    #[serde(default)]
    pub activate_on_start: bool,

    /// Log every step at debug level
    #[serde(default)]
    pub debug: bool,

    /// Seconds between steps
    #[serde(default = "default_period")]
    pub period: f64,

    /// Seconds to wait after activation before the first step
    #[serde(default)]
    pub start_offset: f64,

    pub options: ControllerOptions,
}

fn default_period() -> f64 {
    30.0
}

impl ControllerConfig {
    pub fn kind(&self) -> ControllerKind {
        self.options.kind()
    }

    pub fn period(&self) -> Duration {
        secs(self.period)
    }

    pub fn start_offset(&self) -> Duration {
        secs(self.start_offset)
    }

    /// Name for logs, falling back to the id
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// Kind-specific options, selected by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerOptions {
    Input(InputOptions),
    Pid(PidOptions),
    BangBang(BangBangOptions),
    BangBangPwm(BangBangPwmOptions),
    Autotune(AutotuneOptions),
    Statistics(StatisticsOptions),
    Difference(DifferenceOptions),
    Redundancy(RedundancyOptions),
    Verification(VerificationOptions),
    Vpd(VpdOptions),
    Conditional(ConditionalOptions),
    TimerDuration(TimerDurationOptions),
    TimerDailyTimePoint(TimerDailyTimePointOptions),
    TimerDailyTimeSpan(TimerDailyTimeSpanOptions),
    OutputState(OutputStateTriggerOptions),
}

impl ControllerOptions {
    pub fn kind(&self) -> ControllerKind {
        match self {
            ControllerOptions::Input(_) => ControllerKind::Input,
            ControllerOptions::Pid(_) => ControllerKind::Pid,
            ControllerOptions::BangBang(_)
            | ControllerOptions::BangBangPwm(_)
            | ControllerOptions::Autotune(_)
            | ControllerOptions::Statistics(_)
            | ControllerOptions::Difference(_)
            | ControllerOptions::Redundancy(_)
            | ControllerOptions::Verification(_)
            | ControllerOptions::Vpd(_) => ControllerKind::Function,
            ControllerOptions::Conditional(_) => ControllerKind::Conditional,
            ControllerOptions::TimerDuration(_)
            | ControllerOptions::TimerDailyTimePoint(_)
            | ControllerOptions::TimerDailyTimeSpan(_)
            | ControllerOptions::OutputState(_) => ControllerKind::Trigger,
        }
    }

    /// The `type` name as written in the configuration
    pub fn type_name(&self) -> &'static str {
        match self {
            ControllerOptions::Input(_) => "input",
            ControllerOptions::Pid(_) => "pid",
            ControllerOptions::BangBang(_) => "bang_bang",
            ControllerOptions::BangBangPwm(_) => "bang_bang_pwm",
            ControllerOptions::Autotune(_) => "autotune",
            ControllerOptions::Statistics(_) => "statistics",
            ControllerOptions::Difference(_) => "difference",
            ControllerOptions::Redundancy(_) => "redundancy",
            ControllerOptions::Verification(_) => "verification",
            ControllerOptions::Vpd(_) => "vpd",
            ControllerOptions::Conditional(_) => "conditional",
            ControllerOptions::TimerDuration(_) => "timer_duration",
            ControllerOptions::TimerDailyTimePoint(_) => "timer_daily_time_point",
            ControllerOptions::TimerDailyTimeSpan(_) => "timer_daily_time_span",
            ControllerOptions::OutputState(_) => "output_state",
        }
    }
}

fn default_max_age() -> f64 {
    120.0
}

// Input

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputOptions {
    pub sensor: SensorConfig,
}

/// Built-in sensors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum SensorConfig {
    /// 1, 5 and 15 minute load averages on channels 0-2
    Loadavg {},

    /// A shell command printing one number
    Command {
        command: String,
        kind: String,
        #[serde(default)]
        unit: String,
        #[serde(default = "default_sensor_timeout")]
        timeout: f64,
    },

    /// Fixed values
    Static { values: Vec<StaticValue> },
}

fn default_sensor_timeout() -> f64 {
    30.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticValue {
    #[serde(default)]
    pub channel: u32,
    pub kind: String,
    #[serde(default)]
    pub unit: String,
    pub value: f64,
}

// PID

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PidOptions {
    pub measurement: MeasurementRef,

    /// Seconds a measurement stays usable
    #[serde(default = "default_max_age")]
    pub max_age: f64,

    pub setpoint: f64,

    #[serde(default)]
    pub kp: f64,
    #[serde(default)]
    pub ki: f64,
    #[serde(default)]
    pub kd: f64,

    #[serde(default = "default_integrator_min")]
    pub integrator_min: f64,
    #[serde(default = "default_integrator_max")]
    pub integrator_max: f64,

    #[serde(default)]
    pub direction: Direction,

    /// No control while the measurement is within `setpoint ± band`
    #[serde(default)]
    pub band: Option<f64>,

    #[serde(default)]
    pub raise: Option<PidOutputConfig>,

    #[serde(default)]
    pub lower: Option<PidOutputConfig>,
}

fn default_integrator_min() -> f64 {
    -100.0
}

fn default_integrator_max() -> f64 {
    100.0
}

impl PidOptions {
    pub fn max_age(&self) -> Duration {
        secs(self.max_age)
    }
}

/// How a PID control value reaches an output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PidOutputConfig {
    pub output_id: String,

    #[serde(default)]
    pub channel: u32,

    /// `duration` turns on for |u| seconds, `pwm` sets |u| percent,
    /// `value` and `volume` pass |u| through
    #[serde(default)]
    pub mode: OutputMode,

    /// Smallest amount worth sending; below it the output is turned off
    #[serde(default)]
    pub min_on: f64,

    /// Largest amount sent
    #[serde(default)]
    pub max_on: Option<f64>,
}

// Bang-bang

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BangBangOptions {
    pub measurement: MeasurementRef,
    #[serde(default = "default_max_age")]
    pub max_age: f64,
    pub setpoint: f64,
    pub hysteresis: f64,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub raise: Option<OutputRef>,
    #[serde(default)]
    pub lower: Option<OutputRef>,
}

impl BangBangOptions {
    pub fn max_age(&self) -> Duration {
        secs(self.max_age)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BangBangPwmOptions {
    pub measurement: MeasurementRef,
    #[serde(default = "default_max_age")]
    pub max_age: f64,
    pub setpoint: f64,
    pub hysteresis: f64,
    /// `raise` or `lower`
    #[serde(default)]
    pub direction: Direction,
    pub output: OutputRef,
    /// Duty cycle while the measurement is on the wrong side of the band
    pub increase_duty: f64,
    /// Duty cycle inside the band
    pub maintain_duty: f64,
    /// Duty cycle once past the band
    pub decrease_duty: f64,
    /// Duty cycle applied on deactivation
    #[serde(default)]
    pub shutdown_duty: f64,
}

impl BangBangPwmOptions {
    pub fn max_age(&self) -> Duration {
        secs(self.max_age)
    }
}

// Autotune

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutotuneOptions {
    pub measurement: MeasurementRef,
    #[serde(default = "default_max_age")]
    pub max_age: f64,
    pub setpoint: f64,
    pub output: OutputRef,
    /// `raise` heats/humidifies toward the setpoint, `lower` cools/dries
    #[serde(default)]
    pub direction: Direction,
    /// Relay output amplitude, in percent of the period
    #[serde(default = "default_out_step")]
    pub out_step: f64,
    /// Relay output center, in percent of the period
    #[serde(default = "default_out_step")]
    pub initial_output: f64,
    /// Measurement noise ignored around the setpoint
    #[serde(default = "default_noiseband")]
    pub noiseband: f64,
    /// Seconds of history used for peak detection
    #[serde(default = "default_lookback")]
    pub lookback: f64,
    /// Seconds before the run is declared failed
    #[serde(default = "default_autotune_timeout")]
    pub timeout: f64,
}

fn default_out_step() -> f64 {
    50.0
}

fn default_noiseband() -> f64 {
    0.5
}

fn default_lookback() -> f64 {
    60.0
}

fn default_autotune_timeout() -> f64 {
    12.0 * 3600.0
}

impl AutotuneOptions {
    pub fn max_age(&self) -> Duration {
        secs(self.max_age)
    }
}

// Derived measurements

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Statistic {
    Mean,
    Median,
    Minimum,
    Maximum,
    StandardDeviation,
}

impl Statistic {
    pub const ALL: [Statistic; 5] = [
        Statistic::Mean,
        Statistic::Median,
        Statistic::Minimum,
        Statistic::Maximum,
        Statistic::StandardDeviation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Statistic::Mean => "mean",
            Statistic::Median => "median",
            Statistic::Minimum => "minimum",
            Statistic::Maximum => "maximum",
            Statistic::StandardDeviation => "standard_deviation",
        }
    }
}

fn all_statistics() -> Vec<Statistic> {
    Statistic::ALL.to_vec()
}

/// Statistics over recent points; each selected statistic is written to
/// the channel matching its position in `statistics`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatisticsOptions {
    pub measurements: Vec<MeasurementRef>,
    #[serde(default = "default_max_age")]
    pub max_age: f64,
    #[serde(default = "all_statistics")]
    pub statistics: Vec<Statistic>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DifferenceOptions {
    pub minuend: MeasurementRef,
    pub subtrahend: MeasurementRef,
    #[serde(default = "default_max_age")]
    pub max_age: f64,
    #[serde(default)]
    pub absolute: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedundancyOptions {
    /// In order of preference
    pub measurements: Vec<MeasurementRef>,
    #[serde(default = "default_max_age")]
    pub max_age: f64,
}

/// The first measurement is re-stored only when every other one agrees
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerificationOptions {
    pub measurements: Vec<MeasurementRef>,
    #[serde(default = "default_max_age")]
    pub max_age: f64,
    pub max_difference: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VpdOptions {
    /// Degrees Celsius
    pub temperature: MeasurementRef,
    /// Percent relative humidity
    pub humidity: MeasurementRef,
    #[serde(default = "default_max_age")]
    pub max_age: f64,
}

// Conditional

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionalOptions {
    pub conditions: Vec<ConditionConfig>,
    /// Expression over the condition ids; the chain runs when it is true
    pub expression: String,
}

/// A measurement exposed to the expression under `id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionConfig {
    pub id: String,
    pub measurement: MeasurementRef,
    #[serde(default = "default_max_age")]
    pub max_age: f64,
}

// Triggers

/// Run the chain every `duration` seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimerDurationOptions {
    pub duration: f64,
}

/// Run the chain once a day at local time `time`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimerDailyTimePointOptions {
    pub time: NaiveTime,
}

/// Run the chain every step while local time is within `[start, end)`;
/// spans may wrap midnight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimerDailyTimeSpanOptions {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

/// Run the chain when an output channel changes to `state`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputStateTriggerOptions {
    pub output_id: String,
    #[serde(default)]
    pub channel: u32,
    pub state: OutputState,
}
