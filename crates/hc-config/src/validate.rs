//! Load-time validation of references and numeric ranges

use crate::actions::ActionKind;
use crate::controllers::{ControllerConfig, ControllerOptions, PidOutputConfig, SensorConfig};
use crate::daemon::{DaemonConfig, OutputDriverConfig, OutputRef};
use crate::error::{ConfigError, ConfigResult};
use hc_core::{Direction, OutputMode, OutputState};
use std::collections::HashSet;

/// Collects every violation instead of stopping at the first
struct Problems<'a> {
    config: &'a DaemonConfig,
    found: Vec<String>,
}

impl<'a> Problems<'a> {
    fn push(&mut self, scope: &str, message: impl std::fmt::Display) {
        self.found.push(format!("{}: {}", scope, message));
    }

    fn check(&mut self, ok: bool, scope: &str, message: &str) {
        if !ok {
            self.push(scope, message);
        }
    }

    fn finite_at_least(&mut self, scope: &str, field: &str, value: f64, min: f64) {
        if !(value.is_finite() && value >= min) {
            self.push(scope, format_args!("{} must be >= {}, got {}", field, min, value));
        }
    }

    fn duty(&mut self, scope: &str, field: &str, value: f64) {
        if !(value.is_finite() && (0.0..=100.0).contains(&value)) {
            self.push(scope, format_args!("{} must be within 0-100, got {}", field, value));
        }
    }

    fn output(&mut self, scope: &str, output_id: &str, channel: u32) {
        match self.config.output(output_id) {
            None => self.push(scope, format_args!("unknown output '{}'", output_id)),
            Some(output) if channel >= output.channel_count() => self.push(
                scope,
                format_args!("output '{}' has no channel {}", output_id, channel),
            ),
            Some(_) => {}
        }
    }

    fn output_ref(&mut self, scope: &str, output: &OutputRef) {
        self.output(scope, &output.output_id, output.channel);
    }

    fn controller(&mut self, scope: &str, controller_id: &str) {
        if self.config.controller(controller_id).is_none() {
            self.push(scope, format_args!("unknown controller '{}'", controller_id));
        }
    }
}

fn duplicates<'a>(ids: impl Iterator<Item = &'a str>) -> Vec<&'a str> {
    let mut seen = HashSet::new();
    let mut repeated: Vec<&str> = ids.filter(|id| !seen.insert(*id)).collect();
    repeated.dedup();
    repeated
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl DaemonConfig {
    /// Check ids are unique, references resolve and numbers are in range
    pub fn validate(&self) -> ConfigResult<()> {
        let mut problems = Problems {
            config: self,
            found: Vec::new(),
        };

        for id in duplicates(self.outputs.iter().map(|o| o.id.as_str())) {
            problems.push("outputs", format_args!("duplicate id '{}'", id));
        }
        for id in duplicates(self.controllers.iter().map(|c| c.id.as_str())) {
            problems.push("controllers", format_args!("duplicate id '{}'", id));
        }
        for id in duplicates(self.actions.iter().map(|a| a.id.as_str())) {
            problems.push("actions", format_args!("duplicate id '{}'", id));
        }
        problems.check(
            self.daemon.side_effect_workers > 0,
            "daemon",
            "side_effect_workers must be at least 1",
        );
        problems.check(
            self.daemon.max_consecutive_failures > 0,
            "daemon",
            "max_consecutive_failures must be at least 1",
        );

        for output in &self.outputs {
            let scope = format!("output '{}'", output.id);
            problems.check(output.channel_count() > 0, &scope, "needs at least one channel");
            if let OutputDriverConfig::Command { timeout, .. } = &output.driver {
                problems.finite_at_least(&scope, "timeout", *timeout, 0.001);
            }
        }

        for controller in &self.controllers {
            validate_controller(&mut problems, controller);
        }

        for action in &self.actions {
            let scope = format!("action '{}'", action.id);
            problems.controller(&scope, &action.owner);
            if let Some(interval) = action.min_interval {
                problems.finite_at_least(&scope, "min_interval", interval, 0.0);
            }
            if let Some((output_id, channel)) = action.action.output_target() {
                problems.output(&scope, output_id, channel);
            }
            if let Some(controller_id) = action.action.controller_target() {
                problems.controller(&scope, controller_id);
            }

            match &action.action {
                ActionKind::OutputDuration { duration, .. }
                | ActionKind::PauseActions { duration } => {
                    problems.finite_at_least(&scope, "duration", *duration, 0.0)
                }
                ActionKind::OutputPwm { duty_cycle, .. } => {
                    problems.duty(&scope, "duty_cycle", *duty_cycle)
                }
                ActionKind::OutputRampPwm {
                    start_duty,
                    end_duty,
                    increment,
                    step_duration,
                    ..
                } => {
                    problems.duty(&scope, "start_duty", *start_duty);
                    problems.duty(&scope, "end_duty", *end_duty);
                    problems.finite_at_least(&scope, "increment", *increment, f64::MIN_POSITIVE);
                    problems.finite_at_least(&scope, "step_duration", *step_duration, 0.0);
                }
                ActionKind::OutputVolume { volume, .. } => {
                    problems.finite_at_least(&scope, "volume", *volume, 0.0)
                }
                ActionKind::ReadMeasurement { max_age, key, .. } => {
                    problems.finite_at_least(&scope, "max_age", *max_age, 0.0);
                    problems.check(!key.is_empty(), &scope, "key must not be empty");
                }
                ActionKind::MeasurementEquation { equation, .. } => {
                    problems.check(!equation.trim().is_empty(), &scope, "equation is empty")
                }
                _ => {}
            }
        }

        if problems.found.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation {
                problems: problems.found,
            })
        }
    }
}

fn validate_directional_outputs<T>(
    problems: &mut Problems<'_>,
    scope: &str,
    direction: Direction,
    raise: Option<&T>,
    lower: Option<&T>,
) {
    if direction.raises() && raise.is_none() {
        problems.push(scope, "direction needs a raise output");
    }
    if direction.lowers() && lower.is_none() {
        problems.push(scope, "direction needs a lower output");
    }
}

fn validate_pid_output(problems: &mut Problems<'_>, scope: &str, output: &PidOutputConfig) {
    problems.output(scope, &output.output_id, output.channel);
    problems.finite_at_least(scope, "min_on", output.min_on, 0.0);
    if let Some(max_on) = output.max_on {
        problems.finite_at_least(scope, "max_on", max_on, output.min_on);
        if output.mode == OutputMode::Pwm {
            problems.duty(scope, "max_on", max_on);
        }
    }
}

fn validate_controller(problems: &mut Problems<'_>, controller: &ControllerConfig) {
    let scope = format!("controller '{}'", controller.id);
    let scope = scope.as_str();
    problems.finite_at_least(scope, "period", controller.period, 0.001);
    problems.finite_at_least(scope, "start_offset", controller.start_offset, 0.0);

    match &controller.options {
        ControllerOptions::Input(input) => match &input.sensor {
            SensorConfig::Loadavg {} => {}
            SensorConfig::Command {
                command, timeout, ..
            } => {
                problems.check(!command.trim().is_empty(), scope, "command is empty");
                problems.finite_at_least(scope, "timeout", *timeout, 0.001);
            }
            SensorConfig::Static { values } => {
                problems.check(!values.is_empty(), scope, "static sensor needs values")
            }
        },
        ControllerOptions::Pid(pid) => {
            problems.finite_at_least(scope, "max_age", pid.max_age, 0.0);
            problems.check(
                pid.integrator_min <= pid.integrator_max,
                scope,
                "integrator_min must not exceed integrator_max",
            );
            if let Some(band) = pid.band {
                problems.finite_at_least(scope, "band", band, 0.0);
            }
            validate_directional_outputs(
                problems,
                scope,
                pid.direction,
                pid.raise.as_ref(),
                pid.lower.as_ref(),
            );
            for output in pid.raise.iter().chain(pid.lower.iter()) {
                validate_pid_output(problems, scope, output);
            }
        }
        ControllerOptions::BangBang(bb) => {
            problems.finite_at_least(scope, "hysteresis", bb.hysteresis, 0.0);
            validate_directional_outputs(
                problems,
                scope,
                bb.direction,
                bb.raise.as_ref(),
                bb.lower.as_ref(),
            );
            for output in bb.raise.iter().chain(bb.lower.iter()) {
                problems.output_ref(scope, output);
            }
        }
        ControllerOptions::BangBangPwm(bb) => {
            problems.finite_at_least(scope, "hysteresis", bb.hysteresis, 0.0);
            problems.check(
                bb.direction != Direction::Both,
                scope,
                "direction must be raise or lower",
            );
            problems.output_ref(scope, &bb.output);
            problems.duty(scope, "increase_duty", bb.increase_duty);
            problems.duty(scope, "maintain_duty", bb.maintain_duty);
            problems.duty(scope, "decrease_duty", bb.decrease_duty);
            problems.duty(scope, "shutdown_duty", bb.shutdown_duty);
        }
        ControllerOptions::Autotune(at) => {
            problems.output_ref(scope, &at.output);
            problems.check(
                at.direction != Direction::Both,
                scope,
                "direction must be raise or lower",
            );
            problems.finite_at_least(scope, "out_step", at.out_step, f64::MIN_POSITIVE);
            problems.finite_at_least(scope, "noiseband", at.noiseband, 0.0);
            problems.finite_at_least(scope, "lookback", at.lookback, controller.period);
            problems.finite_at_least(scope, "timeout", at.timeout, controller.period);
        }
        ControllerOptions::Statistics(stats) => {
            problems.check(!stats.measurements.is_empty(), scope, "needs measurements");
            problems.check(!stats.statistics.is_empty(), scope, "needs statistics");
        }
        ControllerOptions::Difference(_) | ControllerOptions::Vpd(_) => {}
        ControllerOptions::Redundancy(red) => {
            problems.check(!red.measurements.is_empty(), scope, "needs measurements")
        }
        ControllerOptions::Verification(ver) => {
            problems.check(
                ver.measurements.len() >= 2,
                scope,
                "needs at least two measurements",
            );
            problems.finite_at_least(scope, "max_difference", ver.max_difference, 0.0);
        }
        ControllerOptions::Conditional(cond) => {
            problems.check(!cond.expression.trim().is_empty(), scope, "expression is empty");
            for id in duplicates(cond.conditions.iter().map(|c| c.id.as_str())) {
                problems.push(scope, format_args!("duplicate condition id '{}'", id));
            }
            for condition in &cond.conditions {
                if !is_identifier(&condition.id) {
                    problems.push(
                        scope,
                        format_args!("condition id '{}' is not an identifier", condition.id),
                    );
                }
            }
        }
        ControllerOptions::TimerDuration(timer) => {
            problems.finite_at_least(scope, "duration", timer.duration, 0.001)
        }
        ControllerOptions::TimerDailyTimePoint(_) => {}
        ControllerOptions::TimerDailyTimeSpan(span) => {
            problems.check(span.start != span.end, scope, "time span is empty")
        }
        ControllerOptions::OutputState(trigger) => {
            problems.output(scope, &trigger.output_id, trigger.channel);
            problems.check(
                trigger.state != OutputState::Unknown,
                scope,
                "state must be on or off",
            );
        }
    }
}
