//! PID controller: one measurement, up to two outputs

use crate::algorithms::pid::{PidState, PidTerms};
use crate::controller::{Controller, ControllerEnv, StepOutcome, Tick};
use crate::{ControllerError, ControllerResult};
use async_trait::async_trait;
use hc_config::{PidOptions, PidOutputConfig};
use hc_core::{Context, Direction, OutputCommand, OutputMode, PidSetting};
use tokio::time::Instant;
use tracing::{info, warn};

pub struct PidController {
    options: PidOptions,
    state: PidState,
    direction: Direction,
    last_update: Option<Instant>,
    last_measurement: Option<f64>,
    last_terms: Option<PidTerms>,
}

impl PidController {
    pub fn new(options: PidOptions) -> Self {
        Self {
            state: PidState::from_options(&options),
            direction: options.direction,
            options,
            last_update: None,
            last_measurement: None,
            last_terms: None,
        }
    }

    /// Command one side with a control amount; non-positive turns it off
    async fn drive(
        &self,
        env: &ControllerEnv,
        output: &PidOutputConfig,
        amount: f64,
        context: &Context,
    ) -> ControllerResult<()> {
        let id = &output.output_id;
        let ch = output.channel;
        let amount = match output.max_on {
            Some(max) => amount.min(max),
            None => amount,
        };

        let command = if amount <= 0.0 || amount < output.min_on {
            off_command(output)
        } else {
            match output.mode {
                OutputMode::Duration => {
                    OutputCommand::duration(id, ch, amount.min(env.period.as_secs_f64()))
                }
                OutputMode::Pwm => OutputCommand::pwm(id, ch, amount.min(100.0)),
                OutputMode::Value => OutputCommand::value(id, ch, amount),
                OutputMode::Volume => OutputCommand::volume(id, ch, amount),
            }
        };
        env.command(command, context).await?;
        Ok(())
    }

    fn side(&self, raise: bool) -> Option<&PidOutputConfig> {
        if raise {
            self.options.raise.as_ref()
        } else {
            self.options.lower.as_ref()
        }
    }
}

fn off_command(output: &PidOutputConfig) -> OutputCommand {
    match output.mode {
        OutputMode::Pwm => OutputCommand::pwm(&output.output_id, output.channel, 0.0),
        _ => OutputCommand::off(&output.output_id, output.channel),
    }
}

#[async_trait]
impl Controller for PidController {
    async fn initialize(&mut self, env: &ControllerEnv) -> ControllerResult<()> {
        for raise in [true, false] {
            let wanted = if raise {
                self.direction.raises()
            } else {
                self.direction.lowers()
            };
            if let (true, Some(output)) = (wanted, self.side(raise)) {
                env.arbiter.channel_count(&output.output_id)?;
            }
        }
        Ok(())
    }

    async fn step(&mut self, env: &ControllerEnv, tick: &Tick) -> ControllerResult<StepOutcome> {
        if tick.paused {
            env.log_step(format_args!("paused"));
            return Ok(StepOutcome::Continue);
        }

        let measurement = env
            .read_fresh(&self.options.measurement, self.options.max_age())
            .await?;
        let Some(measurement) = measurement else {
            warn!(
                controller_id = %env.controller_id,
                device_id = %self.options.measurement.device_id,
                channel = self.options.measurement.channel,
                "No fresh measurement, output left unchanged"
            );
            return Ok(StepOutcome::Continue);
        };

        let dt = match self.last_update {
            Some(last) => tick.instant.duration_since(last).as_secs_f64(),
            None => env.period.as_secs_f64(),
        };
        self.last_update = Some(tick.instant);
        self.last_measurement = Some(measurement.value);

        if tick.held {
            env.log_step(format_args!("held at measurement {}", measurement.value));
            return Ok(StepOutcome::Continue);
        }

        if let Some(band) = self.options.band {
            if (self.state.setpoint - measurement.value).abs() <= band {
                env.log_step(format_args!("within band of setpoint"));
                return Ok(StepOutcome::Continue);
            }
        }

        let terms = self.state.update(measurement.value, dt);
        self.last_terms = Some(terms);
        env.log_step(format_args!(
            "measurement {} setpoint {} p {:.3} i {:.3} d {:.3} control {:.3}",
            measurement.value, self.state.setpoint, terms.p, terms.i, terms.d, terms.control
        ));

        if self.direction.raises() {
            if let Some(output) = self.side(true) {
                self.drive(env, output, terms.control, &tick.context).await?;
            }
        }
        if self.direction.lowers() {
            if let Some(output) = self.side(false) {
                self.drive(env, output, -terms.control, &tick.context).await?;
            }
        }
        Ok(StepOutcome::Continue)
    }

    async fn stop(&mut self, env: &ControllerEnv, context: &Context) -> ControllerResult<()> {
        let mut first_error = None;
        for output in self.options.raise.iter().chain(self.options.lower.iter()) {
            if let Err(e) = env.command(off_command(output), context).await {
                warn!(
                    controller_id = %env.controller_id,
                    output_id = %output.output_id,
                    error = %e,
                    "Failed to turn PID output off"
                );
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn apply_setting(&mut self, setting: PidSetting) -> ControllerResult<()> {
        if let PidSetting::Direction(direction) = setting {
            if direction.raises() && self.options.raise.is_none() {
                return Err(ControllerError::Config(
                    "no raise output configured".to_string(),
                ));
            }
            if direction.lowers() && self.options.lower.is_none() {
                return Err(ControllerError::Config(
                    "no lower output configured".to_string(),
                ));
            }
            self.direction = direction;
        } else {
            self.state.apply(setting).map_err(ControllerError::Config)?;
        }
        info!(setting = ?setting, "PID setting changed");
        Ok(())
    }

    fn detail(&self) -> serde_json::Value {
        serde_json::json!({
            "setpoint": self.state.setpoint,
            "kp": self.state.kp,
            "ki": self.state.ki,
            "kd": self.state.kd,
            "integrator": self.state.integrator,
            "direction": self.direction,
            "last_measurement": self.last_measurement,
            "last_terms": self.last_terms,
        })
    }
}
