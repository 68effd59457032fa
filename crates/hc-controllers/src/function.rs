//! Function controllers driving outputs: bang-bang, bang-bang PWM, autotune

use crate::algorithms::autotune::{AutotuneState, Autotuner};
use crate::algorithms::bang_bang::{self, PwmDuties};
use crate::controller::{Controller, ControllerEnv, StepOutcome, Tick};
use crate::ControllerResult;
use async_trait::async_trait;
use hc_config::{AutotuneOptions, BangBangOptions, BangBangPwmOptions, OutputRef};
use hc_core::{Context, Direction, OutputCommand};
use std::fmt::Write;
use tokio::time::Instant;
use tracing::{info, warn};

fn stale_warning(env: &ControllerEnv, device_id: &str, channel: u32) {
    warn!(
        controller_id = %env.controller_id,
        device_id,
        channel,
        "No fresh measurement, output left unchanged"
    );
}

/// On/off control with a hysteresis band
pub struct BangBangController {
    options: BangBangOptions,
    last_measurement: Option<f64>,
}

impl BangBangController {
    pub fn new(options: BangBangOptions) -> Self {
        Self {
            options,
            last_measurement: None,
        }
    }

    fn outputs(&self) -> impl Iterator<Item = (bool, &OutputRef)> {
        let raise = self
            .options
            .raise
            .as_ref()
            .filter(|_| self.options.direction.raises())
            .map(|o| (true, o));
        let lower = self
            .options
            .lower
            .as_ref()
            .filter(|_| self.options.direction.lowers())
            .map(|o| (false, o));
        raise.into_iter().chain(lower)
    }
}

#[async_trait]
impl Controller for BangBangController {
    async fn step(&mut self, env: &ControllerEnv, tick: &Tick) -> ControllerResult<StepOutcome> {
        if tick.paused {
            return Ok(StepOutcome::Continue);
        }

        let measurement = env
            .read_fresh(&self.options.measurement, self.options.max_age())
            .await?;
        let Some(measurement) = measurement else {
            stale_warning(
                env,
                &self.options.measurement.device_id,
                self.options.measurement.channel,
            );
            return Ok(StepOutcome::Continue);
        };
        self.last_measurement = Some(measurement.value);
        if tick.held {
            return Ok(StepOutcome::Continue);
        }

        let band = bang_bang::band(
            measurement.value,
            self.options.setpoint,
            self.options.hysteresis,
        );
        env.log_step(format_args!("measurement {} is {:?}", measurement.value, band));

        for (raise, output) in self.outputs() {
            let command = match bang_bang::switch(band, raise) {
                Some(true) => OutputCommand::on(&output.output_id, output.channel),
                Some(false) => OutputCommand::off(&output.output_id, output.channel),
                None => continue,
            };
            env.command(command, &tick.context).await?;
        }
        Ok(StepOutcome::Continue)
    }

    async fn stop(&mut self, env: &ControllerEnv, context: &Context) -> ControllerResult<()> {
        let targets: Vec<OutputRef> = self.outputs().map(|(_, o)| o.clone()).collect();
        for output in targets {
            env.command(
                OutputCommand::off(&output.output_id, output.channel),
                context,
            )
            .await?;
        }
        Ok(())
    }

    fn detail(&self) -> serde_json::Value {
        serde_json::json!({
            "setpoint": self.options.setpoint,
            "hysteresis": self.options.hysteresis,
            "last_measurement": self.last_measurement,
        })
    }
}

/// Hysteresis control selecting one of three duty cycles
pub struct BangBangPwmController {
    options: BangBangPwmOptions,
    duties: PwmDuties,
    last_duty: Option<f64>,
}

impl BangBangPwmController {
    pub fn new(options: BangBangPwmOptions) -> Self {
        Self {
            duties: PwmDuties {
                increase: options.increase_duty,
                maintain: options.maintain_duty,
                decrease: options.decrease_duty,
            },
            options,
            last_duty: None,
        }
    }
}

#[async_trait]
impl Controller for BangBangPwmController {
    async fn step(&mut self, env: &ControllerEnv, tick: &Tick) -> ControllerResult<StepOutcome> {
        if tick.paused {
            return Ok(StepOutcome::Continue);
        }

        let measurement = env
            .read_fresh(&self.options.measurement, self.options.max_age())
            .await?;
        let Some(measurement) = measurement else {
            stale_warning(
                env,
                &self.options.measurement.device_id,
                self.options.measurement.channel,
            );
            return Ok(StepOutcome::Continue);
        };
        if tick.held {
            return Ok(StepOutcome::Continue);
        }

        let band = bang_bang::band(
            measurement.value,
            self.options.setpoint,
            self.options.hysteresis,
        );
        let raise = self.options.direction != Direction::Lower;
        let duty = self.duties.select(band, raise);
        env.log_step(format_args!(
            "measurement {} is {:?}, duty {}",
            measurement.value, band, duty
        ));

        let output = &self.options.output;
        env.command(
            OutputCommand::pwm(&output.output_id, output.channel, duty),
            &tick.context,
        )
        .await?;
        self.last_duty = Some(duty);
        Ok(StepOutcome::Continue)
    }

    async fn stop(&mut self, env: &ControllerEnv, context: &Context) -> ControllerResult<()> {
        let output = &self.options.output;
        env.command(
            OutputCommand::pwm(&output.output_id, output.channel, self.options.shutdown_duty),
            context,
        )
        .await?;
        Ok(())
    }

    fn detail(&self) -> serde_json::Value {
        serde_json::json!({ "last_duty": self.last_duty })
    }
}

/// Relay autotuning; reports PID gains and deactivates itself when done
pub struct AutotuneController {
    options: AutotuneOptions,
    tuner: Autotuner,
    started: Option<Instant>,
}

impl AutotuneController {
    pub fn new(options: AutotuneOptions, period_secs: f64) -> Self {
        let window = (options.lookback / period_secs).round().max(1.0) as usize;
        // Lowering loops are tuned on the mirrored signal
        let setpoint = match options.direction {
            Direction::Lower => -options.setpoint,
            _ => options.setpoint,
        };
        let tuner = Autotuner::new(
            setpoint,
            options.out_step,
            options.initial_output,
            options.noiseband,
            window,
            options.timeout,
        );
        Self {
            options,
            tuner,
            started: None,
        }
    }

    fn report(&self, controller_id: &str) -> String {
        let mut report = String::new();
        match self.tuner.state() {
            AutotuneState::Succeeded => {
                let _ = writeln!(
                    report,
                    "Autotune of {} finished: Ku {:.4}, Pu {:.1} s",
                    controller_id,
                    self.tuner.ku(),
                    self.tuner.pu()
                );
                for gains in self.tuner.gains() {
                    let _ = writeln!(
                        report,
                        "{}: kp {:.4} ki {:.4} kd {:.4}",
                        gains.rule, gains.kp, gains.ki, gains.kd
                    );
                }
            }
            _ => {
                let _ = writeln!(
                    report,
                    "Autotune of {} failed after {} peak(s)",
                    controller_id,
                    self.tuner.peak_count()
                );
            }
        }
        report.trim_end().to_string()
    }
}

#[async_trait]
impl Controller for AutotuneController {
    async fn step(&mut self, env: &ControllerEnv, tick: &Tick) -> ControllerResult<StepOutcome> {
        if tick.paused || tick.held {
            return Ok(StepOutcome::Continue);
        }

        let measurement = env
            .read_fresh(&self.options.measurement, self.options.max_age())
            .await?;
        let Some(measurement) = measurement else {
            stale_warning(
                env,
                &self.options.measurement.device_id,
                self.options.measurement.channel,
            );
            return Ok(StepOutcome::Continue);
        };

        let started = *self.started.get_or_insert(tick.instant);
        let elapsed = tick.instant.duration_since(started).as_secs_f64();
        let input = match self.options.direction {
            Direction::Lower => -measurement.value,
            _ => measurement.value,
        };
        let finished = self.tuner.run(input, elapsed);

        let output = &self.options.output;
        env.command(
            OutputCommand::pwm(&output.output_id, output.channel, self.tuner.output()),
            &tick.context,
        )
        .await?;
        env.log_step(format_args!(
            "autotune {:?} input {} output {}",
            self.tuner.state(),
            measurement.value,
            self.tuner.output()
        ));

        if !finished {
            return Ok(StepOutcome::Continue);
        }

        let report = self.report(&env.controller_id);
        info!(controller_id = %env.controller_id, "{}", report);
        env.run_actions(env.action_context(&tick.context).with_message(report))
            .await;
        let reason = match self.tuner.state() {
            AutotuneState::Succeeded => "autotune finished",
            _ => "autotune failed",
        };
        Ok(StepOutcome::Deactivate {
            reason: reason.to_string(),
        })
    }

    async fn stop(&mut self, env: &ControllerEnv, context: &Context) -> ControllerResult<()> {
        let output = &self.options.output;
        env.command(
            OutputCommand::pwm(&output.output_id, output.channel, 0.0),
            context,
        )
        .await?;
        Ok(())
    }

    fn detail(&self) -> serde_json::Value {
        serde_json::json!({
            "state": self.tuner.state(),
            "peaks": self.tuner.peak_count(),
            "output": self.tuner.output(),
            "gains": self.tuner.gains(),
        })
    }
}
