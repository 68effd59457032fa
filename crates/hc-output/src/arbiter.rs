//! Per-channel command serialization
//!
//! Each `(output_id, channel)` owns an async mutex guarding the
//! last-commanded status and a generation counter. A command that reaches
//! the driver bumps the generation under that mutex; deferred work
//! (duration timers, ramp steps) only applies while its generation is still
//! current, so the last successful writer wins. Rejected commands leave
//! pending timers and ramps alone.

use crate::{OutputDriver, OutputError, OutputResult};
use dashmap::DashMap;
use hc_core::events::OutputChangedData;
use hc_core::{Context, OutputCommand, OutputMode, OutputState, OutputStatus};
use hc_event_bus::EventBus;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace, warn};

/// Upper bound on the number of steps in one ramp
pub const MAX_RAMP_STEPS: usize = 10_000;

/// State of one output channel
struct ChannelSlot {
    output_id: String,
    channel: u32,
    driver: Arc<dyn OutputDriver>,
    last: Mutex<Commanded>,
    event_bus: Option<Arc<EventBus>>,
}

#[derive(Default)]
struct Commanded {
    status: Option<OutputStatus>,
    generation: u64,
}

impl ChannelSlot {
    /// Write `command` and make it the channel's current generation
    async fn apply(&self, command: &OutputCommand) -> OutputResult<(OutputStatus, u64)> {
        let mut last = self.last.lock().await;
        let status = self.write(&mut last, command).await?;
        last.generation += 1;
        Ok((status, last.generation))
    }

    /// Apply only if no newer command has landed since `generation`
    async fn apply_if_current(
        &self,
        generation: u64,
        command: &OutputCommand,
    ) -> OutputResult<Option<OutputStatus>> {
        let mut last = self.last.lock().await;
        if last.generation != generation {
            return Ok(None);
        }
        self.write(&mut last, command).await.map(Some)
    }

    async fn write(
        &self,
        last: &mut Commanded,
        command: &OutputCommand,
    ) -> OutputResult<OutputStatus> {
        self.driver
            .set(self.channel, command)
            .await
            .map_err(|e| OutputError::Driver {
                output_id: self.output_id.clone(),
                channel: self.channel,
                message: e.0,
            })?;

        let status = OutputStatus::from_command(command);
        last.status = Some(status.clone());

        if let Some(bus) = &self.event_bus {
            bus.fire_typed(
                OutputChangedData {
                    output_id: self.output_id.clone(),
                    channel: self.channel,
                    status: status.clone(),
                },
                command.context.clone(),
            );
        }

        Ok(status)
    }
}

/// A gradual duty-cycle change
#[derive(Debug, Clone, PartialEq)]
pub struct RampSpec {
    pub start_duty: f64,
    pub end_duty: f64,
    /// Duty change per step, in percent
    pub increment: f64,
    /// Sleep between steps
    pub step_interval: Duration,
}

impl RampSpec {
    /// Duty cycles visited by the ramp, ending exactly at `end_duty`
    pub fn duties(&self) -> OutputResult<Vec<f64>> {
        let in_range = |d: f64| d.is_finite() && (0.0..=100.0).contains(&d);
        if !in_range(self.start_duty) || !in_range(self.end_duty) {
            return Err(OutputError::InvalidCommand(
                "ramp duty cycles must be within 0-100".to_string(),
            ));
        }
        if !(self.increment.is_finite() && self.increment > 0.0) {
            return Err(OutputError::InvalidCommand(
                "ramp increment must be positive".to_string(),
            ));
        }

        let span = self.end_duty - self.start_duty;
        let steps = (span.abs() / self.increment).ceil() as usize;
        if steps > MAX_RAMP_STEPS {
            return Err(OutputError::InvalidCommand(format!(
                "ramp needs {} steps, limit is {}",
                steps, MAX_RAMP_STEPS
            )));
        }

        let sign = span.signum();
        let mut duties: Vec<f64> = (0..steps)
            .map(|i| self.start_duty + sign * self.increment * i as f64)
            .collect();
        duties.push(self.end_duty);
        Ok(duties)
    }
}

/// How a ramp ended
#[derive(Debug, Clone, PartialEq)]
pub enum RampOutcome {
    Completed,
    /// A newer command took over the channel
    Preempted { last_duty: Option<f64> },
    Failed(OutputError),
}

/// Handle to a running ramp
pub struct RampHandle {
    handle: JoinHandle<RampOutcome>,
}

impl RampHandle {
    /// Wait for the ramp to finish
    pub async fn wait(self) -> RampOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) => RampOutcome::Failed(OutputError::InvalidCommand(format!(
                "ramp task ended abnormally: {}",
                e
            ))),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// The single authoritative path for output state changes
pub struct OutputArbiter {
    outputs: DashMap<String, Arc<dyn OutputDriver>>,
    slots: DashMap<(String, u32), Arc<ChannelSlot>>,
    event_bus: Option<Arc<EventBus>>,
}

impl OutputArbiter {
    pub fn new() -> Self {
        Self {
            outputs: DashMap::new(),
            slots: DashMap::new(),
            event_bus: None,
        }
    }

    /// Publish OUTPUT_CHANGED events on `event_bus`
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Register a driver under an output id
    pub fn register(&self, output_id: impl Into<String>, driver: Arc<dyn OutputDriver>) {
        let output_id = output_id.into();
        debug!(output_id = %output_id, channels = driver.channel_count(), "Registering output");
        self.slots.retain(|(id, _), _| id != &output_id);
        self.outputs.insert(output_id, driver);
    }

    pub fn has_output(&self, output_id: &str) -> bool {
        self.outputs.contains_key(output_id)
    }

    /// Number of channels of a registered output
    pub fn channel_count(&self, output_id: &str) -> OutputResult<u32> {
        self.outputs
            .get(output_id)
            .map(|d| d.channel_count())
            .ok_or_else(|| OutputError::UnknownOutput(output_id.to_string()))
    }

    pub fn output_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.outputs.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    fn slot(&self, output_id: &str, channel: u32) -> OutputResult<Arc<ChannelSlot>> {
        let driver = self
            .outputs
            .get(output_id)
            .map(|d| d.value().clone())
            .ok_or_else(|| OutputError::UnknownOutput(output_id.to_string()))?;

        if channel >= driver.channel_count() {
            return Err(OutputError::UnknownChannel {
                output_id: output_id.to_string(),
                channel,
            });
        }

        let slot = self
            .slots
            .entry((output_id.to_string(), channel))
            .or_insert_with(|| {
                Arc::new(ChannelSlot {
                    output_id: output_id.to_string(),
                    channel,
                    driver,
                    last: Mutex::new(Commanded::default()),
                    event_bus: self.event_bus.clone(),
                })
            })
            .clone();
        Ok(slot)
    }

    /// Apply a command, superseding any pending timer or ramp on the channel
    ///
    /// A duration command with a positive amount turns the channel on and
    /// schedules an automatic off; the caller does not wait for it.
    #[instrument(skip(self, command), fields(output_id = %command.output_id, channel = command.channel))]
    pub async fn command(&self, command: OutputCommand) -> OutputResult<OutputStatus> {
        validate(&command)?;
        let off_after = duration_timer(&command)?;
        let slot = self.slot(&command.output_id, command.channel)?;

        debug!(
            state = %command.state,
            mode = ?command.mode,
            amount = command.amount,
            requested_by = %command.requested_by(),
            "Commanding output"
        );
        let (status, generation) = slot.apply(&command).await?;

        if let Some(off_after) = off_after {
            let seconds = command.amount;
            let context = command.context.child_with_origin("duration_timer");
            tokio::spawn(async move {
                tokio::time::sleep(off_after).await;
                let off = OutputCommand::off(slot.output_id.clone(), slot.channel)
                    .with_context(context);
                match slot.apply_if_current(generation, &off).await {
                    Ok(Some(_)) => debug!(
                        output_id = %slot.output_id,
                        channel = slot.channel,
                        seconds,
                        "Duration elapsed, output off"
                    ),
                    Ok(None) => trace!(
                        output_id = %slot.output_id,
                        channel = slot.channel,
                        "Duration timer superseded"
                    ),
                    Err(e) => warn!(
                        output_id = %slot.output_id,
                        channel = slot.channel,
                        error = %e,
                        "Failed to turn output off after duration"
                    ),
                }
            });
        }

        Ok(status)
    }

    /// Start a duty-cycle ramp
    ///
    /// The first duty is written before returning; the rest follow on a
    /// detached task that stops as soon as a newer command lands on the
    /// channel.
    #[instrument(skip(self, spec, context))]
    pub async fn ramp(
        &self,
        output_id: &str,
        channel: u32,
        spec: RampSpec,
        context: Context,
    ) -> OutputResult<RampHandle> {
        let mut duties = spec.duties()?.into_iter();
        let Some(first) = duties.next() else {
            return Err(OutputError::InvalidCommand("ramp has no steps".to_string()));
        };
        let slot = self.slot(output_id, channel)?;

        debug!(
            start = spec.start_duty,
            end = spec.end_duty,
            steps = duties.len() + 1,
            "Starting ramp"
        );
        let first_command = OutputCommand::pwm(output_id, channel, first).with_context(context.clone());
        let (_, generation) = slot.apply(&first_command).await?;

        let step_interval = spec.step_interval;
        let handle = tokio::spawn(async move {
            let mut last_duty = Some(first);
            for duty in duties {
                tokio::time::sleep(step_interval).await;
                let command = OutputCommand::pwm(slot.output_id.clone(), slot.channel, duty)
                    .with_context(context.clone());
                match slot.apply_if_current(generation, &command).await {
                    Ok(Some(_)) => last_duty = Some(duty),
                    Ok(None) => {
                        debug!(
                            output_id = %slot.output_id,
                            channel = slot.channel,
                            "Ramp preempted by newer command"
                        );
                        return RampOutcome::Preempted { last_duty };
                    }
                    Err(e) => return RampOutcome::Failed(e),
                }
            }
            RampOutcome::Completed
        });

        Ok(RampHandle { handle })
    }

    /// Last-commanded status, if the channel was ever commanded
    pub async fn status(&self, output_id: &str, channel: u32) -> OutputResult<Option<OutputStatus>> {
        let slot = self.slot(output_id, channel)?;
        let last = slot.last.lock().await;
        Ok(last.status.clone())
    }

    /// Current state: last-commanded if known, otherwise the driver's report
    pub async fn state(&self, output_id: &str, channel: u32) -> OutputResult<OutputState> {
        let slot = self.slot(output_id, channel)?;
        let last = slot.last.lock().await;
        match last.status.as_ref() {
            Some(status) => Ok(status.state),
            None => Ok(slot.driver.get_state(channel).await),
        }
    }

    /// Turn every channel of every output off
    ///
    /// Returns the failures; the remaining channels are still turned off.
    pub async fn off_all(&self, context: Context) -> Vec<OutputError> {
        let mut failures = Vec::new();
        for output_id in self.output_ids() {
            let channels = match self.channel_count(&output_id) {
                Ok(n) => n,
                Err(e) => {
                    failures.push(e);
                    continue;
                }
            };
            for channel in 0..channels {
                let command =
                    OutputCommand::off(output_id.clone(), channel).with_context(context.clone());
                if let Err(e) = self.command(command).await {
                    warn!(output_id = %output_id, channel, error = %e, "Failed to turn output off");
                    failures.push(e);
                }
            }
        }
        failures
    }
}

impl Default for OutputArbiter {
    fn default() -> Self {
        Self::new()
    }
}

/// How long a duration command keeps the channel on, if it schedules an off
fn duration_timer(command: &OutputCommand) -> OutputResult<Option<Duration>> {
    if command.mode != OutputMode::Duration
        || command.state != OutputState::On
        || command.amount <= 0.0
    {
        return Ok(None);
    }
    Duration::try_from_secs_f64(command.amount)
        .map(Some)
        .map_err(|_| {
            OutputError::InvalidCommand(format!("duration {} s is out of range", command.amount))
        })
}

fn validate(command: &OutputCommand) -> OutputResult<()> {
    if !command.amount.is_finite() {
        return Err(OutputError::InvalidCommand(format!(
            "amount {} is not finite",
            command.amount
        )));
    }
    match command.mode {
        OutputMode::Duration | OutputMode::Volume if command.amount < 0.0 => Err(
            OutputError::InvalidCommand(format!("{:?} amount must not be negative", command.mode)),
        ),
        OutputMode::Pwm if !(0.0..=100.0).contains(&command.amount) => Err(
            OutputError::InvalidCommand(format!("duty cycle {} outside 0-100", command.amount)),
        ),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryDriver;
    use tokio_test::assert_err;

    fn arbiter_with(output_id: &str, channels: u32) -> (OutputArbiter, Arc<MemoryDriver>) {
        let arbiter = OutputArbiter::new();
        let driver = Arc::new(MemoryDriver::new(channels));
        arbiter.register(output_id, driver.clone());
        (arbiter, driver)
    }

    #[test]
    fn test_ramp_duties_end_exactly() {
        let spec = RampSpec {
            start_duty: 0.0,
            end_duty: 25.0,
            increment: 10.0,
            step_interval: Duration::from_millis(1),
        };
        assert_eq!(spec.duties().unwrap(), vec![0.0, 10.0, 20.0, 25.0]);

        let down = RampSpec {
            start_duty: 50.0,
            end_duty: 30.0,
            increment: 10.0,
            step_interval: Duration::from_millis(1),
        };
        assert_eq!(down.duties().unwrap(), vec![50.0, 40.0, 30.0]);
    }

    #[test]
    fn test_ramp_rejects_bad_specs() {
        let mut spec = RampSpec {
            start_duty: 0.0,
            end_duty: 100.0,
            increment: 0.0,
            step_interval: Duration::from_millis(1),
        };
        assert!(spec.duties().is_err());

        spec.increment = 0.001;
        assert!(spec.duties().is_err());

        spec.increment = 1.0;
        spec.end_duty = 120.0;
        assert!(spec.duties().is_err());
    }

    #[tokio::test]
    async fn test_unknown_output_and_channel() {
        let (arbiter, _) = arbiter_with("relay", 2);

        let err = arbiter.command(OutputCommand::on("nope", 0)).await.unwrap_err();
        assert_eq!(err, OutputError::UnknownOutput("nope".into()));

        let err = arbiter.command(OutputCommand::on("relay", 2)).await.unwrap_err();
        assert!(matches!(err, OutputError::UnknownChannel { channel: 2, .. }));
    }

    #[tokio::test]
    async fn test_invalid_amounts_rejected() {
        let (arbiter, driver) = arbiter_with("relay", 1);

        let mut cmd = OutputCommand::duration("relay", 0, -1.0);
        assert_err!(arbiter.command(cmd.clone()).await);

        cmd.mode = OutputMode::Pwm;
        cmd.amount = 101.0;
        assert_err!(arbiter.command(cmd).await);

        let huge = OutputCommand::duration("relay", 0, 1e20);
        let err = assert_err!(arbiter.command(huge).await);
        assert!(matches!(err, OutputError::InvalidCommand(_)));

        assert!(driver.history().is_empty());
    }

    #[tokio::test]
    async fn test_state_falls_back_to_driver() {
        let (arbiter, _) = arbiter_with("relay", 1);
        assert_eq!(arbiter.state("relay", 0).await.unwrap(), OutputState::Off);
        assert!(arbiter.status("relay", 0).await.unwrap().is_none());

        arbiter.command(OutputCommand::on("relay", 0)).await.unwrap();
        assert_eq!(arbiter.state("relay", 0).await.unwrap(), OutputState::On);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_turns_off_after_amount() {
        let (arbiter, _) = arbiter_with("pump", 1);

        arbiter
            .command(OutputCommand::duration("pump", 0, 5.0))
            .await
            .unwrap();
        assert_eq!(arbiter.state("pump", 0).await.unwrap(), OutputState::On);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(arbiter.state("pump", 0).await.unwrap(), OutputState::Off);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_command_cancels_duration_timer() {
        let (arbiter, _) = arbiter_with("pump", 1);

        arbiter
            .command(OutputCommand::duration("pump", 0, 5.0))
            .await
            .unwrap();
        arbiter.command(OutputCommand::on("pump", 0)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(arbiter.state("pump", 0).await.unwrap(), OutputState::On);
    }

    #[tokio::test]
    async fn test_off_all() {
        let (arbiter, driver) = arbiter_with("relay", 3);
        arbiter.command(OutputCommand::on("relay", 1)).await.unwrap();

        let failures = arbiter.off_all(Context::with_origin("shutdown")).await;
        assert!(failures.is_empty());
        for channel in 0..3 {
            assert_eq!(driver.get_state(channel).await, OutputState::Off);
        }
    }
}
