//! Action chain execution

use crate::expr::ExpressionEngine;
use crate::notify::{Notification, NotificationKind, NotificationSinks};
use crate::pool::SideEffectPool;
use crate::{units, ActionContext, ActionError, ActionResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use hc_config::{secs, ActionConfig, ActionKind, ConfigProvider, LogLevel};
use hc_core::{DaemonHandle, Event, HandleError, MeasurementKey, OutputCommand, PidSetting};
use hc_event_bus::EventBus;
use hc_measurement_store::SharedMeasurementStore;
use hc_output::{OutputArbiter, RampOutcome, RampSpec};
use serde_json::{Map, Value};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, trace, warn};

/// Default number of concurrent side effects
pub const DEFAULT_SIDE_EFFECT_WORKERS: usize = 4;

/// Runs actions and action chains
///
/// Each action runs inside its own containment boundary: an error or a
/// panic is logged, appended to the chain message, and the chain moves on to
/// the next action.
pub struct ActionPipeline {
    config: Arc<dyn ConfigProvider>,
    store: SharedMeasurementStore,
    arbiter: Arc<OutputArbiter>,
    event_bus: Arc<EventBus>,
    daemon: Option<Weak<dyn DaemonHandle>>,
    sinks: NotificationSinks,
    pool: SideEffectPool,
    expressions: ExpressionEngine,
    /// When each rate-limited action last dispatched
    last_sent: DashMap<String, Instant>,
}

impl ActionPipeline {
    pub fn new(
        config: Arc<dyn ConfigProvider>,
        store: SharedMeasurementStore,
        arbiter: Arc<OutputArbiter>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            store,
            arbiter,
            event_bus,
            daemon: None,
            sinks: NotificationSinks::with_defaults(),
            pool: SideEffectPool::new(DEFAULT_SIDE_EFFECT_WORKERS),
            expressions: ExpressionEngine::new(),
            last_sent: DashMap::new(),
        }
    }

    /// Attach the daemon for controller and PID actions
    pub fn with_daemon(mut self, daemon: Weak<dyn DaemonHandle>) -> Self {
        self.daemon = Some(daemon);
        self
    }

    pub fn with_sinks(mut self, sinks: NotificationSinks) -> Self {
        self.sinks = sinks;
        self
    }

    pub fn with_side_effect_workers(mut self, workers: usize) -> Self {
        self.pool = SideEffectPool::new(workers);
        self
    }

    pub fn arbiter(&self) -> &Arc<OutputArbiter> {
        &self.arbiter
    }

    pub fn store(&self) -> &SharedMeasurementStore {
        &self.store
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn expressions(&self) -> &ExpressionEngine {
        &self.expressions
    }

    pub fn sinks(&self) -> &NotificationSinks {
        &self.sinks
    }

    pub fn side_effects(&self) -> &SideEffectPool {
        &self.pool
    }

    /// Run one action by id
    ///
    /// An unknown id is reported in the returned context like any other
    /// action failure.
    pub async fn run_action(&self, action_id: &str, mut ctx: ActionContext) -> ActionContext {
        match self.config.action(action_id) {
            Some(action) => self.run_contained(&action, &mut ctx).await,
            None => {
                let err = ActionError::UnknownAction(action_id.to_string());
                warn!(action_id, error = %err, "Cannot run action");
                ctx.append_message(format!("[Action {}] error: {}", action_id, err));
            }
        }
        ctx
    }

    /// Run every action owned by `owner_id`, in stored order
    #[instrument(skip(self, ctx), fields(owner_id = %owner_id))]
    pub async fn run_all_actions(&self, owner_id: &str, mut ctx: ActionContext) -> ActionContext {
        let actions = self.config.actions_for(owner_id);
        debug!(count = actions.len(), "Running action chain");
        for action in &actions {
            self.run_contained(action, &mut ctx).await;
        }
        ctx
    }

    /// Wait up to `grace` for queued side effects, then abort the rest
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.pool.shutdown(grace).await
    }

    async fn run_contained(&self, action: &ActionConfig, ctx: &mut ActionContext) {
        let result = AssertUnwindSafe(self.execute(action, ctx))
            .catch_unwind()
            .await
            .unwrap_or(Err(ActionError::Panicked));

        if let Err(e) = result {
            warn!(
                action_id = %action.id,
                owner_id = %action.owner,
                kind = action.action.type_name(),
                error = %e,
                "Action failed"
            );
            ctx.append_message(format!("[Action {}] error: {}", action.id, e));
        }
    }

    #[instrument(skip_all, fields(action_id = %action.id, kind = action.action.type_name()))]
    async fn execute(&self, action: &ActionConfig, ctx: &mut ActionContext) -> ActionResult<()> {
        trace!("Executing action");
        match &action.action {
            ActionKind::OutputOn { output_id, channel } => {
                let (output_id, channel) = target(ctx, output_id, *channel)?;
                self.send_output(ctx, OutputCommand::on(&output_id, channel))
                    .await?;
                ctx.append_message(format!("output {}/{} on", output_id, channel));
            }
            ActionKind::OutputOff { output_id, channel } => {
                let (output_id, channel) = target(ctx, output_id, *channel)?;
                self.send_output(ctx, OutputCommand::off(&output_id, channel))
                    .await?;
                ctx.append_message(format!("output {}/{} off", output_id, channel));
            }
            ActionKind::OutputDuration {
                output_id,
                channel,
                duration,
            } => {
                let (output_id, channel) = target(ctx, output_id, *channel)?;
                let duration = ctx.override_f64("duration")?.unwrap_or(*duration);
                self.send_output(ctx, OutputCommand::duration(&output_id, channel, duration))
                    .await?;
                ctx.append_message(format!(
                    "output {}/{} on for {} s",
                    output_id, channel, duration
                ));
            }
            ActionKind::OutputPwm {
                output_id,
                channel,
                duty_cycle,
            } => {
                let (output_id, channel) = target(ctx, output_id, *channel)?;
                let duty_cycle = ctx.override_f64("duty_cycle")?.unwrap_or(*duty_cycle);
                let status = self
                    .send_output(ctx, OutputCommand::pwm(&output_id, channel, duty_cycle))
                    .await?;
                ctx.append_message(format!(
                    "output {}/{} duty cycle {}%",
                    output_id, channel, status.amount
                ));
            }
            ActionKind::OutputRampPwm {
                output_id,
                channel,
                start_duty,
                end_duty,
                increment,
                step_duration,
            } => {
                let (output_id, channel) = target(ctx, output_id, *channel)?;
                let spec = RampSpec {
                    start_duty: ctx.override_f64("start_duty")?.unwrap_or(*start_duty),
                    end_duty: ctx.override_f64("end_duty")?.unwrap_or(*end_duty),
                    increment: *increment,
                    step_interval: secs(*step_duration),
                };
                self.ramp(action, ctx, &output_id, channel, spec).await?;
            }
            ActionKind::OutputValue {
                output_id,
                channel,
                value,
            } => {
                let (output_id, channel) = target(ctx, output_id, *channel)?;
                let value = ctx.override_f64("value")?.unwrap_or(*value);
                self.send_output(ctx, OutputCommand::value(&output_id, channel, value))
                    .await?;
                ctx.append_message(format!("output {}/{} value {}", output_id, channel, value));
            }
            ActionKind::OutputVolume {
                output_id,
                channel,
                volume,
            } => {
                let (output_id, channel) = target(ctx, output_id, *channel)?;
                let volume = ctx.override_f64("volume")?.unwrap_or(*volume);
                self.send_output(ctx, OutputCommand::volume(&output_id, channel, volume))
                    .await?;
                ctx.append_message(format!(
                    "output {}/{} volume {}",
                    output_id, channel, volume
                ));
            }
            ActionKind::PauseActions { duration } => {
                let duration = ctx.override_f64("duration")?.unwrap_or(*duration);
                debug!(seconds = duration, "Pausing action chain");
                tokio::time::sleep(secs(duration)).await;
            }
            ActionKind::ControllerActivate { controller_id } => {
                let controller_id = controller(ctx, controller_id)?;
                self.daemon()?.controller_activate(&controller_id).await?;
                ctx.append_message(format!("activated controller {}", controller_id));
            }
            ActionKind::ControllerDeactivate { controller_id } => {
                let controller_id = controller(ctx, controller_id)?;
                self.daemon()?.controller_deactivate(&controller_id).await?;
                ctx.append_message(format!("deactivated controller {}", controller_id));
            }
            ActionKind::PidSetSetpoint {
                controller_id,
                setpoint,
            } => {
                let controller_id = controller(ctx, controller_id)?;
                let setpoint = ctx.override_f64("setpoint")?.unwrap_or(*setpoint);
                self.daemon()?
                    .pid_set(&controller_id, PidSetting::Setpoint(setpoint))
                    .await?;
                ctx.append_message(format!(
                    "set setpoint of {} to {}",
                    controller_id, setpoint
                ));
            }
            ActionKind::PidPause { controller_id } => {
                let controller_id = controller(ctx, controller_id)?;
                self.daemon()?.controller_pause(&controller_id).await?;
                ctx.append_message(format!("paused {}", controller_id));
            }
            ActionKind::PidHold { controller_id } => {
                let controller_id = controller(ctx, controller_id)?;
                self.daemon()?.controller_hold(&controller_id).await?;
                ctx.append_message(format!("held {}", controller_id));
            }
            ActionKind::PidResume { controller_id } => {
                let controller_id = controller(ctx, controller_id)?;
                self.daemon()?.controller_resume(&controller_id).await?;
                ctx.append_message(format!("resumed {}", controller_id));
            }
            ActionKind::InputForceMeasurements { controller_id } => {
                let controller_id = controller(ctx, controller_id)?;
                let written = self
                    .daemon()?
                    .input_force_measurements(&controller_id)
                    .await?;
                ctx.append_message(format!(
                    "forced {} measurement(s) from {}",
                    written.len(),
                    controller_id
                ));
            }
            ActionKind::ReadMeasurement {
                measurement,
                max_age,
                key,
            } => {
                let max_age = secs(*max_age);
                let point = self
                    .store
                    .read_last(
                        &measurement.device_id,
                        measurement.channel,
                        measurement.kind.as_deref(),
                        max_age,
                    )
                    .await?;
                match point {
                    Some(point) => {
                        ctx.value.insert(key.clone(), Value::from(point.value));
                    }
                    None => {
                        ctx.value.insert(key.clone(), Value::Null);
                        return Err(ActionError::StaleData {
                            key: MeasurementKey::new(
                                measurement.device_id.clone(),
                                measurement.channel,
                            ),
                            max_age,
                        });
                    }
                }
            }
            ActionKind::MeasurementEquation { equation, channel } => {
                self.apply_equation(ctx, equation, *channel)?;
            }
            ActionKind::MeasurementConvertUnit { to, channel } => {
                convert_units(ctx, to, *channel)?;
            }
            ActionKind::LogMessage { message, level } => {
                let owner = ctx.owner_id.as_str();
                match level {
                    LogLevel::Debug => debug!(owner_id = owner, "{}", message),
                    LogLevel::Info => info!(owner_id = owner, "{}", message),
                    LogLevel::Warn => warn!(owner_id = owner, "{}", message),
                    LogLevel::Error => error!(owner_id = owner, "{}", message),
                }
                ctx.append_message(message);
            }
            ActionKind::FireEvent { event_type, data } => {
                self.fire_event(action, ctx, event_type, data)?;
            }
            ActionKind::SendEmail { to, subject } => {
                let notification = self.notification(
                    action,
                    ctx,
                    NotificationKind::Email,
                    to,
                    Some(subject.clone()),
                    None,
                );
                self.notify(action, ctx, notification).await?;
            }
            ActionKind::MqttPublish { topic, payload } => {
                let mut notification =
                    self.notification(action, ctx, NotificationKind::Mqtt, topic, None, None);
                if let Some(payload) = payload {
                    notification.body = payload.clone();
                }
                self.notify(action, ctx, notification).await?;
            }
            ActionKind::Webhook { url, method } => {
                let notification = self.notification(
                    action,
                    ctx,
                    NotificationKind::Webhook,
                    url,
                    None,
                    Some(method.clone()),
                );
                self.notify(action, ctx, notification).await?;
            }
            ActionKind::CameraCapture { camera_id } => {
                let notification = self.notification(
                    action,
                    ctx,
                    NotificationKind::Camera,
                    camera_id,
                    None,
                    None,
                );
                self.notify(action, ctx, notification).await?;
            }
        }
        Ok(())
    }

    fn daemon(&self) -> ActionResult<Arc<dyn DaemonHandle>> {
        self.daemon
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or(ActionError::Daemon(HandleError::Unavailable))
    }

    async fn send_output(
        &self,
        ctx: &ActionContext,
        command: OutputCommand,
    ) -> ActionResult<hc_core::OutputStatus> {
        let command = command.with_context(ctx.context.child());
        Ok(self.arbiter.command(command).await?)
    }

    async fn ramp(
        &self,
        action: &ActionConfig,
        ctx: &mut ActionContext,
        output_id: &str,
        channel: u32,
        spec: RampSpec,
    ) -> ActionResult<()> {
        let (start, end) = (spec.start_duty, spec.end_duty);
        let handle = self
            .arbiter
            .ramp(output_id, channel, spec, ctx.context.child())
            .await?;

        if !action.wait {
            ctx.append_message(format!(
                "output {}/{} ramping {}% to {}%",
                output_id, channel, start, end
            ));
            return Ok(());
        }

        match handle.wait().await {
            RampOutcome::Completed => {
                ctx.append_message(format!(
                    "output {}/{} ramped {}% to {}%",
                    output_id, channel, start, end
                ));
                Ok(())
            }
            RampOutcome::Preempted { last_duty } => {
                ctx.append_message(format!(
                    "output {}/{} ramp preempted at {}",
                    output_id,
                    channel,
                    last_duty.map_or_else(|| "start".to_string(), |d| format!("{}%", d))
                ));
                Ok(())
            }
            RampOutcome::Failed(e) => Err(ActionError::Ramp(e.to_string())),
        }
    }

    fn apply_equation(
        &self,
        ctx: &mut ActionContext,
        equation: &str,
        channel: Option<u32>,
    ) -> ActionResult<()> {
        let measurements = ctx.measurements.as_mut().ok_or(ActionError::NoMeasurements)?;
        if let Some(ch) = channel {
            if !measurements.contains_key(&ch) {
                return Err(ActionError::UnknownChannel(ch));
            }
        }

        // Evaluate every channel before touching any of them
        let mut results = Vec::new();
        for (ch, m) in measurements.iter() {
            if channel.map_or(true, |c| c == *ch) {
                results.push((*ch, m.value, self.expressions.apply(equation, m.value)?));
            }
        }

        let mut lines = Vec::with_capacity(results.len());
        for (ch, before, after) in results {
            if let Some(m) = measurements.get_mut(&ch) {
                m.value = after;
            }
            lines.push(format!("channel {}: {} -> {}", ch, before, after));
        }
        for line in lines {
            ctx.append_message(line);
        }
        Ok(())
    }

    fn fire_event(
        &self,
        action: &ActionConfig,
        ctx: &ActionContext,
        event_type: &str,
        data: &Value,
    ) -> ActionResult<()> {
        let mut payload = match data {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("data".to_string(), other.clone());
                map
            }
        };
        payload
            .entry("owner_id")
            .or_insert_with(|| Value::from(ctx.owner_id.clone()));
        payload
            .entry("message")
            .or_insert_with(|| Value::from(ctx.message.clone()));

        let event = Event::new(event_type, Value::Object(payload), ctx.context.child());
        if action.wait {
            self.event_bus.fire(event);
            return Ok(());
        }

        let bus = self.event_bus.clone();
        self.pool.spawn(async move {
            bus.fire(event);
        })?;
        Ok(())
    }

    fn notification(
        &self,
        action: &ActionConfig,
        ctx: &ActionContext,
        kind: NotificationKind,
        target: &str,
        subject: Option<String>,
        method: Option<String>,
    ) -> Notification {
        Notification {
            kind,
            action_id: action.id.clone(),
            owner_id: ctx.owner_id.clone(),
            target: target.to_string(),
            subject,
            body: ctx.message.clone(),
            method,
            data: Value::Object(ctx.value.clone()),
        }
    }

    /// Dispatch a notification unless the action sent one too recently
    async fn notify(
        &self,
        action: &ActionConfig,
        ctx: &mut ActionContext,
        notification: Notification,
    ) -> ActionResult<()> {
        let kind = notification.kind;
        if !self.claim_send_slot(action) {
            debug!(action_id = %action.id, "Notification rate limited");
            ctx.append_message(format!(
                "[Action {}] {} skipped: sent less than {} s ago",
                action.id,
                kind,
                action.min_interval.unwrap_or_default()
            ));
            return Ok(());
        }

        let sink = self.sinks.get(kind).ok_or(ActionError::NoSink(kind))?;
        let target = notification.target.clone();

        if action.wait {
            sink.send(notification)
                .await
                .map_err(|source| ActionError::Notification { kind, source })?;
            ctx.append_message(format!("{} sent to {}", kind, target));
            return Ok(());
        }

        let action_id = action.id.clone();
        self.pool.spawn(async move {
            if let Err(e) = sink.send(notification).await {
                warn!(action_id = %action_id, kind = %kind, error = %e, "Notification failed");
            }
        })?;
        ctx.append_message(format!("{} queued to {}", kind, target));
        Ok(())
    }

    /// Record a send now if the action's minimum interval has elapsed
    fn claim_send_slot(&self, action: &ActionConfig) -> bool {
        let Some(interval) = action.min_interval() else {
            return true;
        };
        let now = Instant::now();
        match self.last_sent.entry(action.id.clone()) {
            Entry::Occupied(mut last) => {
                if now.duration_since(*last.get()) < interval {
                    false
                } else {
                    last.insert(now);
                    true
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }
}

/// Output id and channel after overrides
fn target(ctx: &ActionContext, output_id: &str, channel: u32) -> ActionResult<(String, u32)> {
    let output_id = ctx.override_str("output_id")?.unwrap_or(output_id).to_string();
    let channel = ctx.override_channel("channel")?.unwrap_or(channel);
    Ok((output_id, channel))
}

fn controller(ctx: &ActionContext, controller_id: &str) -> ActionResult<String> {
    Ok(ctx
        .override_str("controller_id")?
        .unwrap_or(controller_id)
        .to_string())
}

fn convert_units(ctx: &mut ActionContext, to: &str, channel: Option<u32>) -> ActionResult<()> {
    let measurements = ctx.measurements.as_mut().ok_or(ActionError::NoMeasurements)?;
    if let Some(ch) = channel {
        if !measurements.contains_key(&ch) {
            return Err(ActionError::UnknownChannel(ch));
        }
    }

    let mut converted = Vec::new();
    for (ch, m) in measurements.iter() {
        if channel.map_or(true, |c| c == *ch) {
            let value = units::convert(m.value, &m.unit, to).ok_or_else(|| {
                ActionError::UnsupportedConversion {
                    from: m.unit.clone(),
                    to: to.to_string(),
                }
            })?;
            converted.push((*ch, value));
        }
    }

    let mut lines = Vec::with_capacity(converted.len());
    for (ch, value) in converted {
        if let Some(m) = measurements.get_mut(&ch) {
            lines.push(format!(
                "channel {}: {} {} -> {} {}",
                ch, m.value, m.unit, value, to
            ));
            m.value = value;
            m.unit = to.to_string();
        }
    }
    for line in lines {
        ctx.append_message(line);
    }
    Ok(())
}
