//! The controller seam and what a controller sees of the daemon

use crate::{ControllerError, ControllerResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hc_actions::{ActionContext, ActionPipeline};
use hc_config::{ControllerConfig, MeasurementRef};
use hc_core::{Context, Measurement, OutputCommand, OutputStatus, PidSetting};
use hc_event_bus::EventBus;
use hc_measurement_store::SharedMeasurementStore;
use hc_output::OutputArbiter;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// What the runtime should do after a step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    /// The controller finished its job and asks to be deactivated
    Deactivate { reason: String },
}

/// Timing and flags of one step
#[derive(Debug, Clone)]
pub struct Tick {
    /// Wall-clock time, used for measurement timestamps
    pub now: DateTime<Utc>,
    /// Monotonic time, used for elapsed-time math
    pub instant: Instant,
    pub paused: bool,
    pub held: bool,
    pub context: Context,
}

impl Tick {
    pub fn new(context: Context) -> Self {
        Self {
            now: Utc::now(),
            instant: Instant::now(),
            paused: false,
            held: false,
            context,
        }
    }

    pub fn paused(mut self, paused: bool) -> Self {
        self.paused = paused;
        self
    }

    pub fn held(mut self, held: bool) -> Self {
        self.held = held;
        self
    }
}

/// One controller loop
///
/// `step` is never called concurrently with itself or with any other
/// method of the same controller.
#[async_trait]
pub trait Controller: Send {
    /// Prepare for the first step; failing here aborts activation
    async fn initialize(&mut self, _env: &ControllerEnv) -> ControllerResult<()> {
        Ok(())
    }

    async fn step(&mut self, env: &ControllerEnv, tick: &Tick) -> ControllerResult<StepOutcome>;

    /// Bring outputs to a safe state after the last step
    async fn stop(&mut self, _env: &ControllerEnv, _context: &Context) -> ControllerResult<()> {
        Ok(())
    }

    /// Change a field while active
    fn apply_setting(&mut self, _setting: PidSetting) -> ControllerResult<()> {
        Err(ControllerError::Unsupported("changing settings while active"))
    }

    /// Acquire and store measurements outside the regular schedule
    async fn force_measurements(
        &mut self,
        _env: &ControllerEnv,
        _context: &Context,
    ) -> ControllerResult<Vec<Measurement>> {
        Err(ControllerError::Unsupported("forcing measurements"))
    }

    /// Kind-specific diagnostics for the status snapshot
    fn detail(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// Daemon services available to one controller
#[derive(Clone)]
pub struct ControllerEnv {
    pub controller_id: String,
    pub debug: bool,
    pub period: Duration,
    pub store: SharedMeasurementStore,
    pub arbiter: Arc<OutputArbiter>,
    pub event_bus: Arc<EventBus>,
    pub actions: Arc<ActionPipeline>,
}

impl ControllerEnv {
    pub fn new(config: &ControllerConfig, actions: Arc<ActionPipeline>) -> Self {
        Self {
            controller_id: config.id.clone(),
            debug: config.debug,
            period: config.period(),
            store: actions.store().clone(),
            arbiter: actions.arbiter().clone(),
            event_bus: actions.event_bus().clone(),
            actions,
        }
    }

    /// Step-level log line: debug when the controller's debug flag is set
    pub fn log_step(&self, message: std::fmt::Arguments<'_>) {
        if self.debug {
            debug!(controller_id = %self.controller_id, "{}", message);
        } else {
            trace!(controller_id = %self.controller_id, "{}", message);
        }
    }

    /// Latest point of `measurement` no older than `max_age`
    pub async fn read_fresh(
        &self,
        measurement: &MeasurementRef,
        max_age: Duration,
    ) -> ControllerResult<Option<Measurement>> {
        Ok(self
            .store
            .read_last(
                &measurement.device_id,
                measurement.channel,
                measurement.kind.as_deref(),
                max_age,
            )
            .await?)
    }

    /// Points of `measurement` from the last `max_age`, oldest first
    pub async fn read_window(
        &self,
        measurement: &MeasurementRef,
        max_age: Duration,
    ) -> ControllerResult<Vec<Measurement>> {
        let points = self
            .store
            .read_past(&measurement.device_id, measurement.channel, max_age)
            .await?;
        Ok(match &measurement.kind {
            Some(kind) => points.into_iter().filter(|m| &m.kind == kind).collect(),
            None => points,
        })
    }

    /// Store a point derived by this controller on `channel`
    pub async fn write_derived(
        &self,
        channel: u32,
        kind: &str,
        unit: &str,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> ControllerResult<Measurement> {
        let measurement = Measurement::new(
            self.controller_id.clone(),
            channel,
            kind,
            unit,
            value,
            timestamp,
        );
        self.store.write(measurement.clone()).await?;
        Ok(measurement)
    }

    /// Send a command attributed to this controller
    pub async fn command(
        &self,
        command: OutputCommand,
        context: &Context,
    ) -> ControllerResult<OutputStatus> {
        let command = command.with_context(context.child_with_origin(self.controller_id.clone()));
        Ok(self.arbiter.command(command).await?)
    }

    /// Run this controller's action chain
    pub async fn run_actions(&self, ctx: ActionContext) -> ActionContext {
        self.actions.run_all_actions(&self.controller_id, ctx).await
    }

    /// Fresh chain context owned by this controller
    pub fn action_context(&self, context: &Context) -> ActionContext {
        ActionContext::new(self.controller_id.clone())
            .with_context(context.child_with_origin(self.controller_id.clone()))
    }
}
