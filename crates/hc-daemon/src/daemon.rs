//! The daemon facade and its builder

use crate::factory::DaemonControllerFactory;
use crate::{DaemonError, DaemonResult};
use async_trait::async_trait;
use hc_actions::{
    ActionContext, ActionPipeline, NotificationKind, NotificationSink, NotificationSinks,
    WebhookSink,
};
use hc_config::{
    secs, ConfigProvider, ControllerConfig, ControllerOptions, DaemonConfig, DaemonSettings,
    OutputConfig, OutputDriverConfig, PidOptions, SharedConfig,
};
use hc_core::{
    ControllerKind, ControllerStatus, DaemonHandle, Context, HandleResult, Measurement,
    OutputCommand, OutputMode, OutputStatus, PidSetting,
};
use hc_event_bus::EventBus;
use hc_measurement_store::{MemoryMeasurementStore, SharedMeasurementStore};
use hc_output::{CommandDriver, CommandTemplates, MemoryDriver, OutputArbiter, OutputDriver};
use hc_runtime::{ControllerFactory, ControllerRuntime};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Origin recorded on commands issued by the daemon itself
pub const DAEMON_ORIGIN: &str = "daemon";

/// Time queued side effects get to finish on shutdown
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Assembles a [`Daemon`] from its configuration
///
/// Output drivers, the measurement store, notification sinks and the
/// controller factory default to what the configuration describes and can
/// each be replaced before building.
pub struct DaemonBuilder {
    config: DaemonConfig,
    store: Option<SharedMeasurementStore>,
    drivers: HashMap<String, Arc<dyn OutputDriver>>,
    sinks: Option<NotificationSinks>,
    factory: Option<Arc<dyn ControllerFactory>>,
}

impl DaemonBuilder {
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            config,
            store: None,
            drivers: HashMap::new(),
            sinks: None,
            factory: None,
        }
    }

    pub fn with_store(mut self, store: SharedMeasurementStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Use `driver` for `output_id` instead of the configured one
    pub fn with_driver(mut self, output_id: impl Into<String>, driver: Arc<dyn OutputDriver>) -> Self {
        self.drivers.insert(output_id.into(), driver);
        self
    }

    pub fn with_sinks(mut self, sinks: NotificationSinks) -> Self {
        self.sinks = Some(sinks);
        self
    }

    pub fn with_factory(mut self, factory: Arc<dyn ControllerFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn build(mut self) -> Arc<Daemon> {
        let settings = self.config.daemon.clone();
        let event_bus = Arc::new(EventBus::new());

        let arbiter = Arc::new(OutputArbiter::new().with_event_bus(event_bus.clone()));
        for output in &self.config.outputs {
            let driver = self
                .drivers
                .remove(&output.id)
                .unwrap_or_else(|| driver_for(output));
            arbiter.register(output.id.clone(), driver);
        }
        for (output_id, driver) in self.drivers {
            warn!(output_id = %output_id, "Registering driver for an unconfigured output");
            arbiter.register(output_id, driver);
        }

        let store: SharedMeasurementStore = match self.store {
            Some(store) => store,
            None => Arc::new(
                MemoryMeasurementStore::with_capacity(settings.measurement_capacity)
                    .with_event_bus(event_bus.clone()),
            ),
        };
        let sinks = self.sinks.unwrap_or_else(|| default_sinks(&settings));
        let factory: Arc<dyn ControllerFactory> = match self.factory {
            Some(factory) => factory,
            None => Arc::new(DaemonControllerFactory::new()),
        };
        let config = Arc::new(SharedConfig::new(self.config));

        info!(
            outputs = arbiter.output_ids().len(),
            controllers = config.controllers().len(),
            "Daemon assembled"
        );

        Arc::new_cyclic(|weak: &Weak<Daemon>| {
            let handle: Weak<dyn DaemonHandle> = weak.clone();
            let actions = Arc::new(
                ActionPipeline::new(config.clone(), store, arbiter, event_bus)
                    .with_daemon(handle)
                    .with_sinks(sinks)
                    .with_side_effect_workers(settings.side_effect_workers),
            );
            let runtime = ControllerRuntime::new(config.clone(), actions, factory)
                .with_max_consecutive_failures(settings.max_consecutive_failures);
            Daemon { config, runtime }
        })
    }
}

fn driver_for(output: &OutputConfig) -> Arc<dyn OutputDriver> {
    match &output.driver {
        OutputDriverConfig::Memory { channels } => Arc::new(MemoryDriver::new(*channels)),
        OutputDriverConfig::Command {
            channels,
            on,
            off,
            pwm,
            value,
            volume,
            timeout,
        } => {
            let templates = CommandTemplates {
                on: on.clone(),
                off: off.clone(),
                pwm: pwm.clone(),
                value: value.clone(),
                volume: volume.clone(),
            };
            Arc::new(CommandDriver::new(templates, *channels).with_timeout(secs(*timeout)))
        }
    }
}

fn default_sinks(settings: &DaemonSettings) -> NotificationSinks {
    let sinks = NotificationSinks::with_defaults();
    if let Some(url) = &settings.notification_webhook {
        let webhook: Arc<dyn NotificationSink> = Arc::new(WebhookSink::fixed(url.clone()));
        for kind in [
            NotificationKind::Email,
            NotificationKind::Mqtt,
            NotificationKind::Camera,
        ] {
            sinks.register(kind, webhook.clone());
        }
    }
    sinks
}

/// The running daemon
///
/// All commands are async and complete when the operation has completed.
/// Commands against different controllers or output channels proceed
/// concurrently.
pub struct Daemon {
    config: Arc<SharedConfig>,
    runtime: ControllerRuntime,
}

impl Daemon {
    pub fn config(&self) -> &Arc<SharedConfig> {
        &self.config
    }

    pub fn runtime(&self) -> &ControllerRuntime {
        &self.runtime
    }

    pub fn actions(&self) -> &Arc<ActionPipeline> {
        self.runtime.actions()
    }

    pub fn arbiter(&self) -> &Arc<OutputArbiter> {
        self.actions().arbiter()
    }

    pub fn store(&self) -> &SharedMeasurementStore {
        self.actions().store()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        self.actions().event_bus()
    }

    fn controller_config(&self, controller_id: &str) -> DaemonResult<ControllerConfig> {
        self.config
            .controller(controller_id)
            .ok_or_else(|| DaemonError::UnknownController(controller_id.to_string()))
    }

    fn expect_kind(config: &ControllerConfig, expected: ControllerKind) -> DaemonResult<()> {
        let actual = config.kind();
        if actual != expected {
            return Err(DaemonError::WrongKind {
                controller_id: config.id.clone(),
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Activate every controller flagged `activate_on_start`
    ///
    /// A controller that fails to activate is logged and skipped. Returns
    /// how many were activated.
    pub async fn start(&self) -> usize {
        let mut activated = 0;
        for controller in self.config.controllers() {
            if !controller.activate_on_start {
                continue;
            }
            match self.runtime.activate(&controller.id).await {
                Ok(()) => activated += 1,
                Err(e) => {
                    warn!(controller_id = %controller.id, error = %e, "Activation on start failed")
                }
            }
        }
        info!(activated, "Daemon started");
        activated
    }

    /// Stop every controller, drain side effects, then turn all outputs off
    pub async fn shutdown(&self, grace: Duration) {
        info!("Shutting down");
        self.runtime.shutdown().await;

        let aborted = self.actions().shutdown(grace).await;
        if aborted > 0 {
            warn!(aborted, "Side effects aborted at shutdown");
        }

        let failures = self
            .arbiter()
            .off_all(Context::with_origin(DAEMON_ORIGIN))
            .await;
        if !failures.is_empty() {
            warn!(failures = failures.len(), "Some outputs could not be turned off");
        }
        info!("Daemon stopped");
    }

    pub async fn controller_activate(&self, controller_id: &str) -> DaemonResult<()> {
        self.runtime.activate(controller_id).await?;
        Ok(())
    }

    pub async fn controller_deactivate(&self, controller_id: &str) -> DaemonResult<()> {
        self.runtime.deactivate(controller_id).await?;
        Ok(())
    }

    pub fn controller_pause(&self, controller_id: &str) -> DaemonResult<()> {
        self.runtime.pause(controller_id)?;
        Ok(())
    }

    pub fn controller_hold(&self, controller_id: &str) -> DaemonResult<()> {
        self.runtime.hold(controller_id)?;
        Ok(())
    }

    pub fn controller_resume(&self, controller_id: &str) -> DaemonResult<()> {
        self.runtime.resume(controller_id)?;
        Ok(())
    }

    pub fn controller_status(&self, controller_id: &str) -> DaemonResult<ControllerStatus> {
        Ok(self.runtime.status(controller_id)?)
    }

    pub fn controller_statuses(&self) -> Vec<ControllerStatus> {
        self.runtime.statuses()
    }

    /// Turn a channel on in `mode`, `amount` read as that mode's unit
    pub async fn output_on(
        &self,
        output_id: &str,
        channel: u32,
        mode: OutputMode,
        amount: f64,
    ) -> DaemonResult<OutputStatus> {
        let command = match mode {
            OutputMode::Duration => OutputCommand::duration(output_id, channel, amount),
            OutputMode::Pwm => OutputCommand::pwm(output_id, channel, amount),
            OutputMode::Value => OutputCommand::value(output_id, channel, amount),
            OutputMode::Volume => OutputCommand::volume(output_id, channel, amount),
        };
        let command = command.with_context(Context::with_origin(DAEMON_ORIGIN));
        Ok(self.arbiter().command(command).await?)
    }

    pub async fn output_off(&self, output_id: &str, channel: u32) -> DaemonResult<OutputStatus> {
        let command =
            OutputCommand::off(output_id, channel).with_context(Context::with_origin(DAEMON_ORIGIN));
        Ok(self.arbiter().command(command).await?)
    }

    /// Last commanded status, `None` if the channel was never commanded
    pub async fn output_state(
        &self,
        output_id: &str,
        channel: u32,
    ) -> DaemonResult<Option<OutputStatus>> {
        Ok(self.arbiter().status(output_id, channel).await?)
    }

    /// Change a PID field from a loosely typed value
    ///
    /// The change is kept in the configuration and, when the controller is
    /// active, applied to its loop between steps.
    pub async fn pid_set(&self, controller_id: &str, field: &str, value: &Value) -> DaemonResult<()> {
        let setting = PidSetting::parse(field, value)?;
        self.apply_pid_setting(controller_id, setting).await
    }

    #[instrument(skip(self))]
    async fn apply_pid_setting(&self, controller_id: &str, setting: PidSetting) -> DaemonResult<()> {
        self.controller_config(controller_id)?;
        self.config.update_controller(controller_id, |config| {
            Self::expect_kind(config, ControllerKind::Pid)?;
            if let ControllerOptions::Pid(options) = &mut config.options {
                store_setting(options, setting);
            }
            Ok::<(), DaemonError>(())
        })?;

        if self.runtime.is_active(controller_id) {
            self.runtime.apply_setting(controller_id, setting).await?;
        }
        info!(controller_id, ?setting, "PID setting changed");
        Ok(())
    }

    /// Run an active input's acquisition now
    pub async fn input_force_measurements(&self, controller_id: &str) -> DaemonResult<Vec<Measurement>> {
        let config = self.controller_config(controller_id)?;
        Self::expect_kind(&config, ControllerKind::Input)?;
        let context = Context::with_origin(DAEMON_ORIGIN);
        Ok(self.runtime.force_measurements(controller_id, context).await?)
    }

    /// Run a controller's whole action chain on a worker task
    ///
    /// Returns the context as left by the last action.
    pub async fn trigger_all_actions(
        &self,
        owner_id: &str,
        seed: ActionContext,
    ) -> DaemonResult<ActionContext> {
        self.controller_config(owner_id)?;

        let actions = self.actions().clone();
        let owner = owner_id.to_string();
        tokio::spawn(async move { actions.run_all_actions(&owner, seed).await })
            .await
            .map_err(|e| DaemonError::Task(e.to_string()))
    }

    /// Replace an inactive controller's configuration
    pub fn update_controller_config(&self, controller: ControllerConfig) -> DaemonResult<()> {
        if self.runtime.is_active(&controller.id) {
            return Err(DaemonError::ControllerActive(controller.id));
        }
        self.config.replace_controller(controller)?;
        Ok(())
    }
}

fn store_setting(options: &mut PidOptions, setting: PidSetting) {
    match setting {
        PidSetting::Setpoint(v) => options.setpoint = v,
        PidSetting::Kp(v) => options.kp = v,
        PidSetting::Ki(v) => options.ki = v,
        PidSetting::Kd(v) => options.kd = v,
        PidSetting::IntegratorMin(v) => options.integrator_min = v,
        PidSetting::IntegratorMax(v) => options.integrator_max = v,
        PidSetting::Direction(d) => options.direction = d,
    }
}

#[async_trait]
impl DaemonHandle for Daemon {
    async fn controller_activate(&self, controller_id: &str) -> HandleResult<()> {
        Ok(Daemon::controller_activate(self, controller_id).await?)
    }

    async fn controller_deactivate(&self, controller_id: &str) -> HandleResult<()> {
        Ok(Daemon::controller_deactivate(self, controller_id).await?)
    }

    async fn controller_pause(&self, controller_id: &str) -> HandleResult<()> {
        Ok(Daemon::controller_pause(self, controller_id)?)
    }

    async fn controller_hold(&self, controller_id: &str) -> HandleResult<()> {
        Ok(Daemon::controller_hold(self, controller_id)?)
    }

    async fn controller_resume(&self, controller_id: &str) -> HandleResult<()> {
        Ok(Daemon::controller_resume(self, controller_id)?)
    }

    async fn pid_set(&self, controller_id: &str, setting: PidSetting) -> HandleResult<()> {
        Ok(self.apply_pid_setting(controller_id, setting).await?)
    }

    async fn input_force_measurements(&self, controller_id: &str) -> HandleResult<Vec<Measurement>> {
        Ok(Daemon::input_force_measurements(self, controller_id).await?)
    }

    fn controller_status(&self, controller_id: &str) -> HandleResult<ControllerStatus> {
        Ok(Daemon::controller_status(self, controller_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hc_core::Direction;

    fn pid_options() -> PidOptions {
        let config = DaemonConfig::from_yaml_str(
            r#"
controllers:
  - id: pid
    options: { type: pid, measurement: { device_id: probe }, setpoint: 20 }
"#,
        )
        .unwrap();
        match &config.controllers[0].options {
            ControllerOptions::Pid(options) => options.clone(),
            other => panic!("unexpected options {:?}", other),
        }
    }

    #[test]
    fn test_store_setting_updates_each_field() {
        let mut options = pid_options();
        store_setting(&mut options, PidSetting::Setpoint(24.0));
        store_setting(&mut options, PidSetting::Kp(2.0));
        store_setting(&mut options, PidSetting::IntegratorMax(50.0));
        store_setting(&mut options, PidSetting::Direction(Direction::Both));

        assert_eq!(options.setpoint, 24.0);
        assert_eq!(options.kp, 2.0);
        assert_eq!(options.ki, 0.0);
        assert_eq!(options.integrator_max, 50.0);
        assert_eq!(options.direction, Direction::Both);
    }
}
