//! Controller lifecycle: activation, flags, commands and shutdown

use crate::schedule::TickSchedule;
use crate::slot::{ControllerSlot, RunningLoop};
use crate::task::{current_controller, ControllerLoop, LoopCommand};
use crate::{ControllerFactory, RuntimeError, RuntimeResult};
use dashmap::DashMap;
use hc_actions::ActionPipeline;
use hc_config::ConfigProvider;
use hc_controllers::ControllerEnv;
use hc_core::{ActivationState, Context, ControllerStatus, Measurement, PidSetting};
use hc_event_bus::EventBus;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Default number of failed steps in a row tolerated before deactivation
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 10;

const COMMAND_QUEUE: usize = 16;

/// How long a controller loop waits for another controller to stop
pub const CROSS_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs one loop task per active controller
pub struct ControllerRuntime {
    config: Arc<dyn ConfigProvider>,
    actions: Arc<ActionPipeline>,
    factory: Arc<dyn ControllerFactory>,
    event_bus: Arc<EventBus>,
    max_consecutive_failures: u32,
    slots: DashMap<String, Arc<ControllerSlot>>,
}

impl ControllerRuntime {
    pub fn new(
        config: Arc<dyn ConfigProvider>,
        actions: Arc<ActionPipeline>,
        factory: Arc<dyn ControllerFactory>,
    ) -> Self {
        Self {
            event_bus: actions.event_bus().clone(),
            config,
            actions,
            factory,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            slots: DashMap::new(),
        }
    }

    pub fn with_max_consecutive_failures(mut self, max: u32) -> Self {
        self.max_consecutive_failures = max.max(1);
        self
    }

    pub fn actions(&self) -> &Arc<ActionPipeline> {
        &self.actions
    }

    fn slot(&self, controller_id: &str) -> RuntimeResult<Arc<ControllerSlot>> {
        if let Some(slot) = self.slots.get(controller_id) {
            return Ok(slot.clone());
        }
        let config = self
            .config
            .controller(controller_id)
            .ok_or_else(|| RuntimeError::UnknownController(controller_id.to_string()))?;
        let slot = self
            .slots
            .entry(controller_id.to_string())
            .or_insert_with(|| Arc::new(ControllerSlot::new(controller_id, config.kind())))
            .clone();
        Ok(slot)
    }

    /// Build, initialize and start a controller's loop
    #[instrument(skip(self))]
    pub async fn activate(&self, controller_id: &str) -> RuntimeResult<()> {
        let slot = self.slot(controller_id)?;
        let _lifecycle = slot.lifecycle.lock().await;

        if slot.has_live_loop() {
            return Err(RuntimeError::AlreadyActive(controller_id.to_string()));
        }
        // A loop that ended on its own leaves its handles behind
        drop(slot.take_running());

        let config = self
            .config
            .controller(controller_id)
            .ok_or_else(|| RuntimeError::UnknownController(controller_id.to_string()))?;
        slot.transition(ActivationState::Activating, &self.event_bus)?;
        slot.update(|status| {
            status.kind = config.kind();
            status.last_error = None;
            status.consecutive_failures = 0;
        });

        let env = ControllerEnv::new(&config, self.actions.clone());
        let built = match self.factory.build(&config) {
            Ok(mut controller) => match controller.initialize(&env).await {
                Ok(()) => Ok(controller),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        let controller = match built {
            Ok(controller) => controller,
            Err(source) => {
                warn!(controller_id, error = %source, "Activation failed");
                slot.update(|status| status.last_error = Some(source.to_string()));
                slot.transition(ActivationState::Inactive, &self.event_bus)?;
                return Err(RuntimeError::Activation {
                    controller_id: controller_id.to_string(),
                    source,
                });
            }
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        // Active before the task exists so the first step sees it
        slot.transition(ActivationState::Active, &self.event_bus)?;
        let task = ControllerLoop {
            slot: slot.clone(),
            controller,
            env,
            schedule: TickSchedule::new(Instant::now() + config.start_offset(), config.period()),
            event_bus: self.event_bus.clone(),
            max_consecutive_failures: self.max_consecutive_failures,
            stop: stop_rx,
            commands: command_rx,
        }
        .spawn();

        slot.set_running(RunningLoop {
            stop: stop_tx,
            commands: command_tx,
            task,
        });
        info!(controller_id, "Controller activated");
        Ok(())
    }

    /// Stop a controller's loop and bring its outputs to a safe state
    ///
    /// Waits for the loop to finish its current step and run `stop`. A
    /// controller stopping itself from its own action chain only signals the
    /// stop, as its loop cannot finish while the chain runs. Another
    /// controller's loop waits at most [`CROSS_STOP_TIMEOUT`], which bounds
    /// two loops stopping each other at once.
    #[instrument(skip(self))]
    pub async fn deactivate(&self, controller_id: &str) -> RuntimeResult<()> {
        let slot = self.slot(controller_id)?;
        let _lifecycle = slot.lifecycle.lock().await;

        let Some(running) = slot.take_running() else {
            return Err(RuntimeError::NotActive(controller_id.to_string()));
        };
        if running.task.is_finished() {
            return Err(RuntimeError::NotActive(controller_id.to_string()));
        }

        // The loop may be ending on its own and already be deactivating
        if let Err(e) = slot.ensure(ActivationState::Deactivating, &self.event_bus) {
            debug!(controller_id, error = %e, "Loop already stopping");
        }
        let _ = running.stop.send(true);

        let caller = current_controller();
        if caller.as_deref() == Some(controller_id) {
            info!(controller_id, "Self-deactivation signalled");
            return Ok(());
        }

        let mut task = running.task;
        let joined = match caller {
            Some(caller) => match tokio::time::timeout(CROSS_STOP_TIMEOUT, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(controller_id, caller = %caller, "Controller did not stop in time");
                    return Err(RuntimeError::StopTimeout {
                        controller_id: controller_id.to_string(),
                        waited: CROSS_STOP_TIMEOUT,
                    });
                }
            },
            None => task.await,
        };
        if let Err(e) = joined {
            warn!(controller_id, error = %e, "Controller loop task failed");
            slot.update(|status| status.last_error = Some(e.to_string()));
            slot.ensure(ActivationState::Inactive, &self.event_bus)?;
        }
        info!(controller_id, "Controller deactivated");
        Ok(())
    }

    fn set_flag(&self, controller_id: &str, to: ActivationState) -> RuntimeResult<()> {
        let slot = self.slot(controller_id)?;
        if !slot.state().is_running() {
            return Err(RuntimeError::NotActive(controller_id.to_string()));
        }
        slot.ensure(to, &self.event_bus)
    }

    /// Skip steps until resumed
    pub fn pause(&self, controller_id: &str) -> RuntimeResult<()> {
        self.set_flag(controller_id, ActivationState::Paused)
    }

    /// Keep reading inputs but stop changing outputs until resumed
    pub fn hold(&self, controller_id: &str) -> RuntimeResult<()> {
        self.set_flag(controller_id, ActivationState::Held)
    }

    pub fn resume(&self, controller_id: &str) -> RuntimeResult<()> {
        self.set_flag(controller_id, ActivationState::Active)
    }

    /// Change a field of an active controller between steps
    pub async fn apply_setting(&self, controller_id: &str, setting: PidSetting) -> RuntimeResult<()> {
        let commands = self.slot(controller_id)?.command_sender()?;

        // The own loop is busy running the caller; apply after this step
        if current_controller().as_deref() == Some(controller_id) {
            commands
                .send(LoopCommand::Apply {
                    setting,
                    reply: None,
                })
                .await
                .map_err(|_| RuntimeError::LoopGone(controller_id.to_string()))?;
            return Ok(());
        }

        let (reply, result) = oneshot::channel();
        commands
            .send(LoopCommand::Apply {
                setting,
                reply: Some(reply),
            })
            .await
            .map_err(|_| RuntimeError::LoopGone(controller_id.to_string()))?;
        result
            .await
            .map_err(|_| RuntimeError::LoopGone(controller_id.to_string()))??;
        Ok(())
    }

    /// Run an active input's acquisition between steps
    pub async fn force_measurements(
        &self,
        controller_id: &str,
        context: Context,
    ) -> RuntimeResult<Vec<Measurement>> {
        if current_controller().as_deref() == Some(controller_id) {
            return Err(RuntimeError::Reentrant(controller_id.to_string()));
        }
        let commands = self.slot(controller_id)?.command_sender()?;

        let (reply, result) = oneshot::channel();
        commands
            .send(LoopCommand::Force { context, reply })
            .await
            .map_err(|_| RuntimeError::LoopGone(controller_id.to_string()))?;
        let measurements = result
            .await
            .map_err(|_| RuntimeError::LoopGone(controller_id.to_string()))??;
        Ok(measurements)
    }

    pub fn status(&self, controller_id: &str) -> RuntimeResult<ControllerStatus> {
        Ok(self.slot(controller_id)?.status())
    }

    /// Status of every configured controller, in configuration order
    pub fn statuses(&self) -> Vec<ControllerStatus> {
        self.config
            .controllers()
            .iter()
            .filter_map(|c| self.status(&c.id).ok())
            .collect()
    }

    pub fn is_active(&self, controller_id: &str) -> bool {
        self.slots
            .get(controller_id)
            .is_some_and(|slot| slot.has_live_loop())
    }

    /// Deactivate every running controller
    pub async fn shutdown(&self) {
        let running: Vec<String> = self
            .slots
            .iter()
            .filter(|slot| slot.has_live_loop())
            .map(|slot| slot.id.clone())
            .collect();
        info!(count = running.len(), "Stopping controllers");

        let stops = running.iter().map(|id| async move {
            if let Err(e) = self.deactivate(id).await {
                warn!(controller_id = %id, error = %e, "Failed to stop controller");
            }
        });
        futures::future::join_all(stops).await;
    }
}
