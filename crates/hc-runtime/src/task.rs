//! The per-controller loop task

use crate::schedule::TickSchedule;
use crate::slot::ControllerSlot;
use chrono::Utc;
use futures::FutureExt;
use hc_controllers::{Controller, ControllerEnv, ControllerError, ControllerResult, StepOutcome, Tick};
use hc_core::{ActivationState, Context, Measurement, PidSetting};
use hc_event_bus::EventBus;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

tokio::task_local! {
    /// Id of the controller whose loop is running the current task
    static CURRENT_CONTROLLER: String;
}

/// The controller whose loop the caller runs on, if any
pub(crate) fn current_controller() -> Option<String> {
    CURRENT_CONTROLLER.try_with(|id| id.clone()).ok()
}

/// Requests served by the loop between steps
pub(crate) enum LoopCommand {
    Apply {
        setting: PidSetting,
        reply: Option<oneshot::Sender<ControllerResult<()>>>,
    },
    Force {
        context: Context,
        reply: oneshot::Sender<ControllerResult<Vec<Measurement>>>,
    },
}

pub(crate) struct ControllerLoop {
    pub slot: Arc<ControllerSlot>,
    pub controller: Box<dyn Controller>,
    pub env: ControllerEnv,
    pub schedule: TickSchedule,
    pub event_bus: Arc<EventBus>,
    pub max_consecutive_failures: u32,
    pub stop: watch::Receiver<bool>,
    pub commands: mpsc::Receiver<LoopCommand>,
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run `future`, turning a panic into a [`ControllerError`]
async fn contained<T>(
    future: impl Future<Output = ControllerResult<T>>,
) -> ControllerResult<T> {
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(ControllerError::Panicked(panic_message(panic))),
    }
}

impl ControllerLoop {
    /// Spawn the loop on its own task
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        let id = self.slot.id.clone();
        tokio::spawn(CURRENT_CONTROLLER.scope(id, self.run()))
    }

    async fn run(mut self) {
        let id = self.slot.id.clone();
        debug!(controller_id = %id, period = ?self.schedule.period(), "Loop started");

        let reason = loop {
            if *self.stop.borrow() {
                break "deactivated".to_string();
            }

            tokio::select! {
                biased;
                changed = self.stop.changed() => {
                    if changed.is_err() || *self.stop.borrow() {
                        break "deactivated".to_string();
                    }
                    continue;
                }
                Some(command) = self.commands.recv() => {
                    self.handle(command).await;
                    continue;
                }
                _ = tokio::time::sleep_until(self.schedule.next_tick()) => {}
            }

            // A stop requested while sleeping wins over the tick
            if *self.stop.borrow() {
                break "deactivated".to_string();
            }
            if !self.schedule.poll(tokio::time::Instant::now()) {
                continue;
            }

            if let Some(reason) = self.step().await {
                break reason;
            }
        };

        self.finish(&reason).await;
    }

    /// One step; returns a reason when the loop must end
    async fn step(&mut self) -> Option<String> {
        let state = self.slot.state();
        let tick = Tick::new(Context::with_origin(self.slot.id.clone()))
            .paused(state == ActivationState::Paused)
            .held(state == ActivationState::Held);

        let result = contained(self.controller.step(&self.env, &tick)).await;
        let detail = self.controller.detail();

        match result {
            Ok(outcome) => {
                self.slot.update(|status| {
                    status.consecutive_failures = 0;
                    status.last_step = Some(Utc::now());
                    status.detail = detail;
                });
                match outcome {
                    StepOutcome::Continue => None,
                    StepOutcome::Deactivate { reason } => Some(reason),
                }
            }
            Err(e) => {
                let failures = self.slot.update(|status| {
                    status.consecutive_failures += 1;
                    status.last_error = Some(e.to_string());
                    status.last_step = Some(Utc::now());
                    status.detail = detail;
                    status.consecutive_failures
                });
                error!(
                    controller_id = %self.slot.id,
                    error = %e,
                    consecutive_failures = failures,
                    "Controller step failed"
                );
                (failures > self.max_consecutive_failures)
                    .then(|| format!("{} consecutive failures", failures))
            }
        }
    }

    async fn handle(&mut self, command: LoopCommand) {
        match command {
            LoopCommand::Apply { setting, reply } => {
                let result = self.controller.apply_setting(setting);
                if let Err(e) = &result {
                    warn!(controller_id = %self.slot.id, error = %e, "Setting rejected");
                }
                let detail = self.controller.detail();
                self.slot.update(|status| status.detail = detail);
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            LoopCommand::Force { context, reply } => {
                let result = contained(self.controller.force_measurements(&self.env, &context)).await;
                let _ = reply.send(result);
            }
        }
    }

    async fn finish(mut self, reason: &str) {
        let id = self.slot.id.clone();
        if self.slot.state().is_running() {
            if let Err(e) = self.slot.transition(ActivationState::Deactivating, &self.event_bus) {
                warn!(controller_id = %id, error = %e, "Unexpected state at loop end");
            }
        }

        // Pending command callers see their reply sender dropped
        self.commands.close();

        let context = Context::with_origin(id.clone());
        if let Err(e) = contained(self.controller.stop(&self.env, &context)).await {
            error!(controller_id = %id, error = %e, "Controller stop failed");
            self.slot.update(|status| status.last_error = Some(e.to_string()));
        }

        if let Err(e) = self.slot.ensure(ActivationState::Inactive, &self.event_bus) {
            warn!(controller_id = %id, error = %e, "Unexpected state after stop");
        }
        info!(controller_id = %id, reason, "Controller loop ended");
    }
}
