//! Per-controller bookkeeping shared by the runtime and the loop task

use crate::task::LoopCommand;
use crate::{RuntimeError, RuntimeResult};
use hc_core::events::ControllerStateChangedData;
use hc_core::{ActivationState, Context, ControllerKind, ControllerStatus};
use hc_event_bus::EventBus;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

/// Handles to a spawned controller loop
pub(crate) struct RunningLoop {
    pub stop: watch::Sender<bool>,
    pub commands: mpsc::Sender<LoopCommand>,
    pub task: JoinHandle<()>,
}

pub(crate) struct ControllerSlot {
    pub id: String,
    status: Mutex<ControllerStatus>,
    running: Mutex<Option<RunningLoop>>,
    /// Serializes activation and deactivation of this controller
    pub lifecycle: tokio::sync::Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ControllerSlot {
    pub fn new(id: &str, kind: ControllerKind) -> Self {
        Self {
            id: id.to_string(),
            status: Mutex::new(ControllerStatus::new(id, kind)),
            running: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn status(&self) -> ControllerStatus {
        lock(&self.status).clone()
    }

    pub fn state(&self) -> ActivationState {
        lock(&self.status).state
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut ControllerStatus) -> R) -> R {
        f(&mut lock(&self.status))
    }

    /// Move to `to` if the state machine allows it and announce the change
    pub fn transition(&self, to: ActivationState, event_bus: &EventBus) -> RuntimeResult<()> {
        let from = {
            let mut status = lock(&self.status);
            let from = status.state;
            status.state = from.try_transition(to)?;
            from
        };
        info!(controller_id = %self.id, from = ?from, to = ?to, "Controller state changed");
        event_bus.fire_typed(
            ControllerStateChangedData {
                controller_id: self.id.clone(),
                old_state: from,
                new_state: to,
            },
            Context::with_origin(self.id.clone()),
        );
        Ok(())
    }

    /// Like [`transition`](Self::transition), but a no-op when already in `to`
    pub fn ensure(&self, to: ActivationState, event_bus: &EventBus) -> RuntimeResult<()> {
        if self.state() == to {
            return Ok(());
        }
        self.transition(to, event_bus)
    }

    pub fn set_running(&self, running: RunningLoop) {
        *lock(&self.running) = Some(running);
    }

    pub fn take_running(&self) -> Option<RunningLoop> {
        lock(&self.running).take()
    }

    /// Whether a loop task exists and has not finished
    pub fn has_live_loop(&self) -> bool {
        lock(&self.running)
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    pub fn command_sender(&self) -> RuntimeResult<mpsc::Sender<LoopCommand>> {
        lock(&self.running)
            .as_ref()
            .filter(|running| !running.task.is_finished())
            .map(|running| running.commands.clone())
            .ok_or_else(|| RuntimeError::NotActive(self.id.clone()))
    }
}
