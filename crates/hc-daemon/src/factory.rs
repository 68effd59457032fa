//! Controller construction for the daemon

use dashmap::DashMap;
use hc_config::{ControllerConfig, ControllerOptions};
use hc_controllers::{build_controller, Controller, ControllerResult, InputController, Sensor};
use hc_runtime::ControllerFactory;
use std::sync::Arc;
use tracing::debug;

/// Makes a fresh sensor for each activation of an input
pub type SensorMaker = Arc<dyn Fn() -> Box<dyn Sensor> + Send + Sync>;

/// Built-in controllers, with sensors overridable per input id
///
/// Hardware sensors that the configuration cannot describe are injected
/// here by the embedding program.
#[derive(Default)]
pub struct DaemonControllerFactory {
    sensors: DashMap<String, SensorMaker>,
}

impl DaemonControllerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `maker` instead of the configured sensor for input `controller_id`
    pub fn register_sensor(&self, controller_id: impl Into<String>, maker: SensorMaker) {
        self.sensors.insert(controller_id.into(), maker);
    }
}

impl ControllerFactory for DaemonControllerFactory {
    fn build(&self, config: &ControllerConfig) -> ControllerResult<Box<dyn Controller>> {
        if let ControllerOptions::Input(_) = config.options {
            if let Some(maker) = self.sensors.get(&config.id) {
                debug!(controller_id = %config.id, "Using injected sensor");
                return Ok(Box::new(InputController::new((maker.value())())));
            }
        }
        build_controller(config)
    }
}
