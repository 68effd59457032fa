//! Read-only configuration snapshots for the runtime and the action pipeline

use crate::actions::ActionConfig;
use crate::controllers::ControllerConfig;
use crate::daemon::{DaemonConfig, OutputConfig};
use crate::error::{ConfigError, ConfigResult};
use std::sync::{Arc, RwLock};
use tracing::info;

/// Source of controller and action option sets
///
/// Every call returns an owned snapshot; later updates never change a
/// snapshot already handed out.
pub trait ConfigProvider: Send + Sync {
    fn controller(&self, controller_id: &str) -> Option<ControllerConfig>;

    fn controllers(&self) -> Vec<ControllerConfig>;

    fn action(&self, action_id: &str) -> Option<ActionConfig>;

    /// Actions owned by a controller, in stored order
    fn actions_for(&self, owner_id: &str) -> Vec<ActionConfig>;

    fn output(&self, output_id: &str) -> Option<OutputConfig>;
}

/// A swappable, validated [`DaemonConfig`]
pub struct SharedConfig {
    current: RwLock<Arc<DaemonConfig>>,
}

impl SharedConfig {
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    /// The whole configuration as of now
    pub fn snapshot(&self) -> Arc<DaemonConfig> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace one controller's configuration, validating the result
    ///
    /// Callers are responsible for only doing this while the controller is
    /// inactive.
    pub fn replace_controller(&self, controller: ControllerConfig) -> ConfigResult<()> {
        let controller_id = controller.id.clone();
        self.update_controller(&controller_id, move |slot| {
            *slot = controller;
            Ok::<(), ConfigError>(())
        })
    }

    /// Edit one controller's configuration in place, validating the result
    ///
    /// `edit` runs under the write lock, so concurrent edits of the same
    /// controller all land. Nothing changes if `edit` or validation fails,
    /// or if `edit` renames the controller.
    pub fn update_controller<E>(
        &self,
        controller_id: &str,
        edit: impl FnOnce(&mut ControllerConfig) -> Result<(), E>,
    ) -> Result<(), E>
    where
        E: From<ConfigError>,
    {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut next = DaemonConfig::clone(&guard);
        let slot = next
            .controllers
            .iter_mut()
            .find(|c| c.id == controller_id)
            .ok_or_else(|| ConfigError::UnknownController(controller_id.to_string()))?;
        edit(slot)?;
        if slot.id != controller_id {
            return Err(ConfigError::UnknownController(slot.id.clone()).into());
        }
        next.validate()?;

        *guard = Arc::new(next);
        info!(controller_id, "Controller configuration updated");
        Ok(())
    }
}

impl ConfigProvider for SharedConfig {
    fn controller(&self, controller_id: &str) -> Option<ControllerConfig> {
        self.snapshot().controller(controller_id).cloned()
    }

    fn controllers(&self) -> Vec<ControllerConfig> {
        self.snapshot().controllers.clone()
    }

    fn action(&self, action_id: &str) -> Option<ActionConfig> {
        self.snapshot().action(action_id).cloned()
    }

    fn actions_for(&self, owner_id: &str) -> Vec<ActionConfig> {
        self.snapshot().actions_for(owner_id).cloned().collect()
    }

    fn output(&self, output_id: &str) -> Option<OutputConfig> {
        self.snapshot().output(output_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> SharedConfig {
        SharedConfig::new(
            DaemonConfig::from_yaml_str(
                r#"
controllers:
  - id: timer
    options: { type: timer_duration, duration: 60 }
actions:
  - id: second
    owner: timer
    action: { type: log_message, message: two }
  - id: first
    owner: timer
    action: { type: log_message, message: one }
"#,
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_actions_keep_stored_order() {
        let ids: Vec<String> = shared()
            .actions_for("timer")
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ids, vec!["second", "first"]);
        assert!(shared().actions_for("nobody").is_empty());
    }

    #[test]
    fn test_snapshot_survives_update() {
        let shared = shared();
        let before = shared.controller("timer").unwrap();

        let mut updated = before.clone();
        updated.period = 5.0;
        shared.replace_controller(updated).unwrap();

        assert_eq!(before.period, 30.0);
        assert_eq!(shared.controller("timer").unwrap().period, 5.0);
    }

    #[test]
    fn test_invalid_update_is_rejected() {
        let shared = shared();
        let mut updated = shared.controller("timer").unwrap();
        updated.period = -1.0;

        assert!(matches!(
            shared.replace_controller(updated),
            Err(ConfigError::Validation { .. })
        ));
        assert_eq!(shared.controller("timer").unwrap().period, 30.0);
    }

    #[test]
    fn test_update_in_place() {
        let shared = shared();
        shared
            .update_controller("timer", |c| {
                c.period = 5.0;
                Ok::<(), ConfigError>(())
            })
            .unwrap();
        shared
            .update_controller("timer", |c| {
                c.start_offset = 2.0;
                Ok::<(), ConfigError>(())
            })
            .unwrap();

        let timer = shared.controller("timer").unwrap();
        assert_eq!((timer.period, timer.start_offset), (5.0, 2.0));
    }

    #[test]
    fn test_update_edit_error_keeps_config() {
        let shared = shared();
        let result = shared.update_controller("timer", |c| {
            c.period = 5.0;
            Err(ConfigError::UnknownController("refused".into()))
        });

        assert!(result.is_err());
        assert_eq!(shared.controller("timer").unwrap().period, 30.0);
    }

    #[test]
    fn test_concurrent_updates_all_land() {
        let shared = Arc::new(shared());
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let shared = shared.clone();
                std::thread::spawn(move || {
                    shared
                        .update_controller("timer", |c| {
                            c.period += 1.0;
                            if i % 2 == 0 {
                                c.start_offset += 1.0;
                            }
                            Ok::<(), ConfigError>(())
                        })
                        .unwrap();
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let timer = shared.controller("timer").unwrap();
        assert_eq!(timer.period, 38.0);
        assert_eq!(timer.start_offset, 4.0);
    }

    #[test]
    fn test_unknown_controller_update() {
        let shared = shared();
        let mut ghost = shared.controller("timer").unwrap();
        ghost.id = "ghost".into();
        assert!(matches!(
            shared.replace_controller(ghost),
            Err(ConfigError::UnknownController(_))
        ));
    }
}
