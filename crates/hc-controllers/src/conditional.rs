//! Conditional controller: runs its chain while an expression holds

use crate::controller::{Controller, ControllerEnv, StepOutcome, Tick};
use crate::ControllerResult;
use async_trait::async_trait;
use hc_config::{secs, ConditionalOptions};
use std::collections::BTreeMap;

/// Evaluates `expression` over its conditions each step
///
/// A condition whose measurement is missing or stale is bound as `none`,
/// so expressions can test `x is none`.
pub struct ConditionalController {
    options: ConditionalOptions,
    last_result: Option<bool>,
}

impl ConditionalController {
    pub fn new(options: ConditionalOptions) -> Self {
        Self {
            options,
            last_result: None,
        }
    }

    async fn bind(&self, env: &ControllerEnv) -> ControllerResult<BTreeMap<String, Option<f64>>> {
        let mut vars = BTreeMap::new();
        for condition in &self.options.conditions {
            let point = env
                .read_fresh(&condition.measurement, secs(condition.max_age))
                .await?;
            vars.insert(condition.id.clone(), point.map(|m| m.value));
        }
        Ok(vars)
    }
}

#[async_trait]
impl Controller for ConditionalController {
    async fn initialize(&mut self, env: &ControllerEnv) -> ControllerResult<()> {
        env.actions.expressions().check(&self.options.expression)?;
        Ok(())
    }

    async fn step(&mut self, env: &ControllerEnv, tick: &Tick) -> ControllerResult<StepOutcome> {
        if tick.paused {
            return Ok(StepOutcome::Continue);
        }

        let vars = self.bind(env).await?;
        let result = env
            .actions
            .expressions()
            .eval_bool(&self.options.expression, &vars)?;
        self.last_result = Some(result);
        env.log_step(format_args!(
            "{} with {:?} is {}",
            self.options.expression, vars, result
        ));

        if result && !tick.held {
            let mut ctx = env
                .action_context(&tick.context)
                .with_message(format!("Conditional {} is true", env.controller_id));
            for (id, value) in &vars {
                ctx = ctx.with_value(id.clone(), *value);
            }
            env.run_actions(ctx).await;
        }
        Ok(StepOutcome::Continue)
    }

    fn detail(&self) -> serde_json::Value {
        serde_json::json!({
            "expression": self.options.expression,
            "last_result": self.last_result,
        })
    }
}
