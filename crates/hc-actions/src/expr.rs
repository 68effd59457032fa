//! Expression evaluation for equations and conditionals

use minijinja::{Environment, Value};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("expression error: {0}")]
pub struct ExpressionError(pub String);

impl From<minijinja::Error> for ExpressionError {
    fn from(err: minijinja::Error) -> Self {
        ExpressionError(err.to_string())
    }
}

/// Jinja-syntax expressions with a few math helpers
///
/// ```text
/// x * 1.8 + 32
/// sqrt(x) / 2
/// rh is not none and rh > 70 and temp < 30
/// ```
pub struct ExpressionEngine {
    env: Environment<'static>,
}

impl ExpressionEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_function("sqrt", |x: f64| x.sqrt());
        env.add_function("ln", |x: f64| x.ln());
        env.add_function("log10", |x: f64| x.log10());
        env.add_function("exp", |x: f64| x.exp());
        env.add_function("pow", |x: f64, y: f64| x.powf(y));
        env.add_function("fabs", |x: f64| x.abs());
        env.add_function("fmin", |x: f64, y: f64| x.min(y));
        env.add_function("fmax", |x: f64, y: f64| x.max(y));
        Self { env }
    }

    /// Check that an expression parses
    pub fn check(&self, expression: &str) -> Result<(), ExpressionError> {
        self.env.compile_expression(expression)?;
        Ok(())
    }

    pub fn eval(&self, expression: &str, vars: impl Serialize) -> Result<Value, ExpressionError> {
        let compiled = self.env.compile_expression(expression)?;
        Ok(compiled.eval(vars)?)
    }

    /// Evaluate to a finite number
    pub fn eval_number(
        &self,
        expression: &str,
        vars: impl Serialize,
    ) -> Result<f64, ExpressionError> {
        let value = self.eval(expression, vars)?;
        let number = f64::try_from(value.clone())
            .map_err(|_| ExpressionError(format!("'{}' did not produce a number", value)))?;
        if number.is_finite() {
            Ok(number)
        } else {
            Err(ExpressionError(format!("'{}' produced {}", expression, number)))
        }
    }

    /// Evaluate with Jinja truthiness
    pub fn eval_bool(&self, expression: &str, vars: impl Serialize) -> Result<bool, ExpressionError> {
        Ok(self.eval(expression, vars)?.is_true())
    }

    /// Evaluate `expression` with `x` bound to `value`
    pub fn apply(&self, expression: &str, value: f64) -> Result<f64, ExpressionError> {
        self.eval_number(expression, minijinja::context! { x => value })
    }
}

impl Default for ExpressionEngine {
    fn default() -> Self {
        Self::new()
    }
}
