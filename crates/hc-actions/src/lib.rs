//! Action chains for habctl
//!
//! An action chain is the ordered list of actions owned by a controller.
//! Chains run with a fresh [`ActionContext`]; each action reads and mutates
//! it, and may call back into the output arbiter, the measurement store or
//! the daemon. A failing action never aborts its chain: the error is logged
//! and appended to the context message.

mod context;
mod expr;
mod notify;
mod pipeline;
mod pool;
pub mod units;

pub use context::ActionContext;
pub use expr::{ExpressionEngine, ExpressionError};
pub use notify::{
    LogSink, Notification, NotificationKind, NotificationSink, NotificationSinks, SinkError,
    WebhookSink,
};
pub use pipeline::ActionPipeline;
pub use pool::{PoolRejection, SideEffectPool};

use hc_core::{HandleError, MeasurementKey};
use hc_measurement_store::StoreError;
use hc_output::OutputError;
use std::time::Duration;
use thiserror::Error;

/// Errors contained per action
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("action not found: {0}")]
    UnknownAction(String),

    #[error(transparent)]
    Output(#[from] OutputError),

    #[error("daemon command failed: {0}")]
    Daemon(#[from] HandleError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no measurement of {key} within {max_age:?}")]
    StaleData {
        key: MeasurementKey,
        max_age: Duration,
    },

    #[error("action only runs in an input pipeline")]
    NoMeasurements,

    #[error("input pipeline has no channel {0}")]
    UnknownChannel(u32),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error("cannot convert {from} to {to}")]
    UnsupportedConversion { from: String, to: String },

    #[error("invalid override '{key}': {reason}")]
    InvalidOverride { key: String, reason: String },

    #[error("no {0} sink configured")]
    NoSink(NotificationKind),

    #[error("{kind} notification failed: {source}")]
    Notification {
        kind: NotificationKind,
        #[source]
        source: SinkError,
    },

    #[error(transparent)]
    Pool(#[from] PoolRejection),

    #[error("ramp failed: {0}")]
    Ramp(String),

    #[error("action panicked")]
    Panicked,
}

pub type ActionResult<T> = Result<T, ActionError>;
