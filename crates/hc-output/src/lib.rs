//! Output arbiter
//!
//! Every hardware state change goes through the [`OutputArbiter`], keyed by
//! `(output_id, channel)`. Commands on one channel are serialized; commands
//! on different channels or outputs proceed independently.
//!
//! # Key Types
//!
//! - [`OutputArbiter`] - the single authoritative write path
//! - [`OutputDriver`] - device seam implemented per output type
//! - [`RampSpec`] / [`RampHandle`] - gradual duty-cycle changes

mod arbiter;
mod drivers;

pub use arbiter::{OutputArbiter, RampHandle, RampOutcome, RampSpec};
pub use drivers::{CommandDriver, CommandTemplates, MemoryDriver};

use async_trait::async_trait;
use hc_core::{OutputCommand, OutputState};
use thiserror::Error;

/// Output arbiter errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum OutputError {
    #[error("output not found: {0}")]
    UnknownOutput(String),

    #[error("output {output_id} has no channel {channel}")]
    UnknownChannel { output_id: String, channel: u32 },

    #[error("invalid output command: {0}")]
    InvalidCommand(String),

    #[error("driver error on {output_id}/{channel}: {message}")]
    Driver {
        output_id: String,
        channel: u32,
        message: String,
    },
}

pub type OutputResult<T> = Result<T, OutputError>;

/// Error reported by a device driver
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct DriverError(pub String);

/// Device seam for one physical or virtual output
///
/// Drivers never see concurrent calls for the same channel; the arbiter
/// serializes them.
#[async_trait]
pub trait OutputDriver: Send + Sync {
    /// Number of channels, addressed `0..channel_count()`
    fn channel_count(&self) -> u32;

    /// Apply a command to a channel
    async fn set(&self, channel: u32, command: &OutputCommand) -> Result<(), DriverError>;

    /// Current state as reported by the device
    async fn get_state(&self, channel: u32) -> OutputState;
}
