//! Core types for habctl
//!
//! This crate provides the fundamental types shared by every part of the
//! daemon: measurements, output commands, controller activation states,
//! causality contexts, daemon events and the [`DaemonHandle`] seam through
//! which actions and controllers call back into the daemon.

mod activation;
mod context;
mod event;
mod handle;
mod measurement;
mod output;

pub use activation::{ActivationState, ControllerKind, ControllerStatus, InvalidTransition};
pub use context::Context;
pub use event::{Event, EventData};
pub use handle::{DaemonHandle, Direction, HandleError, HandleResult, PidSetting};
pub use measurement::{ChannelMeasurement, Measurement, MeasurementKey};
pub use output::{OutputCommand, OutputMode, OutputState, OutputStatus};

/// Standard event types fired by the daemon
pub mod events {
    use super::*;

    /// A controller changed activation state
    pub const CONTROLLER_STATE_CHANGED: &str = "controller_state_changed";

    /// An output channel was commanded
    pub const OUTPUT_CHANGED: &str = "output_changed";

    /// A measurement was written to the store
    pub const MEASUREMENT_WRITTEN: &str = "measurement_written";

    /// Data for CONTROLLER_STATE_CHANGED events
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct ControllerStateChangedData {
        pub controller_id: String,
        pub old_state: ActivationState,
        pub new_state: ActivationState,
    }

    impl EventData for ControllerStateChangedData {
        fn event_type() -> &'static str {
            CONTROLLER_STATE_CHANGED
        }
    }

    /// Data for OUTPUT_CHANGED events
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct OutputChangedData {
        pub output_id: String,
        pub channel: u32,
        pub status: OutputStatus,
    }

    impl EventData for OutputChangedData {
        fn event_type() -> &'static str {
            OUTPUT_CHANGED
        }
    }

    /// Data for MEASUREMENT_WRITTEN events
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct MeasurementWrittenData {
        pub measurement: Measurement,
    }

    impl EventData for MeasurementWrittenData {
        fn event_type() -> &'static str {
            MEASUREMENT_WRITTEN
        }
    }
}
