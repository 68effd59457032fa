//! Measurement store gateway for habctl
//!
//! This crate defines the [`MeasurementStore`] interface controllers use to
//! write and read time-series points, and [`MemoryMeasurementStore`], a
//! bounded in-memory implementation. Reads take a caller-supplied max-age:
//! a point older than that is reported absent, never substituted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hc_core::events::MeasurementWrittenData;
use hc_core::{Context, Measurement, MeasurementKey};
use hc_event_bus::EventBus;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{instrument, trace};

/// Default number of points retained per series
pub const DEFAULT_SERIES_CAPACITY: usize = 4096;

/// Measurement store errors
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("refusing to store non-finite value {value} for {key}")]
    NonFiniteValue { key: MeasurementKey, value: f64 },

    #[error("measurement backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Read/write access to time-series measurements
#[async_trait]
pub trait MeasurementStore: Send + Sync {
    /// Store one point
    async fn write(&self, measurement: Measurement) -> StoreResult<()>;

    /// Latest point of a series no older than `max_age`
    ///
    /// When `kind` is given only points of that kind are considered.
    async fn read_last(
        &self,
        device_id: &str,
        channel: u32,
        kind: Option<&str>,
        max_age: Duration,
    ) -> StoreResult<Option<Measurement>>;

    /// All points of a series no older than `max_age`, oldest first
    async fn read_past(
        &self,
        device_id: &str,
        channel: u32,
        max_age: Duration,
    ) -> StoreResult<Vec<Measurement>>;
}

/// In-memory measurement store
///
/// Each series keeps at most `capacity` points ordered by timestamp. Writes
/// are published on the event bus when one is attached.
pub struct MemoryMeasurementStore {
    series: DashMap<MeasurementKey, VecDeque<Measurement>>,
    capacity: usize,
    event_bus: Option<Arc<EventBus>>,
}

impl MemoryMeasurementStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SERIES_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            series: DashMap::new(),
            capacity: capacity.max(1),
            event_bus: None,
        }
    }

    /// Publish MEASUREMENT_WRITTEN events on `event_bus`
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Latest point of a series no older than `max_age` at `now`
    pub fn last_at(
        &self,
        key: &MeasurementKey,
        kind: Option<&str>,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Option<Measurement> {
        let series = self.series.get(key)?;
        series
            .iter()
            .rev()
            .find(|m| kind.map_or(true, |k| m.kind == k))
            .filter(|m| m.is_fresh(now, max_age))
            .cloned()
    }

    /// Points of a series no older than `max_age` at `now`, oldest first
    pub fn past_at(
        &self,
        key: &MeasurementKey,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Vec<Measurement> {
        self.series
            .get(key)
            .map(|series| {
                series
                    .iter()
                    .filter(|m| m.is_fresh(now, max_age))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of series with at least one point
    pub fn series_count(&self) -> usize {
        self.series.len()
    }

    /// Number of points retained for a series
    pub fn point_count(&self, key: &MeasurementKey) -> usize {
        self.series.get(key).map(|s| s.len()).unwrap_or(0)
    }

    fn insert(&self, measurement: Measurement) {
        let mut series = self.series.entry(measurement.key()).or_default();

        // Late points are slotted in by timestamp so "last" stays the newest
        let position = series
            .iter()
            .rposition(|m| m.timestamp <= measurement.timestamp)
            .map(|i| i + 1)
            .unwrap_or(0);
        series.insert(position, measurement);

        while series.len() > self.capacity {
            series.pop_front();
        }
    }
}

impl Default for MemoryMeasurementStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MeasurementStore for MemoryMeasurementStore {
    #[instrument(skip(self, measurement), fields(key = %measurement.key()))]
    async fn write(&self, measurement: Measurement) -> StoreResult<()> {
        if !measurement.value.is_finite() {
            return Err(StoreError::NonFiniteValue {
                key: measurement.key(),
                value: measurement.value,
            });
        }

        trace!(value = measurement.value, unit = %measurement.unit, "Storing measurement");
        self.insert(measurement.clone());

        if let Some(bus) = &self.event_bus {
            bus.fire_typed(
                MeasurementWrittenData { measurement },
                Context::with_origin("measurement_store"),
            );
        }
        Ok(())
    }

    async fn read_last(
        &self,
        device_id: &str,
        channel: u32,
        kind: Option<&str>,
        max_age: Duration,
    ) -> StoreResult<Option<Measurement>> {
        let key = MeasurementKey::new(device_id, channel);
        Ok(self.last_at(&key, kind, max_age, Utc::now()))
    }

    async fn read_past(
        &self,
        device_id: &str,
        channel: u32,
        max_age: Duration,
    ) -> StoreResult<Vec<Measurement>> {
        let key = MeasurementKey::new(device_id, channel);
        Ok(self.past_at(&key, max_age, Utc::now()))
    }
}

/// Thread-safe handle to any measurement store
pub type SharedMeasurementStore = Arc<dyn MeasurementStore>;
