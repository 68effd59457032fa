//! Event bus for habctl
//!
//! Controllers, the output arbiter and the measurement store publish what
//! they do here; trigger controllers and external observers subscribe,
//! either to one event type or to everything.
//!
//! Delivery is best effort. Each topic is a bounded broadcast channel: a
//! subscriber that falls behind loses the oldest events and is told how
//! many it missed, and publishers never wait.

use dashmap::DashMap;
use hc_core::{Context, Event, EventData};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{trace, warn};

/// Events buffered per subscriber before it starts lagging
const DEFAULT_CAPACITY: usize = 1024;

pub struct EventBus {
    topics: DashMap<String, broadcast::Sender<Event>>,
    firehose: broadcast::Sender<Event>,
    capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            topics: DashMap::new(),
            firehose: broadcast::channel(capacity).0,
            capacity,
        }
    }

    /// Events of one type, with JSON payloads
    pub fn subscribe(&self, event_type: &str) -> broadcast::Receiver<Event> {
        if let Some(topic) = self.topics.get(event_type) {
            return topic.subscribe();
        }
        self.topics
            .entry(event_type.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Events of `T`'s type, decoded
    pub fn subscribe_typed<T: EventData + DeserializeOwned>(&self) -> TypedEventReceiver<T> {
        TypedEventReceiver {
            rx: self.subscribe(T::event_type()),
            _payload: PhantomData,
        }
    }

    /// Every event regardless of type
    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.firehose.subscribe()
    }

    /// Publish; returns how many subscribers the event reached
    pub fn fire(&self, event: Event) -> usize {
        let mut reached = 0;
        if let Some(topic) = self.topics.get(&event.event_type) {
            reached += topic.send(event.clone()).unwrap_or(0);
        }
        let event_type = event.event_type.clone();
        reached += self.firehose.send(event).unwrap_or(0);
        trace!(event_type = %event_type, reached, "Event fired");
        reached
    }

    /// Publish a typed payload
    pub fn fire_typed<T: EventData + Serialize>(&self, data: T, context: Context) -> usize {
        match Event::typed(data, context).into_json() {
            Ok(event) => self.fire(event),
            Err(e) => {
                warn!(event_type = T::event_type(), error = %e, "Event payload not serializable");
                0
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscription to one [`EventData`] type
///
/// Events whose payload does not decode as `T` are skipped.
pub struct TypedEventReceiver<T> {
    rx: broadcast::Receiver<Event>,
    _payload: PhantomData<T>,
}

impl<T: EventData + DeserializeOwned> TypedEventReceiver<T> {
    pub async fn recv(&mut self) -> Result<Event<T>, RecvError> {
        loop {
            if let Some(event) = self.rx.recv().await?.decode() {
                return Ok(event);
            }
        }
    }

    /// Next queued event without waiting, `Ok(None)` when there is none
    ///
    /// A lagging receiver gets the error once and stays usable.
    pub fn try_recv(&mut self) -> Result<Option<Event<T>>, TryRecvError> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    if let Some(event) = event.decode() {
                        return Ok(Some(event));
                    }
                }
                Err(TryRecvError::Empty) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }
}
