//! Daemon events: what happened, when, and on whose behalf

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::Context;

/// Payload with a fixed event type name
pub trait EventData: Clone + Send + Sync + 'static {
    fn event_type() -> &'static str;
}

/// A notification published on the event bus
///
/// `data` is JSON on the wire; typed subscribers decode it into an
/// [`EventData`] payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event<T = serde_json::Value> {
    pub event_type: String,
    pub data: T,
    pub fired_at: DateTime<Utc>,
    pub context: Context,
}

impl<T> Event<T> {
    pub fn new(event_type: impl Into<String>, data: T, context: Context) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            fired_at: Utc::now(),
            context,
        }
    }

    /// Who caused the event
    pub fn origin(&self) -> &str {
        self.context.origin()
    }

    fn with_data<U>(self, data: U) -> Event<U> {
        Event {
            event_type: self.event_type,
            data,
            fired_at: self.fired_at,
            context: self.context,
        }
    }
}

impl<T: EventData> Event<T> {
    pub fn typed(data: T, context: Context) -> Self {
        Self::new(T::event_type(), data, context)
    }
}

impl<T: Serialize> Event<T> {
    /// The same event with its payload as JSON
    pub fn into_json(self) -> serde_json::Result<Event> {
        let data = serde_json::to_value(&self.data)?;
        Ok(self.with_data(data))
    }
}

impl Event {
    /// Decode the payload, `None` if it does not match `T`
    pub fn decode<T: DeserializeOwned>(self) -> Option<Event<T>> {
        let data = serde_json::from_value(self.data.clone()).ok()?;
        Some(self.with_data(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::OutputChangedData;
    use crate::{OutputCommand, OutputStatus};

    #[test]
    fn test_json_payload_decodes_back() {
        let status = OutputStatus::from_command(&OutputCommand::pwm("fan", 1, 40.0));
        let event = Event::typed(
            OutputChangedData {
                output_id: "fan".into(),
                channel: 1,
                status,
            },
            Context::with_origin("pid_tent"),
        );

        let json = event.into_json().unwrap();
        assert_eq!(json.event_type, "output_changed");
        assert_eq!(json.data["channel"], 1);
        assert_eq!(json.origin(), "pid_tent");

        let typed = json.decode::<OutputChangedData>().unwrap();
        assert_eq!(typed.data.status.amount, 40.0);
    }

    #[test]
    fn test_mismatched_payload_does_not_decode() {
        let event = Event::new("output_changed", serde_json::json!({"x": 1}), Context::new());
        assert!(event.decode::<OutputChangedData>().is_none());
    }
}
