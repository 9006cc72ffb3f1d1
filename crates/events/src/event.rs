use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use budget_core::EventId;

use crate::error::EventDecodeError;

/// A typed domain payload that can be published on the bus.
///
/// Implementors are facts: immutable once constructed and safe to deliver to
/// many subscribers.
pub trait DomainEvent: Serialize + Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable, dot-namespaced type tag (e.g. `"expense.created"`).
    fn event_type(&self) -> &'static str;

    /// JSON body carried in [`Event::data`].
    fn to_data(&self) -> Result<JsonValue, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// An event as it travels through the bus.
///
/// Immutable after construction; one `Event` may be delivered to many
/// handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    id: EventId,
    event_type: String,
    data: JsonValue,
    created_at: DateTime<Utc>,
    source: String,
}

impl Event {
    pub fn new(event_type: impl Into<String>, data: JsonValue, source: impl Into<String>) -> Self {
        Self {
            id: EventId::new(),
            event_type: event_type.into(),
            data,
            created_at: Utc::now(),
            source: source.into(),
        }
    }

    /// Wrap a typed payload.
    pub fn from_domain<E: DomainEvent>(
        source: impl Into<String>,
        payload: &E,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(payload.event_type(), payload.to_data()?, source))
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn data(&self) -> &JsonValue {
        &self.data
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Deserialize the data payload into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, EventDecodeError> {
        serde_json::from_value(self.data.clone()).map_err(|source| EventDecodeError::Payload {
            event_type: self.event_type.clone(),
            source,
        })
    }
}
