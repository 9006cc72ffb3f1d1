use thiserror::Error;

use budget_core::ContextError;

/// Failure surfaced to a publisher.
///
/// Handler failures are never reported here; they are recorded in
/// [`EventMetrics`](crate::EventMetrics) instead.
#[derive(Debug, Error)]
pub enum BusError {
    /// The publisher's context finished before every handler ran.
    #[error("publish aborted: {0}")]
    Context(#[from] ContextError),

    /// A typed payload could not be serialized into an [`Event`](crate::Event).
    #[error("event payload could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failure turning an [`Event`](crate::Event) back into a typed payload.
#[derive(Debug, Error)]
pub enum EventDecodeError {
    #[error("unknown event type: {0}")]
    UnknownType(String),

    #[error("malformed payload for {event_type}: {source}")]
    Payload {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },
}
