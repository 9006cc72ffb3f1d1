//! Domain events and the in-process publish/subscribe bus.
//!
//! Components emit an [`Event`] whenever a domain-significant state change
//! happens (a record was created, a background task finished). The
//! [`EventBus`] fans each event out to every handler registered for its
//! type, records delivery metrics, and isolates handler failures from each
//! other and from the publisher.

pub mod budget;
pub mod bus;
pub mod error;
pub mod event;
pub mod handler;
pub mod metrics;

pub use budget::{BudgetEvent, Change};
pub use bus::{EventBus, EventPattern, HandlerId};
pub use error::{BusError, EventDecodeError};
pub use event::{DomainEvent, Event};
pub use handler::{EventHandler, handler_fn};
pub use metrics::{EventMetrics, EventTypeMetrics, HandlerMetrics};
