//! Type-keyed publish/subscribe registry.
//!
//! ## Delivery
//!
//! - `publish` runs every matching handler in registration order on the
//!   caller's task, continuing past handler errors and panics.
//! - `publish_async` runs the same loop on a spawned task and returns at once.
//! - Handler failures are recorded in [`EventMetrics`], never returned.
//!
//! ## Patterns
//!
//! Handlers subscribe to an exact type (`"expense.created"`), a category
//! (`"expense.*"`), or everything (`"*"`).
//!
//! ## Locking
//!
//! The handler registry and the metrics each sit behind their own mutex. No
//! code path holds both, and no lock is held while a handler runs.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use budget_core::{Context, panic_message};

use crate::error::BusError;
use crate::event::{DomainEvent, Event};
use crate::handler::EventHandler;
use crate::metrics::EventMetrics;

/// Identifies one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

static HANDLER_ID: AtomicU64 = AtomicU64::new(1);

fn next_handler_id() -> HandlerId {
    HandlerId(HANDLER_ID.fetch_add(1, Ordering::Relaxed))
}

/// Which event types a subscription receives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventPattern {
    /// `"*"`
    Any,
    /// `"expense.*"`, stored as the prefix `"expense."`.
    Category(String),
    Exact(String),
}

impl EventPattern {
    pub fn parse(pattern: &str) -> Self {
        if pattern == "*" {
            Self::Any
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            if prefix.ends_with('.') {
                Self::Category(prefix.to_string())
            } else {
                Self::Exact(pattern.to_string())
            }
        } else {
            Self::Exact(pattern.to_string())
        }
    }

    pub fn matches(&self, event_type: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Category(prefix) => event_type.starts_with(prefix.as_str()),
            Self::Exact(t) => t == event_type,
        }
    }
}

#[derive(Clone)]
struct Registration {
    id: HandlerId,
    pattern: EventPattern,
    handler: Arc<dyn EventHandler>,
}

#[derive(Default)]
struct BusInner {
    registrations: Mutex<Vec<Registration>>,
    metrics: Mutex<EventMetrics>,
}

// Handlers never run under either lock, so a poisoned guard still holds
// consistent data.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn same_handler(a: &Arc<dyn EventHandler>, b: &Arc<dyn EventHandler>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// In-process event bus.
///
/// Cloning yields another handle to the same registry and metrics, so the
/// bus can be passed to every collaborator that publishes or subscribes.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl core::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &lock(&self.inner.registrations).len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `handler` to the list for `pattern`.
    ///
    /// The same handler may be subscribed several times; each subscription is
    /// invoked separately.
    pub fn subscribe(&self, pattern: &str, handler: Arc<dyn EventHandler>) -> HandlerId {
        let id = next_handler_id();
        debug!(pattern, handler = handler.name(), "event handler subscribed");
        lock(&self.inner.registrations).push(Registration {
            id,
            pattern: EventPattern::parse(pattern),
            handler,
        });
        id
    }

    /// Remove every subscription of `handler` under `pattern`.
    ///
    /// Handlers are compared by identity. Returns whether anything was
    /// removed; removing an unknown handler is a no-op.
    pub fn unsubscribe(&self, pattern: &str, handler: &Arc<dyn EventHandler>) -> bool {
        let pattern = EventPattern::parse(pattern);
        let mut regs = lock(&self.inner.registrations);
        let before = regs.len();
        regs.retain(|r| !(r.pattern == pattern && same_handler(&r.handler, handler)));
        regs.len() != before
    }

    pub fn unsubscribe_id(&self, id: HandlerId) -> bool {
        let mut regs = lock(&self.inner.registrations);
        let before = regs.len();
        regs.retain(|r| r.id != id);
        regs.len() != before
    }

    /// Number of subscriptions that would receive an event of `event_type`.
    pub fn handler_count(&self, event_type: &str) -> usize {
        lock(&self.inner.registrations)
            .iter()
            .filter(|r| r.pattern.matches(event_type))
            .count()
    }

    /// Deliver `event` to every matching handler, in registration order.
    ///
    /// Returns an error only if `ctx` finishes before delivery completes; the
    /// handlers not yet reached are skipped.
    pub async fn publish(&self, ctx: &Context, event: &Event) -> Result<(), BusError> {
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }

        let event_type = event.event_type();
        let handlers: Vec<Arc<dyn EventHandler>> = lock(&self.inner.registrations)
            .iter()
            .filter(|r| r.pattern.matches(event_type))
            .map(|r| r.handler.clone())
            .collect();

        lock(&self.inner.metrics).record_published(event_type);
        debug!(event_type, event_id = %event.id(), handlers = handlers.len(), "publishing event");

        for handler in handlers {
            let started = Instant::now();
            let outcome = ctx
                .run(AssertUnwindSafe(handler.handle(event)).catch_unwind())
                .await;

            let failure = match &outcome {
                Ok(Ok(Ok(()))) => None,
                Ok(Ok(Err(err))) => Some(err.to_string()),
                Ok(Err(panic)) => Some(format!("handler panicked: {}", panic_message(panic.as_ref()))),
                Err(ctx_err) => Some(ctx_err.to_string()),
            };

            lock(&self.inner.metrics).record_invocation(
                event_type,
                handler.name(),
                started.elapsed(),
                failure.is_some(),
            );

            if let Some(error) = failure {
                warn!(
                    event_type,
                    event_id = %event.id(),
                    handler = handler.name(),
                    error = %error,
                    "event handler failed"
                );
            }

            if let Err(ctx_err) = outcome {
                return Err(ctx_err.into());
            }
        }

        Ok(())
    }

    /// Deliver `event` on a spawned task; the publisher never waits on handlers.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn publish_async(&self, ctx: Context, event: Event) -> JoinHandle<Result<(), BusError>> {
        let bus = self.clone();
        tokio::spawn(async move { bus.publish(&ctx, &event).await })
    }

    /// Encode a typed payload and publish it.
    pub async fn emit<E: DomainEvent>(
        &self,
        ctx: &Context,
        source: &str,
        payload: &E,
    ) -> Result<(), BusError> {
        let event = Event::from_domain(source, payload)?;
        self.publish(ctx, &event).await
    }

    /// Encode a typed payload and publish it on a spawned task.
    pub fn emit_async<E: DomainEvent>(
        &self,
        ctx: Context,
        source: &str,
        payload: &E,
    ) -> Result<JoinHandle<Result<(), BusError>>, BusError> {
        let event = Event::from_domain(source, payload)?;
        Ok(self.publish_async(ctx, event))
    }

    /// Snapshot of the delivery counters.
    pub fn metrics(&self) -> EventMetrics {
        lock(&self.inner.metrics).clone()
    }
}
