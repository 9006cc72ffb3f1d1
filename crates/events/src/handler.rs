use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::event::Event;

/// Receives events from the [`EventBus`](crate::EventBus).
///
/// Handlers must tolerate running concurrently with other handlers and with
/// themselves (`publish_async` delivers on separate tasks). A returned error
/// is recorded in the bus metrics and never reaches the publisher.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Label used in logs and per-handler metrics.
    fn name(&self) -> &str;

    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

struct FnHandler<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self.f)(event.clone()).await
    }
}

/// Build a handler from an async closure.
///
/// Keep the returned `Arc` to unsubscribe later; removal compares identity.
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        f,
    })
}
