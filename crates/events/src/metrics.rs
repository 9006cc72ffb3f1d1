//! Delivery counters kept by the bus.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

/// Counters for one event type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventTypeMetrics {
    pub published: u64,
    pub handler_invocations: u64,
    pub handler_failures: u64,
}

/// Counters and latency for one handler (keyed by handler name).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HandlerMetrics {
    pub invocations: u64,
    pub failures: u64,
    pub total_duration: Duration,
    pub avg_duration: Duration,
}

/// Snapshot of bus activity, returned by [`EventBus::metrics`](crate::EventBus::metrics).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventMetrics {
    pub total_published: u64,
    pub total_handler_invocations: u64,
    /// Handler invocations that returned an error or panicked.
    pub total_failed: u64,
    pub by_type: BTreeMap<String, EventTypeMetrics>,
    pub by_handler: BTreeMap<String, HandlerMetrics>,
}

impl EventMetrics {
    pub fn for_type(&self, event_type: &str) -> EventTypeMetrics {
        self.by_type.get(event_type).cloned().unwrap_or_default()
    }

    pub fn for_handler(&self, name: &str) -> HandlerMetrics {
        self.by_handler.get(name).cloned().unwrap_or_default()
    }

    pub(crate) fn record_published(&mut self, event_type: &str) {
        self.total_published += 1;
        self.by_type.entry(event_type.to_string()).or_default().published += 1;
    }

    pub(crate) fn record_invocation(
        &mut self,
        event_type: &str,
        handler: &str,
        elapsed: Duration,
        failed: bool,
    ) {
        self.total_handler_invocations += 1;

        let by_type = self.by_type.entry(event_type.to_string()).or_default();
        by_type.handler_invocations += 1;

        let by_handler = self.by_handler.entry(handler.to_string()).or_default();
        by_handler.invocations += 1;
        by_handler.total_duration += elapsed;
        // Running mean over every invocation so far.
        by_handler.avg_duration = by_handler.total_duration / by_handler.invocations as u32;

        if failed {
            self.total_failed += 1;
            by_type.handler_failures += 1;
            by_handler.failures += 1;
        }
    }
}
