//! Explicitly owned assembly of the concurrent core.
//!
//! Nothing here is a process-wide singleton: every `CoreServices` value owns
//! its own bus, tracker and streams, so independent instances coexist.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use budget_events::EventBus;

use crate::aggregate::{MonthlyDataSource, MonthlySummaryAggregator};
use crate::config::CoreConfig;
use crate::streams::BudgetStreams;
use crate::tasks::TaskTracker;
use crate::workers::{Processor, WorkerPool};

pub struct CoreServices {
    config: CoreConfig,
    bus: EventBus,
    tasks: TaskTracker,
    streams: BudgetStreams,
    shutdown: CancellationToken,
    sweeper: Option<JoinHandle<()>>,
}

impl CoreServices {
    /// Build the bus, a tracker publishing to it, and streams fed by it.
    ///
    /// When the config enables a task sweep, this must run inside a Tokio
    /// runtime.
    pub fn new(config: CoreConfig) -> Self {
        let bus = EventBus::new();
        let tasks = TaskTracker::with_event_bus(config.tasks.clone(), bus.clone());
        let streams = BudgetStreams::default();
        streams.attach(&bus);

        let shutdown = CancellationToken::new();
        let sweeper = config
            .tasks
            .sweep_interval
            .map(|period| tasks.spawn_sweeper(period, config.tasks.retention, shutdown.child_token()));

        info!(
            workers = config.pool.effective_workers(),
            task_sweep = sweeper.is_some(),
            "core services ready"
        );

        Self {
            config,
            bus,
            tasks,
            streams,
            shutdown,
            sweeper,
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    pub fn streams(&self) -> &BudgetStreams {
        &self.streams
    }

    /// A new, not yet started pool using the configured sizing.
    pub fn worker_pool<P>(&self, processor: P) -> WorkerPool
    where
        P: Processor + 'static,
    {
        WorkerPool::new(processor, self.config.pool.clone())
    }

    pub fn monthly_aggregator(&self, source: Arc<dyn MonthlyDataSource>) -> MonthlySummaryAggregator {
        MonthlySummaryAggregator::new(source, self.config.aggregator.clone())
    }

    /// Stop the sweeper and close the streams. Idempotent.
    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();
        if let Some(sweeper) = self.sweeper.take() {
            let _ = sweeper.await;
        }
        self.streams.close();
    }
}

impl std::fmt::Debug for CoreServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreServices")
            .field("config", &self.config)
            .field("tasks", &self.tasks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use budget_core::Context;
    use budget_events::BudgetEvent;
    use std::time::Duration;

    #[tokio::test]
    async fn instances_are_independent() {
        let a = CoreServices::new(CoreConfig::default());
        let b = CoreServices::new(CoreConfig::default());

        assert_eq!(a.bus().handler_count("expense.created"), 1);
        assert_eq!(a.bus().handler_count("task.completed"), 0);

        let ctx = Context::with_timeout(Duration::from_secs(5));
        let expense = budget_core::Expense {
            id: budget_core::ExpenseId::new(),
            description: "lunch".into(),
            amount_cents: 1_200,
            budget_source_id: None,
            period: budget_core::Period::new(2026, 3).unwrap(),
            spent_at: chrono::Utc::now(),
        };
        a.bus()
            .emit(&ctx, "test", &BudgetEvent::ExpenseCreated(expense))
            .await
            .unwrap();

        assert_eq!(a.streams().snapshot().spent_cents, 1_200);
        assert_eq!(b.streams().snapshot().spent_cents, 0);
    }

    #[tokio::test]
    async fn sweeper_runs_when_configured_and_shuts_down() {
        let mut config = CoreConfig::default();
        config.tasks = config.tasks.with_sweep_interval(Duration::from_secs(60));
        let mut services = CoreServices::new(config);
        assert!(services.sweeper.is_some());

        services.shutdown().await;
        services.shutdown().await;
        assert!(services.streams().totals().is_closed());
    }
}
