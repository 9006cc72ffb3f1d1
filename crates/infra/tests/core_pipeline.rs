//! End-to-end behaviour of the worker pool and the assembled services.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use proptest::prelude::*;
use serde_json::json;

use budget_core::{Context, Expense, ExpenseId, Period};
use budget_events::{BudgetEvent, Event, handler_fn};
use budget_infra::tasks::TaskStatus;
use budget_infra::workers::{Job, JobResult, WorkerPool, processor_fn};
use budget_infra::{CoreConfig, CoreServices, WorkerPoolConfig};

fn init_logging() {
    budget_observability::init_with(
        budget_observability::LogConfig::default()
            .with_format(budget_observability::LogFormat::Pretty)
            .with_default_filter("warn"),
    );
}

async fn run_jobs(workers: usize, jobs: usize) -> (Vec<JobResult>, usize) {
    let processor = processor_fn(|job: Job| async move {
        let n = job.payload["n"].as_u64().unwrap_or_default();
        if n % 7 == 0 {
            return Err(anyhow::anyhow!("multiple of seven"));
        }
        tokio::task::yield_now().await;
        Ok(json!(n * 2))
    });
    let pool = Arc::new(WorkerPool::new(
        processor,
        WorkerPoolConfig::default()
            .with_name(format!("pipeline-{workers}"))
            .with_workers(workers),
    ));
    let mut results = pool.results().expect("receiver available once");
    pool.start().expect("pool starts");

    let drain = tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(result) = results.recv().await {
            seen.push(result);
        }
        seen
    });

    let ctx = Context::with_timeout(Duration::from_secs(30));
    let mut accepted = 0;
    for n in 0..jobs {
        if pool.submit(&ctx, Job::new("pipeline.double", json!({ "n": n }))).await.is_ok() {
            accepted += 1;
        }
    }

    pool.stop().await;
    let seen = drain.await.expect("drain task");
    assert_eq!(pool.stats().processed as usize, seen.len());
    (seen, accepted)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_accepted_job_yields_exactly_one_result() {
    init_logging();

    for workers in [1, 4, 16] {
        let (results, accepted) = run_jobs(workers, 1000).await;
        assert_eq!(accepted, 1000, "workers={workers}");
        assert_eq!(results.len(), 1000, "workers={workers}");

        let unique: HashSet<_> = results.iter().map(|r| r.job_id).collect();
        assert_eq!(unique.len(), 1000, "duplicate results with workers={workers}");

        let failed = results.iter().filter(|r| !r.is_success()).count();
        assert_eq!(failed, (0..1000).filter(|n| n % 7 == 0).count());
        assert!(results.iter().all(|r| r.worker_id < workers));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_waits_for_in_flight_jobs() {
    let started = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&started);
    let processor = processor_fn(move |job: Job| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(job.payload)
        }
    });
    let pool = WorkerPool::new(
        processor,
        WorkerPoolConfig::default()
            .with_workers(3)
            .with_queue_capacity(16)
            .with_result_capacity(16),
    );
    let mut results = pool.results().unwrap();
    pool.start().unwrap();

    for n in 0..10 {
        pool.try_submit(Job::new("slow", json!(n))).unwrap();
    }
    while started.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }

    pool.stop().await;

    let mut delivered = 0;
    while let Ok(result) = results.try_recv() {
        assert!(result.is_success());
        delivered += 1;
    }
    assert_eq!(delivered, 10);
    assert!(results.recv().await.is_none());

    let stats = pool.stats();
    assert_eq!(stats.processed, 10);
    assert_eq!(stats.active_workers, 0);
    assert!(stats.avg_duration >= Duration::from_millis(20));

    // Second stop is a no-op and does not touch the counters.
    pool.stop().await;
    assert_eq!(pool.stats(), stats);
}

#[tokio::test]
async fn results_stream_ends_after_stop() {
    use tokio_stream::StreamExt;

    let pool = WorkerPool::new(
        processor_fn(|job: Job| async move { Ok(job.payload) }),
        WorkerPoolConfig::default().with_workers(2),
    );
    let stream = pool.results_stream().unwrap();
    pool.start().unwrap();
    for n in 0..3 {
        pool.try_submit(Job::new("echo", json!(n))).unwrap();
    }
    let collect = tokio::spawn(stream.collect::<Vec<JobResult>>());
    pool.stop().await;

    let results = collect.await.unwrap();
    assert_eq!(results.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn services_tie_tasks_bus_and_streams_together() {
    init_logging();
    let services = CoreServices::new(CoreConfig::default());

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    services.bus().subscribe(
        "task.*",
        handler_fn("task-watcher", move |event: Event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event.event_type().to_string());
                Ok(())
            }
        }),
    );

    let bus = services.bus().clone();
    let id = services.tasks().submit_async("expense.import", json!({"rows": 1}), move |handle| async move {
        handle.report_progress(50);
        let expense = Expense {
            id: ExpenseId::new(),
            description: "imported".into(),
            amount_cents: 4_200,
            budget_source_id: None,
            period: Period::new(2026, 3)?,
            spent_at: chrono::Utc::now(),
        };
        bus.emit(&Context::background(), "importer", &BudgetEvent::ExpenseCreated(expense))
            .await?;
        Ok::<_, anyhow::Error>(json!({"imported": 1}))
    });

    let task = services
        .tasks()
        .wait(&Context::with_timeout(Duration::from_secs(5)), id)
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(services.streams().snapshot().spent_cents, 4_200);
    assert_eq!(
        services.streams().latest_expense().value().map(|e| e.amount_cents),
        Some(4_200)
    );

    let announced = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
    assert_eq!(announced.as_deref(), Some("task.completed"));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn result_count_matches_accepted_jobs(workers in 1usize..8, jobs in 0usize..64) {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let (results, accepted) = rt.block_on(run_jobs(workers, jobs));
        prop_assert_eq!(accepted, jobs);
        prop_assert_eq!(results.len(), accepted);
    }
}
