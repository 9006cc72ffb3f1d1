//! Bounded worker pool.
//!
//! A fixed number of workers share one bounded job queue. Each worker loops
//! dequeue → process → publish a [`JobResult`], capturing processor errors
//! and panics into the result so a failing job never takes a worker down.
//!
//! Lifecycle: `idle → running → stopped`. A stopped pool cannot be
//! restarted.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use budget_core::{Context, ContextError, panic_message};

use super::processor::Processor;
use super::types::{Job, JobResult};
use crate::config::WorkerPoolConfig;

/// Submission and lifecycle failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool is not running")]
    NotRunning,

    #[error("worker pool is already running")]
    AlreadyRunning,

    #[error("job queue is full")]
    QueueFull,

    #[error(transparent)]
    Context(#[from] ContextError),
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub active_workers: usize,
    /// Accepted but not yet picked up by a worker
    pub queued: usize,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub total_duration: Duration,
    /// Running mean over all processed jobs
    pub avg_duration: Duration,
}

impl PoolStats {
    fn record(&mut self, success: bool, duration: Duration) {
        self.active_workers = self.active_workers.saturating_sub(1);
        self.processed += 1;
        if success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.total_duration += duration;
        self.avg_duration = self.total_duration / self.processed.min(u32::MAX as u64) as u32;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

struct Runtime {
    lifecycle: Lifecycle,
    jobs_tx: Option<mpsc::Sender<Job>>,
    jobs_rx: Option<mpsc::Receiver<Job>>,
    results_tx: Option<mpsc::Sender<JobResult>>,
    handles: Vec<JoinHandle<()>>,
}

/// Fixed-size pool of async workers fed by a bounded queue.
///
/// Must be started and stopped from within a Tokio runtime.
pub struct WorkerPool {
    name: String,
    workers: usize,
    processor: Arc<dyn Processor>,
    runtime: Mutex<Runtime>,
    results_rx: Mutex<Option<mpsc::Receiver<JobResult>>>,
    stats: Arc<Mutex<PoolStats>>,
    shutdown: CancellationToken,
    stopped: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WorkerPool {
    pub fn new<P>(processor: P, config: WorkerPoolConfig) -> Self
    where
        P: Processor + 'static,
    {
        let workers = config.effective_workers();
        let (jobs_tx, jobs_rx) = mpsc::channel(config.effective_queue_capacity());
        let (results_tx, results_rx) = mpsc::channel(config.effective_result_capacity());

        Self {
            name: config.name,
            workers,
            processor: Arc::new(processor),
            runtime: Mutex::new(Runtime {
                lifecycle: Lifecycle::Idle,
                jobs_tx: Some(jobs_tx),
                jobs_rx: Some(jobs_rx),
                results_tx: Some(results_tx),
                handles: Vec::with_capacity(workers),
            }),
            results_rx: Mutex::new(Some(results_rx)),
            stats: Arc::new(Mutex::new(PoolStats {
                workers,
                ..PoolStats::default()
            })),
            shutdown: CancellationToken::new(),
            stopped: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn is_running(&self) -> bool {
        lock(&self.runtime).lifecycle == Lifecycle::Running
    }

    /// Spawn the workers.
    pub fn start(&self) -> Result<(), PoolError> {
        let mut guard = lock(&self.runtime);
        let rt = &mut *guard;
        match rt.lifecycle {
            Lifecycle::Running => return Err(PoolError::AlreadyRunning),
            Lifecycle::Stopped => return Err(PoolError::NotRunning),
            Lifecycle::Idle => {}
        }
        let (Some(jobs_rx), Some(results_tx)) = (rt.jobs_rx.take(), rt.results_tx.take()) else {
            return Err(PoolError::NotRunning);
        };

        // Receiving is serialized; processing is not.
        let jobs_rx = Arc::new(tokio::sync::Mutex::new(jobs_rx));
        for worker_id in 0..self.workers {
            let worker = Worker {
                pool: self.name.clone(),
                id: worker_id,
                jobs: Arc::clone(&jobs_rx),
                results: results_tx.clone(),
                processor: Arc::clone(&self.processor),
                stats: Arc::clone(&self.stats),
            };
            rt.handles.push(tokio::spawn(worker.run()));
        }
        rt.lifecycle = Lifecycle::Running;

        info!(pool = %self.name, workers = self.workers, "worker pool started");
        Ok(())
    }

    /// Enqueue `job`, failing fast when the pool is not running.
    ///
    /// When the queue is full, waits for space only if `ctx` carries a
    /// deadline (or is cancellable by its owner); a background context
    /// without deadline fails immediately with [`PoolError::QueueFull`].
    pub async fn submit(&self, ctx: &Context, job: Job) -> Result<(), PoolError> {
        let tx = self.sender()?;
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }

        lock(&self.stats).queued += 1;
        let job = match tx.try_send(job) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Closed(_)) => {
                self.unqueue();
                return Err(PoolError::NotRunning);
            }
            Err(TrySendError::Full(job)) => job,
        };

        if !ctx.has_deadline() {
            self.unqueue();
            return Err(PoolError::QueueFull);
        }

        let outcome = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(PoolError::NotRunning),
            sent = ctx.run(tx.send(job)) => match sent {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(PoolError::NotRunning),
                Err(err) => Err(PoolError::Context(err)),
            },
        };
        if outcome.is_err() {
            self.unqueue();
        }
        outcome
    }

    /// Enqueue `job` without waiting.
    pub fn try_submit(&self, job: Job) -> Result<(), PoolError> {
        let tx = self.sender()?;
        lock(&self.stats).queued += 1;
        match tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.unqueue();
                Err(PoolError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => {
                self.unqueue();
                Err(PoolError::NotRunning)
            }
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<Job>, PoolError> {
        let rt = lock(&self.runtime);
        match (rt.lifecycle, &rt.jobs_tx) {
            (Lifecycle::Running, Some(tx)) => Ok(tx.clone()),
            _ => Err(PoolError::NotRunning),
        }
    }

    fn unqueue(&self) {
        let mut stats = lock(&self.stats);
        stats.queued = stats.queued.saturating_sub(1);
    }

    /// The result receiver. Handed out once; `None` afterwards.
    ///
    /// Results must be drained: once the bounded buffer fills, workers wait
    /// and the job queue backs up behind them.
    pub fn results(&self) -> Option<mpsc::Receiver<JobResult>> {
        lock(&self.results_rx).take()
    }

    /// [`results`](Self::results) as a `Stream`.
    pub fn results_stream(&self) -> Option<ReceiverStream<JobResult>> {
        self.results().map(ReceiverStream::new)
    }

    /// Stop accepting jobs, let the workers drain the queue, and wait for them.
    ///
    /// The result stream ends once this returns. Idempotent; concurrent
    /// callers all wait for the same shutdown. If the result receiver was
    /// never taken, remaining results are discarded.
    pub async fn stop(&self) {
        let handles = {
            let mut guard = lock(&self.runtime);
            let rt = &mut *guard;
            match rt.lifecycle {
                Lifecycle::Stopped => None,
                Lifecycle::Idle => {
                    rt.lifecycle = Lifecycle::Stopped;
                    rt.jobs_tx = None;
                    rt.jobs_rx = None;
                    rt.results_tx = None;
                    Some(Vec::new())
                }
                Lifecycle::Running => {
                    rt.lifecycle = Lifecycle::Stopped;
                    rt.jobs_tx = None;
                    Some(std::mem::take(&mut rt.handles))
                }
            }
        };

        let Some(handles) = handles else {
            self.stopped.cancelled().await;
            return;
        };

        self.shutdown.cancel();
        // Nobody can read these results any more; let workers finish.
        drop(self.results());

        info!(pool = %self.name, "worker pool stopping");
        for handle in handles {
            if let Err(e) = handle.await {
                error!(pool = %self.name, error = %e, "worker task failed");
            }
        }
        self.stopped.cancel();
        info!(pool = %self.name, "worker pool stopped");
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> PoolStats {
        lock(&self.stats).clone()
    }
}

impl core::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("workers", &self.workers)
            .field("lifecycle", &lock(&self.runtime).lifecycle)
            .finish()
    }
}

struct Worker {
    pool: String,
    id: usize,
    jobs: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    results: mpsc::Sender<JobResult>,
    processor: Arc<dyn Processor>,
    stats: Arc<Mutex<PoolStats>>,
}

impl Worker {
    async fn run(self) {
        debug!(pool = %self.pool, worker = self.id, "worker started");

        loop {
            let next = self.jobs.lock().await.recv().await;
            let Some(job) = next else {
                break;
            };

            {
                let mut stats = lock(&self.stats);
                stats.queued = stats.queued.saturating_sub(1);
                stats.active_workers += 1;
            }

            let result = self.execute(job).await;
            lock(&self.stats).record(result.is_success(), result.duration);

            if self.results.send(result).await.is_err() {
                debug!(pool = %self.pool, worker = self.id, "result receiver dropped");
            }
        }

        debug!(pool = %self.pool, worker = self.id, "worker exited");
    }

    async fn execute(&self, job: Job) -> JobResult {
        let started = Instant::now();
        let outcome = match AssertUnwindSafe(self.processor.process(&job))
            .catch_unwind()
            .await
        {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!(pool = %self.pool, job_id = %job.id, job_type = %job.job_type, error = %e, "job failed");
                Err(format!("{e:#}"))
            }
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                error!(pool = %self.pool, job_id = %job.id, job_type = %job.job_type, error = %msg, "processor panicked");
                Err(format!("processor panicked: {msg}"))
            }
        };

        JobResult {
            job_id: job.id,
            job_type: job.job_type,
            outcome,
            duration: started.elapsed(),
            completed_at: Utc::now(),
            worker_id: self.id,
        }
    }
}
