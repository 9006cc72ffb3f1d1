//! Unbounded background task tracker.
//!
//! `submit_async` records a pending task and detaches the work onto its own
//! Tokio task, returning the id immediately. Status, progress, result and
//! error live in one map behind one lock; the work itself never runs under it.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use budget_core::{Context, TaskId, panic_message};
use budget_events::{DomainEvent, Event, EventBus};

use super::types::{BackgroundTask, TaskError, TaskStatus};
use crate::config::TaskTrackerConfig;

const CANCELLED_REASON: &str = "task cancelled";

struct Entry {
    task: BackgroundTask,
    cancel: CancellationToken,
    status: watch::Sender<TaskStatus>,
}

struct TrackerInner {
    tasks: Mutex<HashMap<TaskId, Entry>>,
    config: TaskTrackerConfig,
    bus: Option<EventBus>,
}

/// Tracks detached background work by id.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone)]
pub struct TaskTracker {
    inner: Arc<TrackerInner>,
}

/// Given to the work closure for reporting progress and observing cancellation.
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    payload: Arc<serde_json::Value>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl TaskHandle {
    pub fn task_id(&self) -> TaskId {
        self.id
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Best-effort progress update, clamped to 100. Ignored once terminal.
    pub fn report_progress(&self, progress: u8) {
        self.tracker.update(self.id, |task| {
            task.set_progress(progress);
            false
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the task has been cancelled through the tracker.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle").field("id", &self.id).finish()
    }
}

/// Terminal transition announced on the event bus.
#[derive(Debug, Clone, Serialize)]
struct TaskFinished {
    task: BackgroundTask,
}

impl DomainEvent for TaskFinished {
    fn event_type(&self) -> &'static str {
        match self.task.status {
            TaskStatus::Completed => "task.completed",
            TaskStatus::Failed => "task.failed",
            _ => "task.cancelled",
        }
    }

    fn to_data(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(&self.task)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new(TaskTrackerConfig::default())
    }
}

impl TaskTracker {
    pub fn new(config: TaskTrackerConfig) -> Self {
        Self::build(config, None)
    }

    /// Publish `task.completed` / `task.failed` / `task.cancelled` on `bus`.
    pub fn with_event_bus(config: TaskTrackerConfig, bus: EventBus) -> Self {
        Self::build(config, Some(bus))
    }

    fn build(config: TaskTrackerConfig, bus: Option<EventBus>) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                tasks: Mutex::new(HashMap::new()),
                config,
                bus,
            }),
        }
    }

    pub fn config(&self) -> &TaskTrackerConfig {
        &self.inner.config
    }

    /// Record a pending task and run `work` on a detached Tokio task.
    ///
    /// Returns without waiting for the work to start. An error or panic in
    /// `work` marks the task failed.
    pub fn submit_async<F, Fut>(
        &self,
        task_type: impl Into<String>,
        payload: serde_json::Value,
        work: F,
    ) -> TaskId
    where
        F: FnOnce(TaskHandle) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        let task = BackgroundTask::pending(task_type.into(), payload);
        let id = task.id;
        let handle = TaskHandle {
            id,
            payload: Arc::new(task.payload.clone()),
            cancel: CancellationToken::new(),
            tracker: self.clone(),
        };
        debug!(task_id = %id, task_type = %task.task_type, "task submitted");

        {
            let (status, _) = watch::channel(TaskStatus::Pending);
            lock(&self.inner.tasks).insert(
                id,
                Entry {
                    task,
                    cancel: handle.cancel.clone(),
                    status,
                },
            );
        }

        let tracker = self.clone();
        tokio::spawn(async move {
            if !tracker.update(id, BackgroundTask::mark_processing) {
                debug!(task_id = %id, "task cancelled before start");
                return;
            }

            let outcome = match AssertUnwindSafe(work(handle)).catch_unwind().await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(format!("{e:#}")),
                Err(panic) => Err(format!("task panicked: {}", panic_message(panic.as_ref()))),
            };
            tracker.finish(id, outcome);
        });

        id
    }

    pub fn get(&self, id: TaskId) -> Result<BackgroundTask, TaskError> {
        lock(&self.inner.tasks)
            .get(&id)
            .map(|e| e.task.clone())
            .ok_or(TaskError::NotFound(id))
    }

    pub fn get_status(&self, id: TaskId) -> Result<TaskStatus, TaskError> {
        lock(&self.inner.tasks)
            .get(&id)
            .map(|e| e.task.status)
            .ok_or(TaskError::NotFound(id))
    }

    /// The result of a completed task.
    ///
    /// Non-terminal tasks yield [`TaskError::NotReady`]; failed and cancelled
    /// ones yield their own variants.
    pub fn get_result(&self, id: TaskId) -> Result<serde_json::Value, TaskError> {
        let task = self.get(id)?;
        match task.status {
            TaskStatus::Completed => Ok(task.result.unwrap_or(serde_json::Value::Null)),
            TaskStatus::Failed => Err(TaskError::Failed {
                id,
                error: task.error.unwrap_or_default(),
            }),
            TaskStatus::Cancelled => Err(TaskError::Cancelled {
                id,
                reason: task.error.unwrap_or_default(),
            }),
            status => Err(TaskError::NotReady { id, status }),
        }
    }

    /// Request cancellation.
    ///
    /// Returns `Ok(true)` if the task was pending or processing and is now
    /// cancelled, `Ok(false)` if it had already finished. Running work is
    /// signalled through its [`TaskHandle`] but not interrupted.
    pub fn cancel(&self, id: TaskId) -> Result<bool, TaskError> {
        let snapshot = {
            let mut tasks = lock(&self.inner.tasks);
            let entry = tasks.get_mut(&id).ok_or(TaskError::NotFound(id))?;
            if !entry.task.cancel(CANCELLED_REASON) {
                return Ok(false);
            }
            entry.cancel.cancel();
            entry.status.send_replace(TaskStatus::Cancelled);
            entry.task.clone()
        };
        info!(task_id = %id, task_type = %snapshot.task_type, "task cancelled");
        self.announce(snapshot);
        Ok(true)
    }

    /// Wait until the task is terminal or `ctx` is done.
    pub async fn wait(&self, ctx: &Context, id: TaskId) -> Result<BackgroundTask, TaskError> {
        let mut rx = {
            let tasks = lock(&self.inner.tasks);
            tasks.get(&id).ok_or(TaskError::NotFound(id))?.status.subscribe()
        };
        // A closed channel means the entry was removed; `get` reports that.
        let _ = ctx.run(rx.wait_for(|status| status.is_terminal())).await?;
        self.get(id)
    }

    /// Snapshot of tracked tasks, oldest first, optionally filtered by status.
    pub fn list(&self, status: Option<TaskStatus>) -> Vec<BackgroundTask> {
        let mut tasks: Vec<BackgroundTask> = lock(&self.inner.tasks)
            .values()
            .filter(|e| status.is_none_or(|s| e.task.status == s))
            .map(|e| e.task.clone())
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.tasks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove terminal tasks that finished more than `older_than` ago.
    ///
    /// Returns the number removed. This is the only way tasks leave the
    /// tracker.
    pub fn cleanup(&self, older_than: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };

        let mut tasks = lock(&self.inner.tasks);
        let before = tasks.len();
        tasks.retain(|_, e| {
            !(e.task.status.is_terminal() && e.task.completed_at.is_some_and(|at| at <= cutoff))
        });
        let removed = before - tasks.len();
        drop(tasks);

        if removed > 0 {
            debug!(removed, "cleaned up finished tasks");
        }
        removed
    }

    /// Apply `f` to the task; returns what `f` returns, or `false` if the task is gone.
    fn update<F>(&self, id: TaskId, f: F) -> bool
    where
        F: FnOnce(&mut BackgroundTask) -> bool,
    {
        let mut tasks = lock(&self.inner.tasks);
        let Some(entry) = tasks.get_mut(&id) else {
            return false;
        };
        let changed = f(&mut entry.task);
        if changed {
            entry.status.send_replace(entry.task.status);
        }
        changed
    }

    fn finish(&self, id: TaskId, outcome: Result<serde_json::Value, String>) {
        let snapshot = {
            let mut tasks = lock(&self.inner.tasks);
            let Some(entry) = tasks.get_mut(&id) else {
                return;
            };
            if !entry.task.finish(outcome) {
                // Cancelled while running; the cancellation stands.
                return;
            }
            entry.status.send_replace(entry.task.status);
            entry.task.clone()
        };

        match snapshot.status {
            TaskStatus::Failed => warn!(
                task_id = %id,
                task_type = %snapshot.task_type,
                error = snapshot.error.as_deref().unwrap_or_default(),
                "task failed"
            ),
            _ => debug!(task_id = %id, task_type = %snapshot.task_type, "task completed"),
        }
        self.announce(snapshot);
    }

    fn announce(&self, task: BackgroundTask) {
        let Some(bus) = &self.inner.bus else {
            return;
        };
        let event = match Event::from_domain(self.inner.config.event_source.as_str(), &TaskFinished { task }) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "could not encode task event");
                return;
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(_) => drop(bus.publish_async(Context::background(), event)),
            Err(_) => warn!(event_type = event.event_type(), "no runtime; task event dropped"),
        }
    }
}

impl std::fmt::Debug for TaskTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskTracker")
            .field("tasks", &self.len())
            .field("has_bus", &self.inner.bus.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use budget_events::handler_fn;
    use serde_json::json;
    use std::time::Instant;

    #[tokio::test]
    async fn submit_returns_immediately_and_transitions() {
        let tracker = TaskTracker::default();
        let gate = Arc::new(tokio::sync::Notify::new());
        let release = Arc::clone(&gate);

        let started = Instant::now();
        let id = tracker.submit_async("report.export", json!({"month": "2024-05"}), move |handle| async move {
            handle.report_progress(10);
            release.notified().await;
            Ok(json!({"rows": handle.payload()["month"].clone()}))
        });
        assert!(started.elapsed() < Duration::from_millis(50));
        assert!(matches!(
            tracker.get_status(id).unwrap(),
            TaskStatus::Pending | TaskStatus::Processing
        ));
        assert!(matches!(tracker.get_result(id), Err(TaskError::NotReady { .. })));

        while tracker.get(id).unwrap().progress < 10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(tracker.get_status(id).unwrap(), TaskStatus::Processing);

        gate.notify_one();
        let task = tracker.wait(&Context::with_timeout(Duration::from_secs(5)), id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);
        assert_eq!(tracker.get_result(id).unwrap(), json!({"rows": "2024-05"}));
    }

    #[tokio::test]
    async fn errors_and_panics_mark_failed() {
        let tracker = TaskTracker::default();
        let ctx = Context::with_timeout(Duration::from_secs(5));

        let failing = tracker.submit_async("import", json!(null), |_| async {
            Err(anyhow::anyhow!("bad csv"))
        });
        let task = tracker.wait(&ctx, failing).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(
            tracker.get_result(failing),
            Err(TaskError::Failed {
                id: failing,
                error: "bad csv".into()
            })
        );

        let panicking = tracker.submit_async("import", json!(null), |handle| async move {
            if handle.payload().is_null() {
                panic!("unexpected null");
            }
            Ok(json!(1))
        });
        let task = tracker.wait(&ctx, panicking).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("unexpected null"));
    }

    #[tokio::test]
    async fn cancel_signals_running_work_and_sticks() {
        let tracker = TaskTracker::default();
        let id = tracker.submit_async("recalculate", json!({}), |handle| async move {
            handle.cancelled().await;
            Ok(json!("finished anyway"))
        });

        while tracker.get_status(id).unwrap() == TaskStatus::Pending {
            tokio::task::yield_now().await;
        }
        assert!(tracker.cancel(id).unwrap());
        assert!(!tracker.cancel(id).unwrap());

        // Give the work a chance to return; its result must not overwrite.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(tracker.get_status(id).unwrap(), TaskStatus::Cancelled);
        assert!(matches!(tracker.get_result(id), Err(TaskError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let tracker = TaskTracker::default();
        let id = TaskId::new();
        assert_eq!(tracker.get_status(id), Err(TaskError::NotFound(id)));
        assert_eq!(tracker.get_result(id), Err(TaskError::NotFound(id)));
        assert_eq!(tracker.cancel(id), Err(TaskError::NotFound(id)));
        assert!(matches!(
            tracker.wait(&Context::background(), id).await,
            Err(TaskError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_honours_deadline() {
        let tracker = TaskTracker::default();
        let id = tracker.submit_async("slow", json!({}), |_| async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(json!(null))
        });

        let ctx = Context::with_timeout(Duration::from_millis(100));
        assert_eq!(
            tracker.wait(&ctx, id).await,
            Err(TaskError::Context(budget_core::ContextError::DeadlineExceeded))
        );
        assert_eq!(tracker.get_status(id).unwrap(), TaskStatus::Processing);
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_terminal_tasks() {
        let tracker = TaskTracker::default();
        let ctx = Context::with_timeout(Duration::from_secs(5));
        let done = tracker.submit_async("quick", json!({}), |_| async { Ok(json!(1)) });
        tracker.wait(&ctx, done).await.unwrap();
        let gate = Arc::new(tokio::sync::Notify::new());
        let hold = Arc::clone(&gate);
        let running = tracker.submit_async("held", json!({}), move |_| async move {
            hold.notified().await;
            Ok(json!(2))
        });

        assert_eq!(tracker.cleanup(Duration::from_secs(3600)), 0);
        assert_eq!(tracker.cleanup(Duration::ZERO), 1);
        assert_eq!(tracker.get_status(done), Err(TaskError::NotFound(done)));
        assert!(tracker.get(running).is_ok());
        assert_eq!(tracker.list(None).len(), 1);

        gate.notify_one();
        tracker.wait(&ctx, running).await.unwrap();
        assert_eq!(tracker.list(Some(TaskStatus::Completed)).len(), 1);
    }

    #[tokio::test]
    async fn terminal_transitions_are_published() {
        let bus = EventBus::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe(
            "task.*",
            handler_fn("recorder", move |event: Event| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(event.event_type().to_string());
                    Ok(())
                }
            }),
        );
        let tracker = TaskTracker::with_event_bus(TaskTrackerConfig::default(), bus);

        let id = tracker.submit_async("quick", json!({}), |_| async { Ok(json!("ok")) });
        tracker.wait(&Context::with_timeout(Duration::from_secs(5)), id).await.unwrap();

        let event_type = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(event_type.as_deref(), Some("task.completed"));
    }
}
