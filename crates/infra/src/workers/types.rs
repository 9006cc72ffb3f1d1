//! Job and result records exchanged with the worker pool.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use budget_core::JobId;

/// Scheduling hint carried by a job.
///
/// Advisory only: the pool serves jobs in submission order regardless of
/// priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// A unit of work submitted to the [`WorkerPool`](super::WorkerPool).
///
/// Immutable once submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Routing key, e.g. `budget.recalculate`.
    pub job_type: String,
    pub payload: serde_json::Value,
    pub priority: JobPriority,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            payload,
            priority: JobPriority::Normal,
            created_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// Outcome of one job, produced exactly once per accepted job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub job_type: String,
    /// Processor output, or the error text if processing failed or panicked.
    pub outcome: Result<serde_json::Value, String>,
    pub duration: Duration,
    pub completed_at: DateTime<Utc>,
    /// Index of the worker that ran the job, `0..workers`.
    pub worker_id: usize,
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn error(&self) -> Option<&str> {
        self.outcome.as_ref().err().map(String::as_str)
    }
}
