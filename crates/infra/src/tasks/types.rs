//! Background task records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use budget_core::{ContextError, TaskId};

/// Task lifecycle: `pending → processing → {completed | failed | cancelled}`.
///
/// A task also moves straight from `pending` to `cancelled`. Terminal states
/// are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a tracked task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundTask {
    pub id: TaskId,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    /// 0–100
    pub progress: u8,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BackgroundTask {
    pub(crate) fn pending(task_type: String, payload: serde_json::Value) -> Self {
        Self {
            id: TaskId::new(),
            task_type,
            payload,
            status: TaskStatus::Pending,
            progress: 0,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Move to `processing`. Returns `false` if the task is no longer pending.
    pub(crate) fn mark_processing(&mut self) -> bool {
        if self.status != TaskStatus::Pending {
            return false;
        }
        self.status = TaskStatus::Processing;
        self.started_at = Some(Utc::now());
        true
    }

    pub(crate) fn set_progress(&mut self, progress: u8) {
        if !self.status.is_terminal() {
            self.progress = progress.min(100);
        }
    }

    /// Move to a terminal state. Returns `false` if the task already was terminal.
    pub(crate) fn finish(&mut self, outcome: Result<serde_json::Value, String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        match outcome {
            Ok(value) => {
                self.status = TaskStatus::Completed;
                self.progress = 100;
                self.result = Some(value);
            }
            Err(error) => {
                self.status = TaskStatus::Failed;
                self.error = Some(error);
            }
        }
        self.completed_at = Some(Utc::now());
        true
    }

    pub(crate) fn cancel(&mut self, reason: &str) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = TaskStatus::Cancelled;
        self.error = Some(reason.to_string());
        self.completed_at = Some(Utc::now());
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("task {id} not completed yet (status: {status})")]
    NotReady { id: TaskId, status: TaskStatus },

    #[error("task {id} failed: {error}")]
    Failed { id: TaskId, error: String },

    #[error("task {id} cancelled: {reason}")]
    Cancelled { id: TaskId, reason: String },

    #[error(transparent)]
    Context(#[from] ContextError),
}
