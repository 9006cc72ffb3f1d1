//! Background task tracking with status and progress.
//!
//! Unlike the worker pool, submission never waits: every task gets its own
//! detached Tokio task and a record that callers poll or wait on.

pub mod sweeper;
pub mod tracker;
pub mod types;

pub use tracker::{TaskHandle, TaskTracker};
pub use types::{BackgroundTask, TaskError, TaskStatus};
