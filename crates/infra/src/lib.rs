//! Concurrent core: worker pool, background tasks, aggregation, live streams.
//!
//! Everything here is process-memory only; nothing is persisted.

pub mod aggregate;
pub mod config;
pub mod services;
pub mod streams;
pub mod tasks;
pub mod workers;

pub use config::{AggregatorConfig, ConfigError, CoreConfig, TaskTrackerConfig, WorkerPoolConfig};
pub use services::CoreServices;
pub use streams::BudgetStreams;
