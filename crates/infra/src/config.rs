//! Runtime configuration for the pool, tracker and aggregator.
//!
//! Every knob has a usable default; [`CoreConfig::from_env`] overrides them
//! from `BUDGET_*` environment variables.

use std::time::Duration;

use thiserror::Error;

pub const ENV_WORKERS: &str = "BUDGET_WORKERS";
pub const ENV_QUEUE_CAPACITY: &str = "BUDGET_QUEUE_CAPACITY";
pub const ENV_RESULT_CAPACITY: &str = "BUDGET_RESULT_CAPACITY";
pub const ENV_AGGREGATE_TIMEOUT_MS: &str = "BUDGET_AGGREGATE_TIMEOUT_MS";
pub const ENV_TASK_RETENTION_SECS: &str = "BUDGET_TASK_RETENTION_SECS";
pub const ENV_TASK_SWEEP_SECS: &str = "BUDGET_TASK_SWEEP_SECS";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Worker pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Name for logging
    pub name: String,
    /// Number of concurrent workers (at least 1)
    pub workers: usize,
    /// Job queue bound; `None` means 2 × workers
    pub queue_capacity: Option<usize>,
    /// Result buffer bound; `None` means 2 × workers
    pub result_capacity: Option<usize>,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            name: "worker-pool".to_string(),
            workers: 4,
            queue_capacity: None,
            result_capacity: None,
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn with_result_capacity(mut self, capacity: usize) -> Self {
        self.result_capacity = Some(capacity);
        self
    }

    pub fn effective_workers(&self) -> usize {
        self.workers.max(1)
    }

    pub fn effective_queue_capacity(&self) -> usize {
        self.queue_capacity
            .unwrap_or(2 * self.effective_workers())
            .max(1)
    }

    pub fn effective_result_capacity(&self) -> usize {
        self.result_capacity
            .unwrap_or(2 * self.effective_workers())
            .max(1)
    }
}

/// Background task tracker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskTrackerConfig {
    /// Source tag on lifecycle events published to the bus
    pub event_source: String,
    /// Age after which the sweeper removes terminal tasks
    pub retention: Duration,
    /// Sweep period; `None` disables automatic cleanup
    pub sweep_interval: Option<Duration>,
}

impl Default for TaskTrackerConfig {
    fn default() -> Self {
        Self {
            event_source: "task-tracker".to_string(),
            retention: Duration::from_secs(60 * 60),
            sweep_interval: None,
        }
    }
}

impl TaskTrackerConfig {
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }
}

/// Aggregator configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatorConfig {
    /// Deadline applied on top of the caller's context
    pub timeout: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
        }
    }
}

impl AggregatorConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoreConfig {
    pub pool: WorkerPoolConfig,
    pub tasks: TaskTrackerConfig,
    pub aggregator: AggregatorConfig,
}

impl CoreConfig {
    /// Defaults overridden by `BUDGET_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading values through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(workers) = parse_positive(&lookup, ENV_WORKERS)? {
            config.pool.workers = workers as usize;
        }
        if let Some(capacity) = parse_positive(&lookup, ENV_QUEUE_CAPACITY)? {
            config.pool.queue_capacity = Some(capacity as usize);
        }
        if let Some(capacity) = parse_positive(&lookup, ENV_RESULT_CAPACITY)? {
            config.pool.result_capacity = Some(capacity as usize);
        }
        if let Some(ms) = parse_positive(&lookup, ENV_AGGREGATE_TIMEOUT_MS)? {
            config.aggregator.timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_positive(&lookup, ENV_TASK_RETENTION_SECS)? {
            config.tasks.retention = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_positive(&lookup, ENV_TASK_SWEEP_SECS)? {
            config.tasks.sweep_interval = Some(Duration::from_secs(secs));
        }

        Ok(config)
    }
}

fn parse_positive<F>(lookup: &F, key: &'static str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let invalid = |reason: String| ConfigError::Invalid {
        key,
        value: raw.clone(),
        reason,
    };
    let value: u64 = raw.trim().parse().map_err(|e: std::num::ParseIntError| invalid(e.to_string()))?;
    if value == 0 {
        return Err(invalid("must be greater than zero".to_string()));
    }
    Ok(Some(value))
}
