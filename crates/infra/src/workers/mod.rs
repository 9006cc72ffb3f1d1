//! Bounded worker pool for controlled-concurrency job execution.
//!
//! ## Components
//!
//! - `Job` / `JobResult`: what goes in and what comes out
//! - `Processor`: pluggable job logic, with `ProcessorRegistry` for routing
//!   by job type
//! - `WorkerPool`: fixed worker count, bounded queue, bounded result stream

pub mod pool;
pub mod processor;
pub mod types;

pub use pool::{PoolError, PoolStats, WorkerPool};
pub use processor::{Processor, ProcessorRegistry, processor_fn};
pub use types::{Job, JobPriority, JobResult};
