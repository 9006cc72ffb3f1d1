//! Pluggable job processing.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use super::types::Job;

/// Turns a [`Job`] into an output value.
///
/// Errors (and panics) are captured into the job's
/// [`JobResult`](super::JobResult); they never stop the worker.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, job: &Job) -> anyhow::Result<serde_json::Value>;
}

#[async_trait]
impl<P: Processor + ?Sized> Processor for Arc<P> {
    async fn process(&self, job: &Job) -> anyhow::Result<serde_json::Value> {
        (**self).process(job).await
    }
}

struct FnProcessor<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Processor for FnProcessor<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send,
{
    async fn process(&self, job: &Job) -> anyhow::Result<serde_json::Value> {
        (self.f)(job.clone()).await
    }
}

/// Wrap an async closure as a [`Processor`].
pub fn processor_fn<F, Fut>(f: F) -> Arc<dyn Processor>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
{
    Arc::new(FnProcessor { f })
}

/// Routes jobs to processors by `job_type`.
///
/// Lookup order: exact type, then the first matching category pattern
/// (`"budget.*"` matches `"budget.recalculate"`), then `"*"`.
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn Processor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `processor` for a job type or pattern, replacing any previous one.
    pub fn register(&mut self, pattern: impl Into<String>, processor: Arc<dyn Processor>) {
        self.processors.insert(pattern.into(), processor);
    }

    pub fn with(mut self, pattern: impl Into<String>, processor: Arc<dyn Processor>) -> Self {
        self.register(pattern, processor);
        self
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    fn route(&self, job_type: &str) -> Option<&Arc<dyn Processor>> {
        if let Some(p) = self.processors.get(job_type) {
            return Some(p);
        }

        // Longest category first, so "budget.monthly.*" beats "budget.*".
        let mut best: Option<(&str, &Arc<dyn Processor>)> = None;
        for (pattern, processor) in &self.processors {
            let Some(prefix) = pattern.strip_suffix(".*") else {
                continue;
            };
            let matches = job_type
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('.'));
            if matches && best.is_none_or(|(b, _)| prefix.len() > b.len()) {
                best = Some((prefix, processor));
            }
        }
        if let Some((_, p)) = best {
            return Some(p);
        }

        self.processors.get("*")
    }
}

impl core::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut patterns: Vec<&String> = self.processors.keys().collect();
        patterns.sort();
        f.debug_struct("ProcessorRegistry")
            .field("patterns", &patterns)
            .finish()
    }
}

#[async_trait]
impl Processor for ProcessorRegistry {
    async fn process(&self, job: &Job) -> anyhow::Result<serde_json::Value> {
        match self.route(&job.job_type) {
            Some(processor) => processor.process(job).await,
            None => Err(anyhow::anyhow!("no processor for job type: {}", job.job_type)),
        }
    }
}
