//! Concurrent fan-out with a single join.
//!
//! Each fetch runs on its own Tokio task and writes its outcome into a shared
//! slot struct under one lock. Fetch errors are collected, never fatal; only
//! the caller's context finishing fails the whole aggregation.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use budget_core::{Context, ContextError, panic_message};

/// A sub-fetch that failed; its slot keeps the default value.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{fetch}: {message}")]
pub struct FetchError {
    pub fetch: String,
    pub message: String,
}

/// Outcome of a finished aggregation.
#[derive(Debug, Clone)]
pub struct Aggregated<S> {
    pub value: S,
    /// One entry per failed fetch, in completion order.
    pub errors: Vec<FetchError>,
    pub elapsed: Duration,
}

impl<S> Aggregated<S> {
    /// True when every fetch succeeded.
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

/// The aggregation did not finish before its context was done.
///
/// Slots already filled by finished fetches are kept for inspection.
#[derive(Debug, Error)]
pub enum AggregateError<S: std::fmt::Debug> {
    #[error("aggregate {name} exceeded its deadline ({pending} fetches unfinished)")]
    DeadlineExceeded {
        name: String,
        pending: usize,
        partial: S,
        errors: Vec<FetchError>,
    },

    #[error("aggregate {name} cancelled ({pending} fetches unfinished)")]
    Cancelled {
        name: String,
        pending: usize,
        partial: S,
        errors: Vec<FetchError>,
    },
}

impl<S: std::fmt::Debug> AggregateError<S> {
    pub fn partial(&self) -> &S {
        match self {
            Self::DeadlineExceeded { partial, .. } | Self::Cancelled { partial, .. } => partial,
        }
    }

    pub fn errors(&self) -> &[FetchError] {
        match self {
            Self::DeadlineExceeded { errors, .. } | Self::Cancelled { errors, .. } => errors,
        }
    }
}

struct Slots<S> {
    value: S,
    errors: Vec<FetchError>,
}

type FetchTask = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Builder for one fan-out: register fetches, then [`join`](Self::join).
pub struct Aggregation<S> {
    name: String,
    slots: Arc<Mutex<Slots<S>>>,
    fetches: Vec<FetchTask>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<S> Aggregation<S>
where
    S: Default + std::fmt::Debug + Send + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slots: Arc::new(Mutex::new(Slots {
                value: S::default(),
                errors: Vec::new(),
            })),
            fetches: Vec::new(),
        }
    }

    /// Add a fetch whose value is stored by `set`.
    ///
    /// Each slot should be owned by exactly one fetch.
    pub fn fetch<T, Fut, Set>(mut self, name: impl Into<String>, fut: Fut, set: Set) -> Self
    where
        T: Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        Set: FnOnce(&mut S, T) + Send + 'static,
    {
        let name = name.into();
        let slots = Arc::clone(&self.slots);
        let aggregate = self.name.clone();
        self.fetches.push(Box::pin(async move {
            let outcome = match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(format!("{e:#}")),
                Err(panic) => Err(format!("fetch panicked: {}", panic_message(panic.as_ref()))),
            };

            let mut guard = lock(&slots);
            let slots = &mut *guard;
            match outcome {
                Ok(value) => set(&mut slots.value, value),
                Err(message) => {
                    warn!(aggregate = %aggregate, fetch = %name, error = %message, "fetch failed");
                    slots.errors.push(FetchError { fetch: name, message });
                }
            }
        }));
        self
    }

    pub fn len(&self) -> usize {
        self.fetches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fetches.is_empty()
    }

    /// Run every fetch concurrently and wait for all of them, bounded by `ctx`.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn join(self, ctx: &Context) -> Result<Aggregated<S>, AggregateError<S>> {
        let started = Instant::now();
        let total = self.fetches.len();

        let mut set = JoinSet::new();
        for fetch in self.fetches {
            set.spawn(fetch);
        }

        let finished = ctx
            .run(async {
                while let Some(joined) = set.join_next().await {
                    // Fetch futures catch their own panics, so only aborts land here.
                    if let Err(e) = joined {
                        warn!(aggregate = %self.name, error = %e, "fetch task did not complete");
                    }
                }
            })
            .await;

        let pending = set.len();
        set.abort_all();

        let (value, errors) = {
            let mut slots = lock(&self.slots);
            (std::mem::take(&mut slots.value), std::mem::take(&mut slots.errors))
        };

        match finished {
            Ok(()) => {
                debug!(
                    aggregate = %self.name,
                    fetches = total,
                    failed = errors.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "aggregate joined"
                );
                Ok(Aggregated {
                    value,
                    errors,
                    elapsed: started.elapsed(),
                })
            }
            Err(reason) => {
                warn!(aggregate = %self.name, pending, error = %reason, "aggregate abandoned");
                let name = self.name;
                Err(match reason {
                    ContextError::DeadlineExceeded => AggregateError::DeadlineExceeded {
                        name,
                        pending,
                        partial: value,
                        errors,
                    },
                    ContextError::Cancelled => AggregateError::Cancelled {
                        name,
                        pending,
                        partial: value,
                        errors,
                    },
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq)]
    struct Dashboard {
        accounts: Option<u32>,
        alerts: Option<Vec<String>>,
        balance: Option<i64>,
    }

    #[tokio::test]
    async fn one_failing_fetch_is_recorded_and_others_populate() {
        let out = Aggregation::<Dashboard>::new("dashboard")
            .fetch("accounts", async { Ok(3u32) }, |s, v| s.accounts = Some(v))
            .fetch(
                "alerts",
                async { Err::<Vec<String>, _>(anyhow::anyhow!("alerts backend down")) },
                |s, v| s.alerts = Some(v),
            )
            .fetch("balance", async { Ok(1_250i64) }, |s, v| s.balance = Some(v))
            .join(&Context::with_timeout(Duration::from_secs(5)))
            .await
            .unwrap();

        assert!(!out.is_complete());
        assert_eq!(out.errors.len(), 1);
        assert_eq!(out.errors[0].fetch, "alerts");
        assert_eq!(out.value.accounts, Some(3));
        assert_eq!(out.value.balance, Some(1_250));
        assert_eq!(out.value.alerts, None);
    }

    #[tokio::test]
    async fn panicking_fetch_becomes_an_error() {
        let out = Aggregation::<Dashboard>::new("dashboard")
            .fetch(
                "accounts",
                async {
                    if true {
                        panic!("driver crashed");
                    }
                    Ok(0u32)
                },
                |s, v| s.accounts = Some(v),
            )
            .fetch("balance", async { Ok(7i64) }, |s, v| s.balance = Some(v))
            .join(&Context::background())
            .await
            .unwrap();

        assert_eq!(out.errors.len(), 1);
        assert!(out.errors[0].message.contains("driver crashed"));
        assert_eq!(out.value.balance, Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_keeps_finished_slots() {
        let err = Aggregation::<Dashboard>::new("dashboard")
            .fetch("accounts", async { Ok(1u32) }, |s, v| s.accounts = Some(v))
            .fetch(
                "balance",
                async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(0i64)
                },
                |s, v| s.balance = Some(v),
            )
            .join(&Context::with_timeout(Duration::from_millis(200)))
            .await
            .unwrap_err();

        match &err {
            AggregateError::DeadlineExceeded { pending, partial, .. } => {
                assert_eq!(*pending, 1);
                assert_eq!(partial.accounts, Some(1));
                assert_eq!(partial.balance, None);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.errors().is_empty());
    }

    #[tokio::test]
    async fn empty_aggregation_joins_immediately() {
        let out = Aggregation::<Dashboard>::new("empty")
            .join(&Context::background())
            .await
            .unwrap();
        assert!(out.is_complete());
        assert_eq!(out.value, Dashboard::default());
    }
}
