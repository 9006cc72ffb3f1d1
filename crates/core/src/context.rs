//! Deadline-bearing cancellation context.
//!
//! Every blocking entry point of the runtime (pool submission, result waits,
//! aggregate joins, bus publication) takes a [`Context`]. A context is done
//! once it is cancelled explicitly or once its deadline passes; after that,
//! blocking calls return [`ContextError`] instead of waiting.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a context is done.
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("context cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// A cancellable handle carrying an optional expiry time.
///
/// Cloning is cheap; clones share the same cancellation state.
#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that never expires and is only done when cancelled.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// A context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// Derive a child that is cancelled with its parent.
    ///
    /// The child's deadline is the earlier of the parent's deadline and
    /// `timeout` from now.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) if parent < candidate => parent,
            _ => candidate,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Derive a child that is cancelled with its parent and keeps its deadline.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn has_deadline(&self) -> bool {
        self.deadline.is_some()
    }

    /// Time left before the deadline (zero once expired).
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// `Some` once the context is done.
    pub fn err(&self) -> Option<ContextError> {
        if self.token.is_cancelled() {
            return Some(ContextError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolve once the context is done.
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => ContextError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                ContextError::Cancelled
            }
        }
    }

    /// Drive `fut` to completion unless the context finishes first.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, ContextError>
    where
        F: Future,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            out = fut => Ok(out),
            err = self.done() => Err(err),
        }
    }

    /// Underlying token, for handing to work that polls cancellation itself.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn background_is_not_done_until_cancelled() {
        let ctx = Context::background();
        assert!(ctx.err().is_none());
        assert!(ctx.remaining().is_none());

        ctx.cancel();
        assert_eq!(ctx.err(), Some(ContextError::Cancelled));
        assert_eq!(ctx.done().await, ContextError::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_expires() {
        let ctx = Context::with_timeout(Duration::from_millis(50));
        assert!(!ctx.is_done());

        assert_eq!(ctx.done().await, ContextError::DeadlineExceeded);
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn child_takes_the_earlier_deadline() {
        let parent = Context::with_timeout(Duration::from_millis(10));
        let child = parent.child_with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());

        let parent = Context::background();
        let child = parent.child_with_timeout(Duration::from_millis(10));
        assert!(child.deadline().is_some());
        assert!(parent.deadline().is_none());
    }

    #[tokio::test]
    async fn cancelling_parent_cancels_child() {
        let parent = Context::background();
        let child = parent.child();
        parent.cancel();
        assert_eq!(child.err(), Some(ContextError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn run_returns_deadline_error_for_slow_future() {
        let ctx = Context::with_timeout(Duration::from_millis(20));
        let out = ctx
            .run(tokio::time::sleep(Duration::from_secs(5)))
            .await;
        assert_eq!(out, Err(ContextError::DeadlineExceeded));

        let ctx = Context::with_timeout(Duration::from_secs(5));
        let out = ctx.run(async { 7 }).await;
        assert_eq!(out, Ok(7));
    }
}
