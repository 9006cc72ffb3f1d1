//! Push entry points over [`Observable`].
//!
//! Every subject dereferences to its [`Observable`], so `subscribe`,
//! `unsubscribe` and the operators are available directly on it.

use std::ops::Deref;

use crate::observable::{Observable, Replay};

macro_rules! impl_subject_common {
    ($name:ident) => {
        impl<T> Clone for $name<T> {
            fn clone(&self) -> Self {
                Self {
                    inner: self.inner.clone(),
                }
            }
        }

        impl<T> core::fmt::Debug for $name<T> {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.debug_tuple(stringify!($name)).field(&self.inner).finish()
            }
        }

        impl<T> Deref for $name<T> {
            type Target = Observable<T>;

            fn deref(&self) -> &Observable<T> {
                &self.inner
            }
        }

        impl<T> $name<T>
        where
            T: Clone + Send + Sync + 'static,
        {
            /// A read-only handle to this stream.
            pub fn observable(&self) -> Observable<T> {
                self.inner.clone()
            }
        }
    };
}

/// Delivers pushed values to current observers only.
pub struct Subject<T> {
    inner: Observable<T>,
}

impl_subject_common!(Subject);

impl<T> Subject<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Observable::with_replay(Replay::None),
        }
    }

    pub fn next(&self, value: T) {
        self.inner.push(value);
    }
}

impl<T> Default for Subject<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Remembers the latest value and hands it to every new subscriber.
pub struct BehaviorSubject<T> {
    inner: Observable<T>,
}

impl_subject_common!(BehaviorSubject);

impl<T> BehaviorSubject<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Starts without a current value; nothing is replayed until the first push.
    pub fn new() -> Self {
        Self {
            inner: Observable::with_replay(Replay::Latest),
        }
    }

    pub fn with_value(initial: T) -> Self {
        let subject = Self::new();
        subject.next(initial);
        subject
    }

    pub fn next(&self, value: T) {
        self.inner.push(value);
    }

    /// Current value, if one has been pushed.
    pub fn value(&self) -> Option<T> {
        self.inner.latest()
    }
}

impl<T> Default for BehaviorSubject<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Buffers the last `capacity` values and replays them, oldest first.
pub struct ReplaySubject<T> {
    inner: Observable<T>,
}

impl_subject_common!(ReplaySubject);

impl<T> ReplaySubject<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Observable::with_replay(Replay::Last(capacity)),
        }
    }

    pub fn next(&self, value: T) {
        self.inner.push(value);
    }

    /// Buffered values, oldest first.
    pub fn values(&self) -> Vec<T> {
        self.inner.replay_snapshot()
    }
}

/// Emits only its final value, and only after [`complete`](Self::complete).
///
/// Observers subscribing after completion receive the final value
/// immediately, until the subject is closed.
pub struct AsyncSubject<T> {
    inner: Observable<T>,
}

impl_subject_common!(AsyncSubject);

impl<T> AsyncSubject<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Observable::with_replay(Replay::Final),
        }
    }

    /// Record `value` as the candidate final value. Ignored once completed.
    pub fn next(&self, value: T) {
        self.inner.push(value);
    }

    pub fn complete(&self) {
        self.inner.complete();
    }

    pub fn is_completed(&self) -> bool {
        self.inner.is_completed()
    }
}

impl<T> Default for AsyncSubject<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
