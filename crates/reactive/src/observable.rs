//! Observer registry shared by every stream type.
//!
//! State machine: `open -> closed`, one-way. Closing notifies each observer's
//! completion callback once and drops the registry; pushes and subscriptions
//! on a closed stream are ignored.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use budget_core::panic_message;

use crate::observer::Observer;

/// What a stream remembers for late subscribers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Replay {
    None,
    Latest,
    Last(usize),
    /// Withhold everything until completion, then replay the final value.
    Final,
}

enum Memory<T> {
    None,
    Latest(Option<T>),
    Last { capacity: usize, values: VecDeque<T> },
    Final { last: Option<T>, completed: bool },
}

impl<T: Clone> Memory<T> {
    fn new(replay: Replay) -> Self {
        match replay {
            Replay::None => Self::None,
            Replay::Latest => Self::Latest(None),
            Replay::Last(capacity) => Self::Last {
                capacity,
                values: VecDeque::with_capacity(capacity),
            },
            Replay::Final => Self::Final {
                last: None,
                completed: false,
            },
        }
    }

    /// Remember `value`; returns whether it should be delivered now.
    fn record(&mut self, value: &T) -> bool {
        match self {
            Self::None => true,
            Self::Latest(slot) => {
                *slot = Some(value.clone());
                true
            }
            Self::Last { capacity, values } => {
                values.push_back(value.clone());
                while values.len() > *capacity {
                    values.pop_front();
                }
                true
            }
            Self::Final { last, completed } => {
                if !*completed {
                    *last = Some(value.clone());
                }
                false
            }
        }
    }

    fn replay(&self) -> Vec<T> {
        match self {
            Self::None => Vec::new(),
            Self::Latest(slot) => slot.iter().cloned().collect(),
            Self::Last { values, .. } => values.iter().cloned().collect(),
            Self::Final { last, completed } if *completed => last.iter().cloned().collect(),
            Self::Final { .. } => Vec::new(),
        }
    }

    fn is_completed(&self) -> bool {
        matches!(self, Self::Final { completed: true, .. })
    }
}

type Targets<T> = Vec<(String, Observer<T>)>;

/// One queued unit of observer work, delivered in enqueue order.
enum Delivery<T> {
    Next { targets: Targets<T>, value: T },
    Replay { id: String, observer: Observer<T>, values: Vec<T>, complete: bool },
    Complete { targets: Targets<T>, last: Option<T> },
}

impl<T> Delivery<T> {
    fn run(self) {
        match self {
            Self::Next { targets, value } => {
                for (id, observer) in &targets {
                    deliver(id, observer, &value);
                }
            }
            Self::Replay {
                id,
                observer,
                values,
                complete,
            } => {
                for value in &values {
                    deliver(&id, &observer, value);
                }
                if complete {
                    notify_complete(&id, &observer);
                }
            }
            Self::Complete { targets, last } => {
                for (id, observer) in &targets {
                    if let Some(value) = &last {
                        deliver(id, observer, value);
                    }
                    notify_complete(id, observer);
                }
            }
        }
    }
}

type Detach = Box<dyn FnOnce() + Send>;

struct State<T> {
    observers: Targets<T>,
    closed: bool,
    memory: Memory<T>,
    pending: VecDeque<Delivery<T>>,
    emitting: bool,
    /// Unsubscribes this stream from the sources an operator built it from.
    upstream: Vec<Detach>,
}

struct Shared<T> {
    replay: Replay,
    state: Mutex<State<T>>,
}

/// A stream of `T` values delivered to registered observers.
///
/// Cloning yields another handle to the same stream.
pub struct Observable<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> core::fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Observable")
            .field("replay", &self.shared.replay)
            .field("observers", &state.observers.len())
            .field("closed", &state.closed)
            .finish()
    }
}

static OPERATOR_ID: AtomicU64 = AtomicU64::new(1);

/// Unique observer key for operator-internal subscriptions.
fn operator_id(kind: &str) -> String {
    format!("{kind}#{}", OPERATOR_ID.fetch_add(1, Ordering::Relaxed))
}

fn deliver<T>(id: &str, observer: &Observer<T>, value: &T) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| (observer.next)(value))) {
        warn!(observer = id, error = %panic_message(panic.as_ref()), "observer panicked");
    }
}

fn notify_complete<T>(id: &str, observer: &Observer<T>) {
    if let Some(complete) = &observer.complete {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| complete())) {
            warn!(observer = id, error = %panic_message(panic.as_ref()), "observer panicked on completion");
        }
    }
}

fn run_detach(detach: Vec<Detach>) {
    for unlink in detach {
        unlink();
    }
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn with_replay(replay: Replay) -> Self {
        Self {
            shared: Arc::new(Shared {
                replay,
                state: Mutex::new(State {
                    observers: Vec::new(),
                    closed: false,
                    memory: Memory::new(replay),
                    pending: VecDeque::new(),
                    emitting: false,
                    upstream: Vec::new(),
                }),
            }),
        }
    }

    /// A fresh, open stream with the same replay behaviour as `self`.
    pub(crate) fn derive<U>(&self) -> Observable<U>
    where
        U: Clone + Send + Sync + 'static,
    {
        Observable::with_replay(self.shared.replay)
    }

    // Observer callbacks never run under this lock.
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `delivery` and, unless another caller is already emitting on
    /// this stream, drain the queue on the current thread.
    fn enqueue(&self, mut state: MutexGuard<'_, State<T>>, delivery: Delivery<T>) {
        state.pending.push_back(delivery);
        if std::mem::replace(&mut state.emitting, true) {
            return;
        }
        drop(state);
        loop {
            let next = {
                let mut state = self.lock();
                match state.pending.pop_front() {
                    Some(delivery) => delivery,
                    None => {
                        state.emitting = false;
                        return;
                    }
                }
            };
            next.run();
        }
    }

    /// Register `next` under `id`, replacing any observer already using `id`.
    ///
    /// The observer receives the replayed values before any later push. They
    /// are delivered before this returns unless another thread is mid-delivery
    /// on the stream (or this is called from one of its observers), in which
    /// case they follow the deliveries already queued.
    /// Returns `false` (and registers nothing) if the stream is closed.
    pub fn subscribe<F>(&self, id: impl Into<String>, next: F) -> bool
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.subscribe_observer(id, Observer::new(next))
    }

    pub fn subscribe_observer(&self, id: impl Into<String>, observer: Observer<T>) -> bool {
        let id = id.into();
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.closed {
            return false;
        }
        let values = state.memory.replay();
        let complete = state.memory.is_completed();
        // A completed stream has nothing further to send; the observer
        // gets the replay and its completion callback, and is not kept.
        if !complete {
            match state.observers.iter_mut().find(|(key, _)| *key == id) {
                Some(slot) => slot.1 = observer.clone(),
                None => state.observers.push((id.clone(), observer.clone())),
            }
        }
        if values.is_empty() && !complete {
            return true;
        }
        self.enqueue(
            guard,
            Delivery::Replay {
                id,
                observer,
                values,
                complete,
            },
        );
        true
    }

    /// Remove the observer registered under `id`; no-op if absent.
    ///
    /// Deliveries already queued for it may still arrive.
    pub fn unsubscribe(&self, id: &str) -> bool {
        let mut state = self.lock();
        let before = state.observers.len();
        state.observers.retain(|(key, _)| key != id);
        state.observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.lock().observers.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub(crate) fn push(&self, value: T) {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.closed || !state.memory.record(&value) || state.observers.is_empty() {
            return;
        }
        let targets = state.observers.clone();
        self.enqueue(guard, Delivery::Next { targets, value });
    }

    /// Close the stream: observers are notified of completion and dropped;
    /// later pushes are ignored. Terminal and idempotent.
    ///
    /// Closing a stream returned by an operator also unsubscribes it from
    /// its sources, which is how a derived stream is released before its
    /// sources end.
    pub fn close(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        let upstream = std::mem::take(&mut state.upstream);
        let targets = std::mem::take(&mut state.observers);
        debug!(observers = targets.len(), "stream closed");
        self.enqueue(state, Delivery::Complete { targets, last: None });
        run_detach(upstream);
    }

    /// Release the withheld final value (final-value streams only) and
    /// complete the current observers. Later subscribers still receive the
    /// final value until the stream is closed.
    pub(crate) fn complete(&self) {
        if self.shared.replay != Replay::Final {
            self.close();
            return;
        }
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.closed {
            return;
        }
        let Memory::Final { last, completed } = &mut state.memory else {
            return;
        };
        if *completed {
            return;
        }
        *completed = true;
        let last = last.clone();
        let upstream = std::mem::take(&mut state.upstream);
        let targets = std::mem::take(&mut state.observers);
        self.enqueue(guard, Delivery::Complete { targets, last });
        run_detach(upstream);
    }

    /// Propagate upstream completion: completes final-value streams, closes
    /// the rest.
    pub(crate) fn finish(&self) {
        match self.shared.replay {
            Replay::Final => self.complete(),
            _ => self.close(),
        }
    }

    /// Subscribe `observer` to `self` under a generated id and tie it to
    /// `dest`: once `dest` is closed or completed the subscription is
    /// removed. Returns `false` if `self` was already closed; a `dest` that
    /// is already finished is left alone and nothing is subscribed.
    pub(crate) fn link<U>(&self, kind: &str, dest: &Observable<U>, observer: Observer<T>) -> bool
    where
        U: Clone + Send + Sync + 'static,
    {
        let id = operator_id(kind);
        // Weak, so a live source does not keep an abandoned chain alive
        // through its own observer.
        let source = Arc::downgrade(&self.shared);
        let key = id.clone();
        let unlink: Detach = Box::new(move || {
            if let Some(shared) = source.upgrade() {
                Observable { shared }.unsubscribe(&key);
            }
        });
        {
            let mut state = dest.lock();
            if state.closed || state.memory.is_completed() {
                return true;
            }
            state.upstream.push(unlink);
        }
        self.subscribe_observer(id, observer)
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.lock().memory.is_completed()
    }

    /// Values a new subscriber would receive right now.
    pub(crate) fn replay_snapshot(&self) -> Vec<T> {
        self.lock().memory.replay()
    }

    pub(crate) fn latest(&self) -> Option<T> {
        match &self.lock().memory {
            Memory::Latest(slot) => slot.clone(),
            Memory::Last { values, .. } => values.back().cloned(),
            Memory::Final { last, .. } => last.clone(),
            Memory::None => None,
        }
    }
}
