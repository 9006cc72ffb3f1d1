//! Stream-to-stream operators.
//!
//! Each operator subscribes to its source under a generated observer id and
//! pushes onto a fresh observable with the source's replay behaviour. When the
//! source completes or closes, so does the destination. Closing the
//! destination removes its subscriptions from the sources; until then a
//! long-lived source keeps every derived stream attached.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::trace;

use crate::observable::{Observable, Replay};
use crate::observer::Observer;

enum Signal<T> {
    Next(T),
    Complete,
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn forward<U, F>(&self, kind: &str, dest: &Observable<U>, on_next: F)
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let done = dest.clone();
        let observer = Observer::new(on_next).with_complete(move || done.finish());
        if !self.link(kind, dest, observer) {
            dest.finish();
        }
    }

    pub fn map<U, F>(&self, f: F) -> Observable<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        let dest = self.derive::<U>();
        let out = dest.clone();
        self.forward("map", &dest, move |value| out.push(f(value)));
        dest
    }

    pub fn filter<F>(&self, predicate: F) -> Observable<T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let dest = self.derive::<T>();
        let out = dest.clone();
        self.forward("filter", &dest, move |value| {
            if predicate(value) {
                out.push(value.clone());
            }
        });
        dest
    }

    /// Emit a value only once `period` has passed without a newer one.
    ///
    /// A pending value is flushed when the source completes. The timer runs
    /// on a spawned task, so this must be called inside a Tokio runtime; the
    /// task ends when the source completes or the returned stream is closed.
    pub fn debounce(&self, period: Duration) -> Observable<T> {
        let dest = self.derive::<T>();
        let (tx, mut rx) = mpsc::unbounded_channel::<Signal<T>>();

        let out = dest.clone();
        tokio::spawn(async move {
            let mut pending: Option<T> = None;
            loop {
                let signal = if pending.is_some() {
                    match tokio::time::timeout(period, rx.recv()).await {
                        Ok(signal) => signal,
                        Err(_) => {
                            if let Some(value) = pending.take() {
                                out.push(value);
                            }
                            continue;
                        }
                    }
                } else {
                    rx.recv().await
                };

                match signal {
                    Some(Signal::Next(value)) => pending = Some(value),
                    Some(Signal::Complete) | None => {
                        if let Some(value) = pending.take() {
                            out.push(value);
                        }
                        out.finish();
                        break;
                    }
                }
            }
            trace!("debounce task finished");
        });

        let next_tx = tx.clone();
        let observer = Observer::new(move |value: &T| {
            let _ = next_tx.send(Signal::Next(value.clone()));
        })
        .with_complete(move || {
            let _ = tx.send(Signal::Complete);
        });
        if !self.link("debounce", &dest, observer) {
            dest.finish();
        }
        dest
    }

    /// Emit the first value of each `period` window and drop the rest.
    pub fn throttle(&self, period: Duration) -> Observable<T> {
        let dest = self.derive::<T>();
        let out = dest.clone();
        let last_emit: Mutex<Option<Instant>> = Mutex::new(None);
        self.forward("throttle", &dest, move |value| {
            let now = Instant::now();
            let emit = {
                let mut last = last_emit.lock().unwrap_or_else(PoisonError::into_inner);
                match *last {
                    Some(at) if now.duration_since(at) < period => false,
                    _ => {
                        *last = Some(now);
                        true
                    }
                }
            };
            if emit {
                out.push(value.clone());
            }
        });
        dest
    }
}

/// Interleave several sources into one stream, in arrival order.
///
/// The result completes once every source has completed. With no sources the
/// returned stream is already closed.
pub fn merge<T>(sources: &[&Observable<T>]) -> Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    let Some(first) = sources.first() else {
        let empty = Observable::with_replay(Replay::None);
        empty.close();
        return empty;
    };

    let dest = first.derive::<T>();
    let remaining = Arc::new(AtomicUsize::new(sources.len()));
    for source in sources {
        let out = dest.clone();
        let done = dest.clone();
        let left = Arc::clone(&remaining);
        let observer = Observer::new(move |value: &T| out.push(value.clone())).with_complete(move || {
            if left.fetch_sub(1, Ordering::AcqRel) == 1 {
                done.finish();
            }
        });
        if !source.link("merge", &dest, observer)
            && remaining.fetch_sub(1, Ordering::AcqRel) == 1
        {
            dest.finish();
        }
    }
    dest
}

struct Latest<A, B> {
    a: Option<A>,
    b: Option<B>,
}

/// Emit `combiner(a, b)` whenever either side pushes, once both have a value.
///
/// Completes when both sources have completed.
pub fn combine_latest<A, B, R, F>(a: &Observable<A>, b: &Observable<B>, combiner: F) -> Observable<R>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    F: Fn(&A, &B) -> R + Send + Sync + 'static,
{
    let dest = a.derive::<R>();
    let latest = Arc::new(Mutex::new(Latest { a: None, b: None }));
    let combiner = Arc::new(combiner);
    let remaining = Arc::new(AtomicUsize::new(2));

    let completion = |dest: &Observable<R>, remaining: &Arc<AtomicUsize>| {
        let done = dest.clone();
        let left = Arc::clone(remaining);
        move || {
            if left.fetch_sub(1, Ordering::AcqRel) == 1 {
                done.finish();
            }
        }
    };

    let on_a = {
        let latest = Arc::clone(&latest);
        let combiner = Arc::clone(&combiner);
        let out = dest.clone();
        move |value: &A| {
            let pair = {
                let mut state = latest.lock().unwrap_or_else(PoisonError::into_inner);
                state.a = Some(value.clone());
                state.b.clone().map(|b| (value.clone(), b))
            };
            if let Some((a, b)) = pair {
                out.push(combiner(&a, &b));
            }
        }
    };
    let on_b = {
        let latest = Arc::clone(&latest);
        let combiner = Arc::clone(&combiner);
        let out = dest.clone();
        move |value: &B| {
            let pair = {
                let mut state = latest.lock().unwrap_or_else(PoisonError::into_inner);
                state.b = Some(value.clone());
                state.a.clone().map(|a| (a, value.clone()))
            };
            if let Some((a, b)) = pair {
                out.push(combiner(&a, &b));
            }
        }
    };

    let a_subscribed = a.link(
        "combine_latest",
        &dest,
        Observer::new(on_a).with_complete(completion(&dest, &remaining)),
    );
    if !a_subscribed {
        completion(&dest, &remaining)();
    }
    let b_subscribed = b.link(
        "combine_latest",
        &dest,
        Observer::new(on_b).with_complete(completion(&dest, &remaining)),
    );
    if !b_subscribed {
        completion(&dest, &remaining)();
    }
    dest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BehaviorSubject, Subject};

    fn recorder<T: Clone + Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(&T) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |v: &T| sink.lock().unwrap().push(v.clone()))
    }

    #[test]
    fn map_and_filter_chain() {
        let subject = Subject::<i32>::new();
        let evens_doubled = subject.filter(|v: &i32| v % 2 == 0).map(|v| v * 10);
        let (seen, f) = recorder::<i32>();
        evens_doubled.subscribe("sink", f);

        for v in 1..=6 {
            subject.next(v);
        }
        assert_eq!(*seen.lock().unwrap(), vec![20, 40, 60]);

        subject.close();
        assert!(evens_doubled.is_closed());
    }

    #[test]
    fn map_keeps_behavior_replay() {
        let subject = BehaviorSubject::with_value(3);
        let labels = subject.map(|v: &i32| format!("#{v}"));
        let (seen, f) = recorder::<String>();
        labels.subscribe("late", f);
        assert_eq!(*seen.lock().unwrap(), vec!["#3".to_string()]);
    }

    #[test]
    fn combine_latest_waits_for_both_sides() {
        let a = Subject::<i32>::new();
        let b = Subject::<i32>::new();
        let combined = combine_latest(&a.observable(), &b.observable(), |x: &i32, y: &i32| x + y * 100);
        let (seen, f) = recorder::<i32>();
        combined.subscribe("sink", f);

        a.next(1);
        assert!(seen.lock().unwrap().is_empty());

        b.next(2);
        assert_eq!(*seen.lock().unwrap(), vec![201]);

        a.next(5);
        assert_eq!(*seen.lock().unwrap(), vec![201, 205]);

        a.close();
        assert!(!combined.is_closed());
        b.close();
        assert!(combined.is_closed());
    }

    #[test]
    fn merge_interleaves_and_completes_after_all_sources() {
        let a = Subject::<&str>::new();
        let b = Subject::<&str>::new();
        let merged = merge(&[&a.observable(), &b.observable()]);
        let (seen, f) = recorder::<&str>();
        merged.subscribe("sink", f);

        a.next("a1");
        b.next("b1");
        a.next("a2");
        a.close();
        assert!(!merged.is_closed());
        b.next("b2");
        b.close();

        assert_eq!(*seen.lock().unwrap(), vec!["a1", "b1", "a2", "b2"]);
        assert!(merged.is_closed());
    }

    #[test]
    fn merge_of_nothing_is_closed() {
        let merged = merge::<i32>(&[]);
        assert!(merged.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_emits_only_last_of_burst() {
        let period = Duration::from_millis(100);
        let subject = Subject::<i32>::new();
        let debounced = subject.debounce(period);
        let (seen, f) = recorder::<i32>();
        debounced.subscribe("sink", f);

        for v in 0..100 {
            subject.next(v);
            tokio::time::sleep(period / 10).await;
        }
        assert!(seen.lock().unwrap().is_empty());

        tokio::time::sleep(period * 2).await;
        assert_eq!(*seen.lock().unwrap(), vec![99]);
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_flushes_pending_value_on_close() {
        let subject = Subject::<i32>::new();
        let debounced = subject.debounce(Duration::from_secs(5));
        let (seen, f) = recorder::<i32>();
        debounced.subscribe("sink", f);

        subject.next(1);
        subject.next(2);
        subject.close();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(*seen.lock().unwrap(), vec![2]);
        assert!(debounced.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn closing_debounced_stream_releases_source() {
        let subject = Subject::<i32>::new();
        let debounced = subject.debounce(Duration::from_millis(100));
        let doubled = subject.map(|v: &i32| v * 2);
        assert_eq!(subject.observer_count(), 2);

        debounced.close();
        doubled.close();
        assert_eq!(subject.observer_count(), 0);

        subject.next(1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!subject.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_keeps_leading_value_per_window() {
        let period = Duration::from_millis(100);
        let subject = Subject::<i32>::new();
        let throttled = subject.throttle(period);
        let (seen, f) = recorder::<i32>();
        throttled.subscribe("sink", f);

        subject.next(1);
        subject.next(2);
        tokio::time::advance(Duration::from_millis(50)).await;
        subject.next(3);
        tokio::time::advance(Duration::from_millis(60)).await;
        subject.next(4);
        subject.next(5);

        assert_eq!(*seen.lock().unwrap(), vec![1, 4]);
    }
}
