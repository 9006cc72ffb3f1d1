//! Minimal push-based reactive streams.
//!
//! An [`Observable`] is a registry of named observers plus an open/closed
//! state. Subjects add a push entry point and differ only in what a late
//! subscriber receives:
//!
//! | type | replayed on subscribe |
//! |---|---|
//! | [`Subject`] | nothing |
//! | [`BehaviorSubject`] | the latest value |
//! | [`ReplaySubject`] | the last *k* values, in order |
//! | [`AsyncSubject`] | the final value, once completed |
//!
//! Operators (`map`, `filter`, `debounce`, `throttle`, [`merge`],
//! [`combine_latest`]) subscribe to a source and push onto a fresh
//! observable.
//!
//! Each stream delivers in push order. Deliveries are queued per stream and
//! run by whichever caller finds the stream idle, with no lock held, so an
//! uncontended push is delivered before it returns and a push made from an
//! observer callback (or racing on another thread) waits its turn instead of
//! overtaking. Each observer is called independently: a panicking observer
//! is logged and skipped, the rest still receive the value.

pub mod observable;
pub mod observer;
pub mod operators;
pub mod subject;

pub use observable::Observable;
pub use observer::Observer;
pub use operators::{combine_latest, merge};
pub use subject::{AsyncSubject, BehaviorSubject, ReplaySubject, Subject};
