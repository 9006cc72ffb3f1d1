//! Live budget streams fed by mutation events.
//!
//! Mirrors every budgeting mutation into subjects that analytics or a
//! server-push endpoint can observe without re-querying storage.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use budget_core::{BudgetTotals, Expense};
use budget_events::{BudgetEvent, Event, EventBus, HandlerId, handler_fn};
use budget_reactive::{BehaviorSubject, ReplaySubject};

pub const DEFAULT_REPLAY_CAPACITY: usize = 100;

enum Emission {
    Expense(Expense),
    Totals(BudgetTotals),
    Change(BudgetEvent),
}

#[derive(Default)]
struct Running {
    totals: BudgetTotals,
    outbox: VecDeque<Emission>,
    draining: bool,
}

struct StreamsInner {
    changes: ReplaySubject<BudgetEvent>,
    latest_expense: BehaviorSubject<Expense>,
    totals: BehaviorSubject<BudgetTotals>,
    running: Mutex<Running>,
}

/// Subjects mirroring budget mutations.
///
/// Cloning yields another handle to the same subjects.
#[derive(Clone)]
pub struct BudgetStreams {
    inner: Arc<StreamsInner>,
}

impl Default for BudgetStreams {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_CAPACITY)
    }
}

fn apply(totals: &mut BudgetTotals, event: &BudgetEvent) {
    match event {
        BudgetEvent::IncomeSourceCreated(r) => totals.income_cents += r.amount_cents,
        BudgetEvent::IncomeSourceUpdated(c) => {
            totals.income_cents += c.current.amount_cents - c.previous.amount_cents;
        }
        BudgetEvent::IncomeSourceDeleted(r) => totals.income_cents -= r.amount_cents,
        BudgetEvent::BudgetSourceCreated(r) => totals.budgeted_cents += r.allocated_cents,
        BudgetEvent::BudgetSourceUpdated(c) => {
            totals.budgeted_cents += c.current.allocated_cents - c.previous.allocated_cents;
        }
        BudgetEvent::BudgetSourceDeleted(r) => totals.budgeted_cents -= r.allocated_cents,
        BudgetEvent::ExpenseCreated(r) => totals.spent_cents += r.amount_cents,
        BudgetEvent::ExpenseUpdated(c) => {
            totals.spent_cents += c.current.amount_cents - c.previous.amount_cents;
        }
        BudgetEvent::ExpenseDeleted(r) => totals.spent_cents -= r.amount_cents,
    }
}

impl BudgetStreams {
    /// `replay_capacity` bounds how many recent changes late subscribers see.
    pub fn new(replay_capacity: usize) -> Self {
        Self {
            inner: Arc::new(StreamsInner {
                changes: ReplaySubject::new(replay_capacity),
                latest_expense: BehaviorSubject::new(),
                totals: BehaviorSubject::with_value(BudgetTotals::default()),
                running: Mutex::new(Running::default()),
            }),
        }
    }

    /// Every recorded mutation, replaying the most recent ones on subscribe.
    pub fn changes(&self) -> &ReplaySubject<BudgetEvent> {
        &self.inner.changes
    }

    /// The most recently created or updated expense.
    pub fn latest_expense(&self) -> &BehaviorSubject<Expense> {
        &self.inner.latest_expense
    }

    pub fn totals(&self) -> &BehaviorSubject<BudgetTotals> {
        &self.inner.totals
    }

    /// Apply `event` to the running totals and push it to the subjects.
    ///
    /// Pushes are queued in the order events are applied and sent with no
    /// lock held, so observers may call `snapshot` or `record`. A `record`
    /// racing another one, or made from an observer, returns once its pushes
    /// are queued; the caller already sending delivers them.
    pub fn record(&self, event: BudgetEvent) {
        let drain = {
            let mut running = self.lock_running();
            let running = &mut *running;
            apply(&mut running.totals, &event);
            match &event {
                BudgetEvent::ExpenseCreated(expense) => {
                    running.outbox.push_back(Emission::Expense(expense.clone()));
                }
                BudgetEvent::ExpenseUpdated(change) => {
                    running.outbox.push_back(Emission::Expense(change.current.clone()));
                }
                _ => {}
            }
            running.outbox.push_back(Emission::Totals(running.totals));
            running.outbox.push_back(Emission::Change(event));
            !std::mem::replace(&mut running.draining, true)
        };
        if drain {
            self.drain();
        }
    }

    fn drain(&self) {
        loop {
            let next = {
                let mut running = self.lock_running();
                match running.outbox.pop_front() {
                    Some(emission) => emission,
                    None => {
                        running.draining = false;
                        return;
                    }
                }
            };
            match next {
                Emission::Expense(expense) => self.inner.latest_expense.next(expense),
                Emission::Totals(totals) => self.inner.totals.next(totals),
                Emission::Change(event) => self.inner.changes.next(event),
            }
        }
    }

    /// Current running totals. Includes records whose pushes are still queued.
    pub fn snapshot(&self) -> BudgetTotals {
        self.lock_running().totals
    }

    /// Subscribe to every budgeting event type on `bus` and record what arrives.
    pub fn attach(&self, bus: &EventBus) -> Vec<HandlerId> {
        let streams = self.clone();
        let handler = handler_fn("budget-streams", move |event: Event| {
            let streams = streams.clone();
            async move {
                let decoded = BudgetEvent::from_event(&event)?;
                streams.record(decoded);
                Ok::<(), anyhow::Error>(())
            }
        });

        let ids: Vec<HandlerId> = BudgetEvent::PATTERNS
            .iter()
            .map(|pattern| bus.subscribe(pattern, Arc::clone(&handler)))
            .collect();
        debug!(handlers = ids.len(), "budget streams attached to bus");
        ids
    }

    /// Close every subject. Later records update the totals snapshot only.
    pub fn close(&self) {
        self.inner.changes.close();
        self.inner.latest_expense.close();
        self.inner.totals.close();
    }

    fn lock_running(&self) -> MutexGuard<'_, Running> {
        self.inner.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for BudgetStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetStreams")
            .field("totals", &self.snapshot())
            .finish()
    }
}
