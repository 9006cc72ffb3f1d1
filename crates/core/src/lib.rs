//! `budget-core`: shared building blocks for the budgeting runtime.
//!
//! This crate holds the primitives every other crate agrees on: identifiers,
//! the core error model, the deadline-bearing [`Context`] token, and the
//! budgeting records that cross the boundary between request handlers and
//! the concurrent core.

pub mod budget;
pub mod context;
pub mod error;
pub mod id;
pub mod panic;

pub use budget::{BudgetSource, BudgetTotals, Expense, IncomeSource, Period};
pub use context::{Context, ContextError};
pub use error::{CoreError, CoreResult};
pub use id::{BudgetSourceId, EventId, ExpenseId, IncomeSourceId, JobId, TaskId};
pub use panic::panic_message;
