//! Typed budgeting events emitted by the surrounding application after a
//! mutation has been persisted.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use budget_core::{BudgetSource, Expense, IncomeSource};

use crate::error::EventDecodeError;
use crate::event::{DomainEvent, Event};

/// Before/after pair carried by update events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change<T> {
    pub previous: T,
    pub current: T,
}

/// Mutation results of the budgeting records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BudgetEvent {
    IncomeSourceCreated(IncomeSource),
    IncomeSourceUpdated(Change<IncomeSource>),
    IncomeSourceDeleted(IncomeSource),
    BudgetSourceCreated(BudgetSource),
    BudgetSourceUpdated(Change<BudgetSource>),
    BudgetSourceDeleted(BudgetSource),
    ExpenseCreated(Expense),
    ExpenseUpdated(Change<Expense>),
    ExpenseDeleted(Expense),
}

impl BudgetEvent {
    /// Type patterns covering every budgeting event, for bus subscriptions.
    pub const PATTERNS: [&'static str; 3] = ["income_source.*", "budget_source.*", "expense.*"];

    /// Rebuild the typed payload from a bus event.
    pub fn from_event(event: &Event) -> Result<Self, EventDecodeError> {
        let ev = match event.event_type() {
            "income_source.created" => Self::IncomeSourceCreated(event.decode()?),
            "income_source.updated" => Self::IncomeSourceUpdated(event.decode()?),
            "income_source.deleted" => Self::IncomeSourceDeleted(event.decode()?),
            "budget_source.created" => Self::BudgetSourceCreated(event.decode()?),
            "budget_source.updated" => Self::BudgetSourceUpdated(event.decode()?),
            "budget_source.deleted" => Self::BudgetSourceDeleted(event.decode()?),
            "expense.created" => Self::ExpenseCreated(event.decode()?),
            "expense.updated" => Self::ExpenseUpdated(event.decode()?),
            "expense.deleted" => Self::ExpenseDeleted(event.decode()?),
            other => return Err(EventDecodeError::UnknownType(other.to_string())),
        };
        Ok(ev)
    }
}

impl DomainEvent for BudgetEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::IncomeSourceCreated(_) => "income_source.created",
            Self::IncomeSourceUpdated(_) => "income_source.updated",
            Self::IncomeSourceDeleted(_) => "income_source.deleted",
            Self::BudgetSourceCreated(_) => "budget_source.created",
            Self::BudgetSourceUpdated(_) => "budget_source.updated",
            Self::BudgetSourceDeleted(_) => "budget_source.deleted",
            Self::ExpenseCreated(_) => "expense.created",
            Self::ExpenseUpdated(_) => "expense.updated",
            Self::ExpenseDeleted(_) => "expense.deleted",
        }
    }

    // The type tag already names the variant, so only the record is sent.
    fn to_data(&self) -> Result<JsonValue, serde_json::Error> {
        match self {
            Self::IncomeSourceCreated(r) | Self::IncomeSourceDeleted(r) => serde_json::to_value(r),
            Self::IncomeSourceUpdated(c) => serde_json::to_value(c),
            Self::BudgetSourceCreated(r) | Self::BudgetSourceDeleted(r) => serde_json::to_value(r),
            Self::BudgetSourceUpdated(c) => serde_json::to_value(c),
            Self::ExpenseCreated(r) | Self::ExpenseDeleted(r) => serde_json::to_value(r),
            Self::ExpenseUpdated(c) => serde_json::to_value(c),
        }
    }
}
