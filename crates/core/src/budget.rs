//! Budgeting records exchanged with the surrounding application.
//!
//! Persistence and HTTP handling live outside this workspace; these types are
//! only the shape of what crosses into the concurrent core (aggregated
//! monthly reads, mutation events, live streams). Amounts are integer cents.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::id::{BudgetSourceId, ExpenseId, IncomeSourceId};

/// A calendar month, the unit of the monthly summary view.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Period {
    year: i32,
    month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> CoreResult<Self> {
        if !(1..=12).contains(&month) {
            return Err(CoreError::validation(format!(
                "month must be within 1..=12, got {month}"
            )));
        }
        Ok(Self { year, month })
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for Period {
    type Err = CoreError;

    /// Parses `YYYY-MM`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (year, month) = s
            .split_once('-')
            .ok_or_else(|| CoreError::validation(format!("expected YYYY-MM, got {s:?}")))?;
        let year = year
            .parse::<i32>()
            .map_err(|e| CoreError::validation(format!("year: {e}")))?;
        let month = month
            .parse::<u32>()
            .map_err(|e| CoreError::validation(format!("month: {e}")))?;
        Self::new(year, month)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomeSource {
    pub id: IncomeSourceId,
    pub name: String,
    pub amount_cents: i64,
    pub period: Period,
}

/// An allocation of money to a spending category for one period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetSource {
    pub id: BudgetSourceId,
    pub name: String,
    pub allocated_cents: i64,
    pub period: Period,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expense {
    pub id: ExpenseId,
    pub description: String,
    pub amount_cents: i64,
    /// Budget source the expense is charged against, if categorised.
    pub budget_source_id: Option<BudgetSourceId>,
    pub period: Period,
    pub spent_at: DateTime<Utc>,
}

/// Running totals over one or more periods, in cents.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetTotals {
    pub income_cents: i64,
    pub budgeted_cents: i64,
    pub spent_cents: i64,
}

impl BudgetTotals {
    pub fn from_records<'a>(
        income: impl IntoIterator<Item = &'a IncomeSource>,
        budgets: impl IntoIterator<Item = &'a BudgetSource>,
        expenses: impl IntoIterator<Item = &'a Expense>,
    ) -> Self {
        Self {
            income_cents: income.into_iter().map(|i| i.amount_cents).sum(),
            budgeted_cents: budgets.into_iter().map(|b| b.allocated_cents).sum(),
            spent_cents: expenses.into_iter().map(|e| e.amount_cents).sum(),
        }
    }

    /// Allocated money not yet spent; negative when overspent.
    pub fn remaining_cents(&self) -> i64 {
        self.budgeted_cents - self.spent_cents
    }

    /// Income not yet allocated to a budget source.
    pub fn unallocated_cents(&self) -> i64 {
        self.income_cents - self.budgeted_cents
    }
}
