//! Monthly summary: income, budget and expense reads for one period, fetched
//! concurrently and joined under one deadline.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use budget_core::{BudgetSource, BudgetTotals, Context, Expense, IncomeSource, Period};

use super::fanout::{AggregateError, Aggregation, FetchError};
use crate::config::AggregatorConfig;

/// Read access to the persisted budgeting records.
#[async_trait]
pub trait MonthlyDataSource: Send + Sync {
    async fn income_sources(&self, period: Period) -> anyhow::Result<Vec<IncomeSource>>;

    async fn budget_sources(&self, period: Period) -> anyhow::Result<Vec<BudgetSource>>;

    async fn expenses(&self, period: Period) -> anyhow::Result<Vec<Expense>>;
}

/// One slot per fetch; `None` when that fetch failed or did not finish.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MonthlySlots {
    pub income_sources: Option<Vec<IncomeSource>>,
    pub budget_sources: Option<Vec<BudgetSource>>,
    pub expenses: Option<Vec<Expense>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonthlySummary {
    pub period: Period,
    pub income_sources: Option<Vec<IncomeSource>>,
    pub budget_sources: Option<Vec<BudgetSource>>,
    pub expenses: Option<Vec<Expense>>,
    /// Computed from whichever slots were filled.
    pub totals: BudgetTotals,
    pub errors: Vec<FetchError>,
}

impl MonthlySummary {
    fn from_slots(period: Period, slots: MonthlySlots, errors: Vec<FetchError>) -> Self {
        let totals = BudgetTotals::from_records(
            slots.income_sources.iter().flatten(),
            slots.budget_sources.iter().flatten(),
            slots.expenses.iter().flatten(),
        );
        Self {
            period,
            income_sources: slots.income_sources,
            budget_sources: slots.budget_sources,
            expenses: slots.expenses,
            totals,
            errors,
        }
    }

    /// True when some fetch failed and the totals are partial.
    pub fn is_degraded(&self) -> bool {
        !self.errors.is_empty()
    }
}

pub struct MonthlySummaryAggregator {
    source: Arc<dyn MonthlyDataSource>,
    config: AggregatorConfig,
}

impl MonthlySummaryAggregator {
    pub fn new(source: Arc<dyn MonthlyDataSource>, config: AggregatorConfig) -> Self {
        Self { source, config }
    }

    /// Fetch the three record sets for `period` concurrently.
    ///
    /// Bounded by the earlier of `ctx`'s deadline and the configured timeout.
    pub async fn summarize(
        &self,
        ctx: &Context,
        period: Period,
    ) -> Result<MonthlySummary, AggregateError<MonthlySlots>> {
        let ctx = ctx.child_with_timeout(self.config.timeout);
        let income = Arc::clone(&self.source);
        let budgets = Arc::clone(&self.source);
        let expenses = Arc::clone(&self.source);

        let out = Aggregation::<MonthlySlots>::new(format!("monthly-summary:{period}"))
            .fetch(
                "income_sources",
                async move { income.income_sources(period).await },
                |s, v| s.income_sources = Some(v),
            )
            .fetch(
                "budget_sources",
                async move { budgets.budget_sources(period).await },
                |s, v| s.budget_sources = Some(v),
            )
            .fetch(
                "expenses",
                async move { expenses.expenses(period).await },
                |s, v| s.expenses = Some(v),
            )
            .join(&ctx)
            .await?;

        Ok(MonthlySummary::from_slots(period, out.value, out.errors))
    }
}

impl std::fmt::Debug for MonthlySummaryAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonthlySummaryAggregator")
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use budget_core::{BudgetSourceId, ExpenseId, IncomeSourceId};
    use chrono::Utc;
    use std::time::Duration;

    struct Fixture {
        fail_budgets: bool,
        slow_expenses: bool,
    }

    fn period() -> Period {
        Period::new(2026, 3).unwrap()
    }

    #[async_trait]
    impl MonthlyDataSource for Fixture {
        async fn income_sources(&self, period: Period) -> anyhow::Result<Vec<IncomeSource>> {
            Ok(vec![IncomeSource {
                id: IncomeSourceId::new(),
                name: "salary".into(),
                amount_cents: 400_000,
                period,
            }])
        }

        async fn budget_sources(&self, period: Period) -> anyhow::Result<Vec<BudgetSource>> {
            if self.fail_budgets {
                anyhow::bail!("budget table locked");
            }
            Ok(vec![BudgetSource {
                id: BudgetSourceId::new(),
                name: "rent".into(),
                allocated_cents: 150_000,
                period,
            }])
        }

        async fn expenses(&self, period: Period) -> anyhow::Result<Vec<Expense>> {
            if self.slow_expenses {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Ok(vec![Expense {
                id: ExpenseId::new(),
                description: "march rent".into(),
                amount_cents: 150_000,
                budget_source_id: None,
                period,
                spent_at: Utc::now(),
            }])
        }
    }

    fn aggregator(fixture: Fixture) -> MonthlySummaryAggregator {
        MonthlySummaryAggregator::new(
            Arc::new(fixture),
            AggregatorConfig::default().with_timeout(Duration::from_secs(1)),
        )
    }

    #[tokio::test]
    async fn all_fetches_succeed() {
        let summary = aggregator(Fixture {
            fail_budgets: false,
            slow_expenses: false,
        })
        .summarize(&Context::background(), period())
        .await
        .unwrap();

        assert!(!summary.is_degraded());
        assert_eq!(summary.totals.income_cents, 400_000);
        assert_eq!(summary.totals.remaining_cents(), 0);
    }

    #[tokio::test]
    async fn failing_fetch_is_reported_not_fatal() {
        let summary = aggregator(Fixture {
            fail_budgets: true,
            slow_expenses: false,
        })
        .summarize(&Context::background(), period())
        .await
        .unwrap();

        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].fetch, "budget_sources");
        assert!(summary.budget_sources.is_none());
        assert_eq!(summary.income_sources.as_ref().map(Vec::len), Some(1));
        assert_eq!(summary.expenses.as_ref().map(Vec::len), Some(1));
        assert_eq!(summary.totals.budgeted_cents, 0);
        assert_eq!(summary.totals.spent_cents, 150_000);
    }

    #[tokio::test(start_paused = true)]
    async fn configured_timeout_bounds_the_join() {
        let err = aggregator(Fixture {
            fail_budgets: false,
            slow_expenses: true,
        })
        .summarize(&Context::background(), period())
        .await
        .unwrap_err();

        assert!(matches!(err, AggregateError::DeadlineExceeded { pending: 1, .. }));
        assert!(err.partial().income_sources.is_some());
        assert!(err.partial().expenses.is_none());
    }
}
