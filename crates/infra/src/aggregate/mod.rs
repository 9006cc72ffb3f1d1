//! Concurrent multi-source reads joined under one deadline.

pub mod fanout;
pub mod monthly;

pub use fanout::{AggregateError, Aggregated, Aggregation, FetchError};
pub use monthly::{MonthlyDataSource, MonthlySlots, MonthlySummary, MonthlySummaryAggregator};
