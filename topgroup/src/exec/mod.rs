//! Execution of the group by query

pub mod aggregator;
pub mod grouper;
pub mod query;
pub mod row;
