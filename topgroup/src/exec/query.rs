//! Description of the group by query

use std::sync::Arc;

use crate::common::query_context::QueryContext;
use crate::exec::aggregator::AggregatorFactory;

/// Grouping dimension of the query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimensionSpec {
    /// Name of the column in the input row
    pub dimension: String,
    /// Name of the column in the output row
    pub output_name: String,
}

impl DimensionSpec {
    /// Dimension whose output name is the same with its input name
    pub fn new(dimension: impl Into<String>) -> Self {
        let dimension = dimension.into();
        Self {
            output_name: dimension.clone(),
            dimension,
        }
    }

    /// Dimension with a different output name
    pub fn with_output_name(dimension: impl Into<String>, output_name: impl Into<String>) -> Self {
        Self {
            dimension: dimension.into(),
            output_name: output_name.into(),
        }
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Small values first
    Ascending,
    /// Large values first
    Descending,
}

/// Column to sort by. The `dimension` is either the output name of a dimension or the
/// name of an aggregator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderByColumnSpec {
    /// Output name of the dimension or name of the aggregator
    pub dimension: String,
    /// Direction
    pub direction: Direction,
}

impl OrderByColumnSpec {
    /// Ascending order by `dimension`
    pub fn asc(dimension: impl Into<String>) -> Self {
        Self {
            dimension: dimension.into(),
            direction: Direction::Ascending,
        }
    }

    /// Descending order by `dimension`
    pub fn desc(dimension: impl Into<String>) -> Self {
        Self {
            dimension: dimension.into(),
            direction: Direction::Descending,
        }
    }

    /// Index of the dimension this column refers to
    pub fn dimension_index(&self, dimensions: &[DimensionSpec]) -> Option<usize> {
        dimensions
            .iter()
            .position(|dimension| dimension.output_name == self.dimension)
    }

    /// Index of the aggregator this column refers to
    pub fn aggregator_index(&self, aggregators: &[Arc<dyn AggregatorFactory>]) -> Option<usize> {
        aggregators
            .iter()
            .position(|aggregator| aggregator.name() == self.dimension)
    }
}

/// Sort columns and limit of the query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultLimitSpec {
    /// Sort columns
    pub columns: Vec<OrderByColumnSpec>,
    /// Max number of output rows, `usize::MAX` means no limit
    pub limit: usize,
}

impl DefaultLimitSpec {
    /// Create a new limit spec
    pub fn new(columns: Vec<OrderByColumnSpec>, limit: usize) -> Self {
        Self { columns, limit }
    }

    /// Returns true if some sort column refers to an aggregator, whose value changes
    /// while the rows are aggregated
    pub fn sort_has_aggregators(&self, aggregators: &[Arc<dyn AggregatorFactory>]) -> bool {
        self.columns
            .iter()
            .any(|column| column.aggregator_index(aggregators).is_some())
    }
}

/// Granularity of the timestamp in the grouping key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    /// Whole interval is a single bucket, timestamp is not part of the key
    All,
    /// Millisecond, timestamps are not truncated
    None,
    /// Second
    Second,
    /// Minute
    Minute,
    /// Hour
    Hour,
    /// Day in UTC
    Day,
}

impl Granularity {
    /// Start of the bucket that contains `timestamp`. `All` does not bucket the
    /// timestamps and returns it unchanged
    pub fn bucket_start(&self, timestamp: i64) -> i64 {
        let period = match self {
            Self::All | Self::None => return timestamp,
            Self::Second => 1_000,
            Self::Minute => 60_000,
            Self::Hour => 3_600_000,
            Self::Day => 86_400_000,
        };
        timestamp - timestamp.rem_euclid(period)
    }
}

/// Group by query
#[derive(Debug, Clone)]
pub struct GroupByQuery {
    /// Grouping dimensions, all of them are strings
    pub dimensions: Vec<DimensionSpec>,
    /// Aggregators
    pub aggregators: Vec<Arc<dyn AggregatorFactory>>,
    /// Granularity of the timestamp
    pub granularity: Granularity,
    /// Start of the queried interval in milliseconds. Rows produced with the `All`
    /// granularity carry this timestamp
    pub interval_start: Option<i64>,
    /// Sort columns and limit
    pub limit_spec: Option<DefaultLimitSpec>,
    /// Context
    pub context: QueryContext,
}

impl GroupByQuery {
    /// Returns true if the timestamp is part of the grouping key
    #[inline]
    pub fn include_timestamp(&self) -> bool {
        self.granularity != Granularity::All
    }

    /// Timestamp shared by all of the output rows when the timestamp is not part of
    /// the grouping key
    pub fn universal_timestamp(&self) -> Option<i64> {
        if self.include_timestamp() {
            None
        } else {
            self.interval_start
        }
    }
}
