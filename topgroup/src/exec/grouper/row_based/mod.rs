//! Group the [`Row`]s with the [`LimitedBufferGrouper`]
//!
//! The grouping key of a row is its (truncated) timestamp and the string values of the
//! dimensions. Rows are fed to the grouper through a [`RowAccumulator`], which also
//! publishes the row to the aggregators' selectors. Groups are turned back into rows
//! with [`make_grouper_iterator`].

pub mod serde;

use snafu::ensure;

use self::serde::{RowBasedKeySerde, RowBasedKeySerdeFactory};
use super::limited_buffer_grouper::{GrouperOptions, LimitedBufferGrouper};
use super::{
    Grouper, KeySerdeFactory, LimitPushDownNotApplicableSnafu, LimitPushDownWithoutLimitSnafu,
    Result,
};
use crate::common::config::GroupByQueryConfig;
use crate::exec::query::{Granularity, GroupByQuery};
use crate::exec::row::{Row, RowColumnSelectorFactory, Value};

/// Grouping key of a row
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowBasedKey {
    /// Timestamp of the group, `None` if the timestamp is not part of the key
    pub timestamp: Option<i64>,
    /// Values of the dimensions, missing values are empty strings
    pub dimensions: Vec<String>,
}

/// Create the limited grouper of the `query` on top of the `buffer` and the
/// accumulator that feeds it.
///
/// The limit is pushed down when the context asks for it or when the sort columns
/// only contain the dimensions. It is an error to ask for the push down without a
/// limit spec, or to create the grouper when the limit can not be pushed down.
pub fn create_grouper_accumulator_pair<'a>(
    query: &GroupByQuery,
    is_input_raw: bool,
    config: &GroupByQueryConfig,
    buffer: &'a mut [u8],
) -> Result<(LimitedBufferGrouper<'a, RowBasedKeySerde>, RowAccumulator)> {
    let config = config.with_overrides(&query.context);

    let limit_spec = match &query.limit_spec {
        Some(limit_spec) => limit_spec,
        None => {
            ensure!(!query.context.push_down_limit, LimitPushDownWithoutLimitSnafu);
            return LimitPushDownNotApplicableSnafu.fail();
        }
    };
    let sort_has_aggs = limit_spec.sort_has_aggregators(&query.aggregators);
    // Sorting by the dimensions only is always safe to push down
    let push_down_limit =
        (query.context.push_down_limit || !sort_has_aggs) && limit_spec.limit != usize::MAX;
    ensure!(push_down_limit, LimitPushDownNotApplicableSnafu);

    let concurrency = query.context.concurrency.get() as usize;
    let max_dictionary_size = config.max_merging_dictionary_size / concurrency;
    let key_serde_factory = RowBasedKeySerdeFactory::new(
        query.include_timestamp(),
        query.context.sort_by_dims_first,
        query.dimensions.clone(),
        max_dictionary_size,
        query.aggregators.clone(),
        Some(limit_spec.clone()),
    );

    let selectors = RowColumnSelectorFactory::new();
    let options = GrouperOptions {
        buffer_grouper_max_size: config.buffer_grouper_max_size,
        max_load_factor: config.buffer_grouper_max_load_factor,
        initial_buckets: config.buffer_grouper_initial_buckets,
        limit: limit_spec.limit,
        sort_has_aggs,
    };
    let grouper = LimitedBufferGrouper::try_new(
        buffer,
        key_serde_factory.factorize(),
        &selectors,
        &query.aggregators,
        options,
    )?;

    tracing::debug!(
        "Push down limit `{}` into the grouper, sort has aggregators: `{}`, dictionary budget: `{}`",
        limit_spec.limit,
        sort_has_aggs,
        max_dictionary_size
    );

    let accumulator = RowAccumulator {
        selectors,
        include_timestamp: query.include_timestamp(),
        granularity: query.granularity,
        is_input_raw,
        columns: query
            .dimensions
            .iter()
            .map(|dimension| {
                if is_input_raw {
                    dimension.dimension.clone()
                } else {
                    dimension.output_name.clone()
                }
            })
            .collect(),
    };
    Ok((grouper, accumulator))
}

/// Accumulates the rows into the grouper.
///
/// Raw rows are read by the input names of the dimensions and their timestamps are
/// truncated to the granularity. Rows produced by another grouper are read by the
/// output names and their timestamps are used as is.
#[derive(Debug, Clone)]
pub struct RowAccumulator {
    selectors: RowColumnSelectorFactory,
    include_timestamp: bool,
    granularity: Granularity,
    is_input_raw: bool,
    columns: Vec<String>,
}

impl RowAccumulator {
    /// Aggregate the `row` into the `grouper`. Returns `Ok(false)` if the grouper is out
    /// of resources and the row is dropped
    pub fn accumulate<G>(&self, grouper: &mut G, row: Row) -> Result<bool>
    where
        G: Grouper<Key = RowBasedKey>,
    {
        let key = self.make_key(&row);
        self.selectors.set_row(Some(row));
        let aggregated = grouper.aggregate(&key);
        self.selectors.set_row(None);
        aggregated
    }

    fn make_key(&self, row: &Row) -> RowBasedKey {
        let timestamp = self.include_timestamp.then(|| {
            if self.is_input_raw {
                self.granularity.bucket_start(row.timestamp())
            } else {
                row.timestamp()
            }
        });
        RowBasedKey {
            timestamp,
            dimensions: self
                .columns
                .iter()
                .map(|column| row.dimension(column))
                .collect(),
        }
    }
}

/// Row produced by the grouper
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    /// Timestamp of the group
    pub timestamp: Option<i64>,
    /// Dimensions by their output names followed by the aggregators
    pub event: Vec<(String, Value)>,
}

impl ResultRow {
    /// Value of the column
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.event
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }
}

/// Convert the groups in the `grouper` to [`ResultRow`]s. Empty dimensions become
/// [`Value::Null`]
pub fn make_grouper_iterator<'g, G>(
    grouper: &'g mut G,
    query: &GroupByQuery,
    sorted: bool,
) -> impl Iterator<Item = ResultRow> + use<'g, G>
where
    G: Grouper<Key = RowBasedKey>,
{
    let universal_timestamp = query.universal_timestamp();
    let dimension_names = query
        .dimensions
        .iter()
        .map(|dimension| dimension.output_name.clone())
        .collect::<Vec<_>>();
    let aggregator_names = query
        .aggregators
        .iter()
        .map(|aggregator| aggregator.name().to_string())
        .collect::<Vec<_>>();

    grouper.iterator(sorted).map(move |entry| {
        let dimensions = dimension_names
            .iter()
            .zip(entry.key.dimensions)
            .map(|(name, value)| {
                let value = if value.is_empty() {
                    Value::Null
                } else {
                    Value::String(value)
                };
                (name.clone(), value)
            });
        let aggregators = aggregator_names.iter().cloned().zip(entry.values);
        ResultRow {
            timestamp: entry.key.timestamp.or(universal_timestamp),
            event: dimensions.chain(aggregators).collect(),
        }
    })
}
