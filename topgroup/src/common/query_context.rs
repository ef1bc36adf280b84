//! [`QueryContext`] holds the per query flags and overrides of the
//! [`GroupByQueryConfig`](super::config::GroupByQueryConfig)

use super::types::ParallelismDegree;

/// Per query context
#[derive(Debug, Clone)]
pub struct QueryContext {
    /// Push the limit down into the grouper, it requires a limit spec
    pub push_down_limit: bool,
    /// Compare the dimensions before the timestamp when sorting the grouping keys
    pub sort_by_dims_first: bool,
    /// Number of groupers that share the merging dictionary budget
    pub concurrency: ParallelismDegree,
    /// Override of the dictionary budget, in estimated bytes
    pub max_merging_dictionary_size: Option<usize>,
    /// Override of the hard limit of the number of groups in a grouper
    pub buffer_grouper_max_size: Option<usize>,
    /// Override of the max load factor of the grouper's hash table
    pub buffer_grouper_max_load_factor: Option<f32>,
    /// Override of the initial number of buckets
    pub buffer_grouper_initial_buckets: Option<usize>,
}

impl Default for QueryContext {
    fn default() -> Self {
        Self {
            push_down_limit: false,
            sort_by_dims_first: false,
            concurrency: ParallelismDegree::MIN,
            max_merging_dictionary_size: None,
            buffer_grouper_max_size: None,
            buffer_grouper_max_load_factor: None,
            buffer_grouper_initial_buckets: None,
        }
    }
}
