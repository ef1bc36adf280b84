//! Configuration of the group by engine

use super::query_context::QueryContext;

/// Default budget of the merging dictionary, in estimated bytes
pub const DEFAULT_MAX_MERGING_DICTIONARY_SIZE: usize = 100_000_000;

/// Configuration of the group by query. Zero load factor and zero initial buckets
/// mean the grouper's defaults
#[derive(Debug, Clone, PartialEq)]
pub struct GroupByQueryConfig {
    /// Budget of the dictionary used to encode the string dimensions
    pub max_merging_dictionary_size: usize,
    /// Hard limit of the number of groups in a grouper
    pub buffer_grouper_max_size: usize,
    /// Max load factor of the grouper's hash table
    pub buffer_grouper_max_load_factor: f32,
    /// Initial number of buckets
    pub buffer_grouper_initial_buckets: usize,
}

impl Default for GroupByQueryConfig {
    fn default() -> Self {
        Self {
            max_merging_dictionary_size: DEFAULT_MAX_MERGING_DICTIONARY_SIZE,
            buffer_grouper_max_size: i32::MAX as usize,
            buffer_grouper_max_load_factor: 0.0,
            buffer_grouper_initial_buckets: 0,
        }
    }
}

impl GroupByQueryConfig {
    /// Apply the overrides in the query context. Size limits can only be lowered by
    /// the query
    pub fn with_overrides(&self, context: &QueryContext) -> Self {
        Self {
            max_merging_dictionary_size: context
                .max_merging_dictionary_size
                .map_or(self.max_merging_dictionary_size, |size| {
                    size.min(self.max_merging_dictionary_size)
                }),
            buffer_grouper_max_size: context
                .buffer_grouper_max_size
                .map_or(self.buffer_grouper_max_size, |size| {
                    size.min(self.buffer_grouper_max_size)
                }),
            buffer_grouper_max_load_factor: context
                .buffer_grouper_max_load_factor
                .unwrap_or(self.buffer_grouper_max_load_factor),
            buffer_grouper_initial_buckets: context
                .buffer_grouper_initial_buckets
                .unwrap_or(self.buffer_grouper_initial_buckets),
        }
    }
}
