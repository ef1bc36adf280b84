//! Grouper that only keeps the top `limit` groups
//!
//! # Layout of the buffer
//!
//! ```text
//! ┌──────────────────── table arena ────────────────────┬──────── heap ────────┐
//! │ first half: buckets... │ second half: buckets...    │ (limit + 1) offsets  │
//! └─────────────────────────────────────────────────────┴──────────────────────┘
//! ```
//!
//! Only one half is active. Each bucket is
//! `[hash | used flag: u32][key][aggregator states...][heap index: i32]`. When the active
//! half is full, the buckets referenced by the heap are copied into the other half and
//! all of the other buckets are dropped. Because the heap only holds the best `limit`
//! groups under the query's sort order, dropping the others never changes the result
//! when the sort order only contains the grouping keys.
//!
//! Offsets stored in the heap and in the buckets are relative to the active half.

use std::cmp::Ordering;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use snafu::{OptionExt, ensure};
use strength_reduce::StrengthReducedUsize;

use super::heap::{BoundedOffsetHeap, HeapIndexUpdater, OffsetComparator, heap_bytes};
use super::{
    BufferTooLargeSnafu, BufferTooSmallSnafu, Entry, Grouper, InvalidLimitSnafu,
    InvalidMaxLoadFactorSnafu, KeySerde, KeySizeMismatchSnafu, Result, SwapLostBucketSnafu,
};
use crate::common::profiler::ScopedTimerGuard;
use crate::common::types::HashValue;
use crate::common::utils::bytes::{read_i32, read_u32, write_i32, write_u32};
use crate::common::utils::hash::HASH_MASK;
use crate::exec::aggregator::{AggregatorFactory, BufferAggregator};
use crate::exec::row::RowColumnSelectorFactory;

/// Size of the hash stored in the bucket
pub const HASH_SIZE: usize = std::mem::size_of::<HashValue>();
const HEAP_INDEX_SIZE: usize = std::mem::size_of::<i32>();
const USED_FLAG: HashValue = !HASH_MASK;

/// Minimal number of the initial buckets
pub const MIN_INITIAL_BUCKETS: usize = 4;
/// Number of the initial buckets if it is not configured
pub const DEFAULT_INITIAL_BUCKETS: usize = 1024;
/// Max load factor if it is not configured
pub const DEFAULT_MAX_LOAD_FACTOR: f32 = 0.7;

/// Options of the [`LimitedBufferGrouper`]
#[derive(Debug, Clone)]
pub struct GrouperOptions {
    /// Hard limit of the number of groups in the table
    pub buffer_grouper_max_size: usize,
    /// Max load factor of the table. Non-positive value means the
    /// [`DEFAULT_MAX_LOAD_FACTOR`]
    pub max_load_factor: f32,
    /// Initial number of buckets, zero means [`DEFAULT_INITIAL_BUCKETS`]. The limited
    /// grouper always uses the whole half of the table arena
    pub initial_buckets: usize,
    /// Number of groups to produce
    pub limit: usize,
    /// Whether the sort order contains aggregators
    pub sort_has_aggs: bool,
}

impl GrouperOptions {
    /// Options with the default sizes
    pub fn new(limit: usize, sort_has_aggs: bool) -> Self {
        Self {
            buffer_grouper_max_size: i32::MAX as usize,
            max_load_factor: 0.0,
            initial_buckets: 0,
            limit,
            sort_has_aggs,
        }
    }
}

/// Metrics of the grouper
#[derive(Debug, Default, Clone)]
pub struct GrouperMetrics {
    /// The number of rows passed to the grouper
    pub num_rows: u64,
    /// The number of rows rejected because of the resource limit
    pub num_rejected_rows: u64,
    /// Time spent in encoding the keys
    pub serialize_time: Duration,
    /// Time spent in probing the table, swaps included
    pub probing_time: Duration,
    /// Time spent in updating the aggregation states and the heap
    pub update_states_time: Duration,
}

/// Offsets of the fields in the bucket
#[derive(Debug, Clone)]
struct BucketLayout {
    key_size: usize,
    /// Offsets of the aggregation states relative to the start of the bucket
    aggregator_offsets: Vec<usize>,
    heap_index_position: usize,
    bucket_size: usize,
}

impl BucketLayout {
    #[inline]
    fn is_used(&self, table: &[u8], offset: usize) -> bool {
        read_u32(table, offset) & USED_FLAG != 0
    }

    #[inline]
    fn key<'t>(&self, table: &'t [u8], offset: usize) -> &'t [u8] {
        &table[offset + HASH_SIZE..offset + HASH_SIZE + self.key_size]
    }

    #[inline]
    fn heap_index(&self, table: &[u8], offset: usize) -> Option<usize> {
        let index = read_i32(table, offset + self.heap_index_position);
        (index >= 0).then_some(index as usize)
    }

    #[inline]
    fn set_heap_index(&self, table: &mut [u8], offset: usize, index: Option<usize>) {
        let index = index.map_or(-1, |index| index as i32);
        write_i32(table, offset + self.heap_index_position, index);
    }

    fn clear(&self, table: &mut [u8]) {
        (0..table.len())
            .step_by(self.bucket_size)
            .for_each(|offset| write_u32(table, offset, 0));
    }
}

/// Linear probing from `hash % buckets`. Returns the offset of the bucket that holds
/// the `key`, or the first unused bucket if `allow_new_bucket` is true
fn find_bucket(
    table: &[u8],
    layout: &BucketLayout,
    buckets: StrengthReducedUsize,
    allow_new_bucket: bool,
    hash: HashValue,
    key: &[u8],
) -> Option<usize> {
    let start = hash as usize % buckets;
    let mut bucket = start;
    loop {
        let offset = bucket * layout.bucket_size;
        if !layout.is_used(table, offset) {
            return allow_new_bucket.then_some(offset);
        }

        if read_u32(table, offset) == hash | USED_FLAG && layout.key(table, offset) == key {
            return Some(offset);
        }

        bucket += 1;
        if bucket == buckets.get() {
            bucket = 0;
        }
        if bucket == start {
            return None;
        }
    }
}

/// Hash table stored in the two halves of the table arena
struct BucketTable<'a> {
    arena: &'a mut [u8],
    layout: BucketLayout,
    table_start: usize,
    buckets: StrengthReducedUsize,
    size: usize,
    max_size: usize,
    growth_count: usize,
}

impl BucketTable<'_> {
    #[inline]
    fn table_size(&self) -> usize {
        self.buckets.get() * self.layout.bucket_size
    }

    /// Active half
    #[inline]
    fn table(&self) -> &[u8] {
        &self.arena[self.table_start..self.table_start + self.table_size()]
    }

    /// Active half and the layout of its buckets
    #[inline]
    fn table_mut(&mut self) -> (&mut [u8], &BucketLayout) {
        let range = self.table_start..self.table_start + self.table_size();
        (&mut self.arena[range], &self.layout)
    }

    #[inline]
    fn find_bucket(&self, allow_new_bucket: bool, hash: HashValue, key: &[u8]) -> Option<usize> {
        find_bucket(
            self.table(),
            &self.layout,
            self.buckets,
            allow_new_bucket,
            hash,
            key,
        )
    }

    fn reset(&mut self) {
        self.size = 0;
        self.table_start = 0;
        self.growth_count = 0;
        let (table, layout) = self.table_mut();
        layout.clear(table);
    }

    /// Copy the buckets referenced by the heap into the other half and make it active
    fn swap(&mut self, heap: &mut BoundedOffsetHeap<'_>) -> Result<()> {
        let table_size = self.table_size();
        let bucket_size = self.layout.bucket_size;
        let half = self.arena.len() / 2;
        let (low, high) = self.arena.split_at_mut(half);
        let (old_table, new_table, new_start) = if self.table_start == 0 {
            (&low[..table_size], &mut high[..table_size], half)
        } else {
            (&high[..table_size], &mut low[..table_size], 0)
        };

        self.layout.clear(new_table);
        for heap_index in 0..heap.heap_size() {
            let old_offset = heap.offset_at(heap_index);
            let hash = read_u32(old_table, old_offset) & HASH_MASK;
            let key = self.layout.key(old_table, old_offset);
            let new_offset = find_bucket(new_table, &self.layout, self.buckets, true, hash, key)
                .context(SwapLostBucketSnafu {
                    heap_index,
                    buckets: self.buckets.get(),
                })?;
            new_table[new_offset..new_offset + bucket_size]
                .copy_from_slice(&old_table[old_offset..old_offset + bucket_size]);
            heap.set_offset_at(heap_index, new_offset);
        }

        tracing::trace!(
            "Swap the table from `{}` to `{}`, keep `{}` of `{}` groups",
            self.table_start,
            new_start,
            heap.heap_size(),
            self.size
        );

        self.table_start = new_start;
        self.size = heap.heap_size();
        self.growth_count += 1;
        Ok(())
    }
}

/// Orders the buckets in the active half for the heap and keeps their heap indices
struct BucketHeapContext<'t, S: KeySerde> {
    table: &'t mut [u8],
    layout: &'t BucketLayout,
    key_serde: &'t S,
    comparator: &'t S::Comparator,
}

impl<S: KeySerde> OffsetComparator for BucketHeapContext<'_, S> {
    #[inline]
    fn compare_offsets(&self, lhs: usize, rhs: usize) -> Ordering {
        self.key_serde.compare(
            self.comparator,
            self.table,
            lhs + HASH_SIZE,
            self.table,
            rhs + HASH_SIZE,
        )
    }
}

impl<S: KeySerde> HeapIndexUpdater for BucketHeapContext<'_, S> {
    #[inline]
    fn heap_index(&self, offset: usize) -> Option<usize> {
        self.layout.heap_index(self.table, offset)
    }

    #[inline]
    fn set_heap_index(&mut self, offset: usize, index: Option<usize>) {
        self.layout.set_heap_index(self.table, offset, index);
    }
}

/// Grouper that pushes the limit down. It keeps the offsets of the best `limit` buckets
/// in a bounded min-max heap and drops the other buckets when the table is full
pub struct LimitedBufferGrouper<'a, S: KeySerde> {
    table: BucketTable<'a>,
    heap: BoundedOffsetHeap<'a>,
    key_serde: S,
    aggregators: Vec<Box<dyn BufferAggregator>>,
    /// Orders the heap by the query's sort columns
    heap_comparator: S::Comparator,
    buffer_grouper_max_size: usize,
    max_load_factor: f32,
    initial_buckets: usize,
    sort_has_aggs: bool,
    capacity: usize,
    closed: bool,
    metrics: GrouperMetrics,
}

impl<S: KeySerde> Debug for LimitedBufferGrouper<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimitedBufferGrouper")
            .field("capacity", &self.capacity)
            .field("bucket_size", &self.table.layout.bucket_size)
            .field("buckets", &self.table.buckets.get())
            .field("size", &self.table.size)
            .field("max_size", &self.table.max_size)
            .field("limit", &self.heap.limit())
            .field("heap_size", &self.heap.heap_size())
            .field("growth_count", &self.table.growth_count)
            .field("sort_has_aggs", &self.sort_has_aggs)
            .field("key_serde", &self.key_serde)
            .field("aggregators", &self.aggregators)
            .finish()
    }
}

impl<'a, S: KeySerde> LimitedBufferGrouper<'a, S> {
    /// Create a new grouper on top of the `buffer`. The aggregators read the rows from
    /// the `selectors`
    pub fn try_new(
        buffer: &'a mut [u8],
        mut key_serde: S,
        selectors: &RowColumnSelectorFactory,
        aggregator_factories: &[Arc<dyn AggregatorFactory>],
        options: GrouperOptions,
    ) -> Result<Self> {
        let max_load_factor = if options.max_load_factor > 0.0 {
            options.max_load_factor
        } else {
            DEFAULT_MAX_LOAD_FACTOR
        };
        ensure!(
            max_load_factor < 1.0,
            InvalidMaxLoadFactorSnafu { max_load_factor }
        );
        ensure!(
            options.limit > 0,
            InvalidLimitSnafu {
                limit: options.limit
            }
        );
        let initial_buckets = if options.initial_buckets > 0 {
            options.initial_buckets.max(MIN_INITIAL_BUCKETS)
        } else {
            DEFAULT_INITIAL_BUCKETS
        };

        let key_size = key_serde.key_size();
        let mut offset = HASH_SIZE + key_size;
        let mut aggregator_offsets = Vec::with_capacity(aggregator_factories.len());
        let mut aggregators = Vec::with_capacity(aggregator_factories.len());
        for factory in aggregator_factories {
            aggregator_offsets.push(offset);
            offset += factory.max_intermediate_size();
            aggregators.push(factory.factorize_buffered(selectors));
        }
        let layout = BucketLayout {
            key_size,
            aggregator_offsets,
            heap_index_position: offset,
            bucket_size: offset + HEAP_INDEX_SIZE,
        };

        // Each half should hold `limit + 1` buckets
        let capacity = buffer.len();
        let required = options
            .limit
            .checked_add(1)
            .and_then(|n| n.checked_mul(HEAP_INDEX_SIZE + 2 * layout.bucket_size))
            .unwrap_or(usize::MAX);
        ensure!(
            capacity >= required,
            BufferTooSmallSnafu { capacity, required }
        );
        let heap_size = heap_bytes(options.limit);
        let table_arena_size = (capacity - heap_size) / layout.bucket_size * layout.bucket_size;
        ensure!(
            table_arena_size <= i32::MAX as usize,
            BufferTooLargeSnafu { capacity }
        );
        let buckets = table_arena_size / 2 / layout.bucket_size;
        let max_size = ((buckets as f64 * max_load_factor as f64) as usize).max(1);

        let offsets_after_key = layout
            .aggregator_offsets
            .iter()
            .map(|offset| offset - HASH_SIZE)
            .collect::<Vec<_>>();
        let heap_comparator =
            key_serde.buffer_comparator_with_aggregators(aggregator_factories, &offsets_after_key)?;
        key_serde.reset();

        let (arena, heap_region) = buffer.split_at_mut(table_arena_size);
        let mut table = BucketTable {
            arena,
            layout,
            table_start: 0,
            buckets: StrengthReducedUsize::new(buckets),
            size: 0,
            max_size,
            growth_count: 0,
        };
        table.reset();

        tracing::debug!(
            "Create LimitedBufferGrouper with `{}` buckets of `{}` bytes in each half, limit: `{}`, max size: `{}`",
            buckets,
            table.layout.bucket_size,
            options.limit,
            max_size
        );

        Ok(Self {
            table,
            heap: BoundedOffsetHeap::new(&mut heap_region[..heap_size], options.limit),
            key_serde,
            aggregators,
            heap_comparator,
            buffer_grouper_max_size: options.buffer_grouper_max_size,
            max_load_factor,
            initial_buckets,
            sort_has_aggs: options.sort_has_aggs,
            capacity,
            closed: false,
            metrics: GrouperMetrics::default(),
        })
    }

    /// Number of times the table swapped between the two halves
    pub fn growth_count(&self) -> usize {
        self.table.growth_count
    }

    /// Number of groups in the active half
    pub fn size(&self) -> usize {
        self.table.size
    }

    /// Number of buckets in each half
    pub fn buckets(&self) -> usize {
        self.table.buckets.get()
    }

    /// Number of groups in the active half that triggers a swap
    pub fn max_size(&self) -> usize {
        self.table.max_size
    }

    /// Number of groups kept by the heap
    pub fn limit(&self) -> usize {
        self.heap.limit()
    }

    /// Effective max load factor
    pub fn max_load_factor(&self) -> f32 {
        self.max_load_factor
    }

    /// Effective initial number of buckets
    pub fn initial_buckets(&self) -> usize {
        self.initial_buckets
    }

    /// Metrics collected since the creation
    pub fn metrics(&self) -> &GrouperMetrics {
        &self.metrics
    }

    /// Serde of the keys
    pub fn key_serde(&self) -> &S {
        &self.key_serde
    }

    /// Failure of an aggregator does not stop closing the others. Aggregators are closed
    /// at most once, `closed` is never cleared
    fn close_aggregators(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for aggregator in &mut self.aggregators {
            if let Err(e) = aggregator.close() {
                tracing::warn!("Could not close aggregator `{:?}`, skipping: {}", aggregator, e);
            }
        }
    }

    fn entry_at(&self, offset: usize) -> Entry<S::Key> {
        let table = self.table.table();
        let key = self.key_serde.from_bytes(table, offset + HASH_SIZE);
        let values = self
            .aggregators
            .iter()
            .zip(&self.table.layout.aggregator_offsets)
            .map(|(aggregator, &state_offset)| aggregator.get(table, offset + state_offset))
            .collect();
        Entry::new(key, values)
    }
}

impl<S: KeySerde> Grouper for LimitedBufferGrouper<'_, S>
where
    S::Key: Hash,
{
    type Key = S::Key;

    fn aggregate_with_hash(&mut self, key: &S::Key, hash: HashValue) -> Result<bool> {
        self.metrics.num_rows += 1;
        let hash = hash & HASH_MASK;

        let key_bytes = {
            let _guard = ScopedTimerGuard::new(&mut self.metrics.serialize_time);
            self.key_serde.to_bytes(key)
        };
        let Some(key_bytes) = key_bytes else {
            self.metrics.num_rejected_rows += 1;
            return Ok(false);
        };
        ensure!(
            key_bytes.len() == self.table.layout.key_size,
            KeySizeMismatchSnafu {
                expect: self.table.layout.key_size,
                actual: key_bytes.len()
            }
        );

        let offset = {
            let _guard = ScopedTimerGuard::new(&mut self.metrics.probing_time);
            let table = &mut self.table;
            let allow_new_bucket = table.size < table.max_size.min(self.buffer_grouper_max_size);
            let mut bucket = table.find_bucket(allow_new_bucket, hash, key_bytes);
            if bucket.is_none() && table.size < self.buffer_grouper_max_size {
                table.swap(&mut self.heap)?;
                bucket = table.find_bucket(table.size < table.max_size, hash, key_bytes);
            }
            bucket
        };
        let Some(offset) = offset else {
            self.metrics.num_rejected_rows += 1;
            return Ok(false);
        };

        let _guard = ScopedTimerGuard::new(&mut self.metrics.update_states_time);
        let (table, layout) = self.table.table_mut();
        let is_new = !layout.is_used(table, offset);
        if is_new {
            write_u32(table, offset, hash | USED_FLAG);
            table[offset + HASH_SIZE..offset + HASH_SIZE + layout.key_size]
                .copy_from_slice(key_bytes);
            self.aggregators
                .iter()
                .zip(&layout.aggregator_offsets)
                .for_each(|(aggregator, &state_offset)| {
                    aggregator.init(table, offset + state_offset)
                });
            layout.set_heap_index(table, offset, None);
        }

        self.aggregators
            .iter()
            .zip(&layout.aggregator_offsets)
            .for_each(|(aggregator, &state_offset)| {
                aggregator.aggregate(table, offset + state_offset)
            });

        let mut ctx = BucketHeapContext {
            table,
            layout,
            key_serde: &self.key_serde,
            comparator: &self.heap_comparator,
        };
        match ctx.heap_index(offset) {
            None => {
                self.heap.add_offset(offset, &mut ctx);
            }
            Some(heap_index) if self.sort_has_aggs => {
                // States in the sort order changed, move the bucket to its new place
                self.heap.delete_at(heap_index, &mut ctx);
                self.heap.add_offset(offset, &mut ctx);
            }
            Some(_) => (),
        }

        if is_new {
            self.table.size += 1;
        }
        Ok(true)
    }

    fn reset(&mut self) {
        self.table.reset();
        self.key_serde.reset();
        self.heap.reset();
    }

    fn iterator(&mut self, _sorted: bool) -> Box<dyn Iterator<Item = Entry<S::Key>> + '_> {
        tracing::debug!(
            "Iterate LimitedBufferGrouper, size: `{}`, heap size: `{}`, growth count: `{}`, metrics: {:?}",
            self.table.size,
            self.heap.heap_size(),
            self.table.growth_count,
            self.metrics
        );

        if self.sort_has_aggs {
            // Heap is ordered by the aggregators, the groups are sorted by their keys
            // again so that the results of different groupers can be merged
            let comparator = self.key_serde.buffer_comparator();
            let table = self.table.table();
            let key_serde = &self.key_serde;
            self.heap.sort_by(|lhs, rhs| {
                key_serde.compare(&comparator, table, lhs + HASH_SIZE, table, rhs + HASH_SIZE)
            });
            Box::new(SortedIterator {
                grouper: self,
                index: 0,
            })
        } else {
            Box::new(HeapIterator { grouper: self })
        }
    }

    fn close(&mut self) {
        self.close_aggregators();
    }
}

impl<S: KeySerde> Drop for LimitedBufferGrouper<'_, S> {
    fn drop(&mut self) {
        self.close_aggregators();
    }
}

/// Pops the heap from the best group to the worst group
struct HeapIterator<'g, 'a, S: KeySerde> {
    grouper: &'g mut LimitedBufferGrouper<'a, S>,
}

impl<S: KeySerde> Iterator for HeapIterator<'_, '_, S> {
    type Item = Entry<S::Key>;

    fn next(&mut self) -> Option<Self::Item> {
        let grouper = &mut *self.grouper;
        let (table, layout) = grouper.table.table_mut();
        let mut ctx = BucketHeapContext {
            table,
            layout,
            key_serde: &grouper.key_serde,
            comparator: &grouper.heap_comparator,
        };
        let offset = grouper.heap.remove_min(&mut ctx)?;
        Some(grouper.entry_at(offset))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.grouper.heap.heap_size();
        (remaining, Some(remaining))
    }
}

/// Reads the heap after it is sorted by the keys
struct SortedIterator<'g, 'a, S: KeySerde> {
    grouper: &'g LimitedBufferGrouper<'a, S>,
    index: usize,
}

impl<S: KeySerde> Iterator for SortedIterator<'_, '_, S> {
    type Item = Entry<S::Key>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.grouper.heap.heap_size() {
            return None;
        }
        let offset = self.grouper.heap.offset_at(self.index);
        self.index += 1;
        Some(self.grouper.entry_at(offset))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.grouper.heap.heap_size() - self.index;
        (remaining, Some(remaining))
    }
}
