//! Groupers aggregate rows by their grouping keys into the buckets stored in a byte
//! buffer.
//!
//! # Concepts
//!
//! - `Key`: typed grouping key of a row. The grouper never stores it directly, the
//! [`KeySerde`] encodes it into a fixed width byte window before probing.
//!
//! - `Bucket`: fixed size region of the buffer that holds the hash, the encoded key,
//! the aggregation states and some bookkeeping of a single group.
//!
//! - `Limit push down`: when the query only asks for the first `limit` groups in some
//! order, the grouper tracks the best groups with a bounded heap and is free to drop
//! the others when it runs out of space.

pub mod heap;
pub mod limited_buffer_grouper;
pub mod row_based;

use std::cmp::Ordering;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use snafu::Snafu;

use crate::common::types::HashValue;
use crate::common::utils::hash::hash_key;
use crate::exec::aggregator::AggregatorFactory;
use crate::exec::row::Value;

#[allow(missing_docs)]
#[derive(Debug, Snafu)]
pub enum GrouperError {
    #[snafu(display("Invalid max load factor `{max_load_factor}`, it must be < 1.0"))]
    InvalidMaxLoadFactor { max_load_factor: f32 },
    #[snafu(display("Invalid limit `{limit}`, the limit pushed down must be positive"))]
    InvalidLimit { limit: usize },
    #[snafu(display(
        "Buffer capacity `{capacity}` is too small, minimum bytes needed: `{required}`"
    ))]
    BufferTooSmall { capacity: usize, required: usize },
    #[snafu(display(
        "Buffer capacity `{capacity}` is too large, bucket offsets must fit in 31 bits"
    ))]
    BufferTooLarge { capacity: usize },
    #[snafu(display(
        "Encoded key has `{actual}` bytes, however the key serde declares key size `{expect}`"
    ))]
    KeySizeMismatch { expect: usize, actual: usize },
    #[snafu(display(
        "Can not find a bucket for the heap entry `{heap_index}` while swapping the tables, table has `{buckets}` buckets"
    ))]
    SwapLostBucket { heap_index: usize, buckets: usize },
    #[snafu(display("Cannot order by a non-numeric aggregator `{aggregator}`"))]
    NonNumericOrderBy { aggregator: String },
    #[snafu(display("Limit push down is requested but the query does not have a limit spec"))]
    LimitPushDownWithoutLimit,
    #[snafu(display(
        "Limit push down is not applicable to the query, the limited grouper can not be used"
    ))]
    LimitPushDownNotApplicable,
}

/// Result type of the grouper
pub type Result<T> = std::result::Result<T, GrouperError>;

/// A group produced by the grouper
#[derive(Debug, Clone, PartialEq)]
pub struct Entry<K> {
    /// Grouping key
    pub key: K,
    /// Values of the aggregators, in the order of the aggregator factories
    pub values: Vec<Value>,
}

impl<K> Entry<K> {
    /// Create a new entry
    pub fn new(key: K, values: Vec<Value>) -> Self {
        Self { key, values }
    }
}

/// Grouper aggregates rows into groups
///
/// The grouper is not thread-safe. After [`Grouper::iterator`] is called, caller should
/// not aggregate into the grouper again without a [`Grouper::reset`]
pub trait Grouper: Debug {
    /// Grouping key
    type Key: Hash;

    /// Aggregate the current row into the group of `key`. `hash` is the hash of the key,
    /// it must be a non-negative 31-bit value.
    ///
    /// Returns `Ok(false)` if the grouper runs out of resources (buffer space or
    /// dictionary space) and the row is not aggregated. An `Err` is fatal.
    fn aggregate_with_hash(&mut self, key: &Self::Key, hash: HashValue) -> Result<bool>;

    /// Aggregate the current row into the group of `key`, see
    /// [`Grouper::aggregate_with_hash`]
    fn aggregate(&mut self, key: &Self::Key) -> Result<bool> {
        self.aggregate_with_hash(key, hash_key(key))
    }

    /// Clear all of the groups and make the grouper reusable. It does not reopen a
    /// closed grouper
    fn reset(&mut self);

    /// Iterate the groups. Groupers that always produce sorted entries ignore `sorted`
    fn iterator(&mut self, sorted: bool) -> Box<dyn Iterator<Item = Entry<Self::Key>> + '_>;

    /// Release the resources held by the aggregators. Calling it more than once is a
    /// no-op. A closed grouper must not be used again, [`Grouper::reset`] does not
    /// reopen it
    fn close(&mut self);
}

/// Encode and decode the grouping keys and compare the encoded keys
pub trait KeySerde: Debug {
    /// Grouping key
    type Key;

    /// Comparator over the encoded keys. It is resolved once and applied with
    /// [`KeySerde::compare`]
    type Comparator: Debug;

    /// Size of the encoded key in bytes
    fn key_size(&self) -> usize;

    /// Encode the key. Returns `None` if the key can not be encoded because some
    /// resource limit is reached
    fn to_bytes(&mut self, key: &Self::Key) -> Option<&[u8]>;

    /// Decode the key stored at `position`
    fn from_bytes(&self, buffer: &[u8], position: usize) -> Self::Key;

    /// Comparator that orders the encoded keys by the natural order of the grouping
    /// key
    fn buffer_comparator(&mut self) -> Self::Comparator;

    /// Comparator that orders the buckets by the query's sort columns, which may
    /// contain the aggregators. `aggregator_offsets` are the offsets of the aggregator
    /// states relative to the start of the encoded key
    fn buffer_comparator_with_aggregators(
        &self,
        aggregator_factories: &[Arc<dyn AggregatorFactory>],
        aggregator_offsets: &[usize],
    ) -> Result<Self::Comparator>;

    /// Compare the keys stored at `lhs_position` and `rhs_position` with a comparator
    /// created by this serde
    fn compare(
        &self,
        comparator: &Self::Comparator,
        lhs_buffer: &[u8],
        lhs_position: usize,
        rhs_buffer: &[u8],
        rhs_position: usize,
    ) -> Ordering;

    /// Clear the encoding state
    fn reset(&mut self);
}

/// Comparator over the decoded entries
pub type EntryComparator<K> = Box<dyn Fn(&Entry<K>, &Entry<K>) -> Ordering + Send + Sync>;

/// Factory of the [`KeySerde`]. Each grouper owns its serde, the encoding state is
/// never shared
pub trait KeySerdeFactory: Debug {
    /// Serde produced by the factory
    type Serde: KeySerde;

    /// Create a new serde
    fn factorize(&self) -> Self::Serde;

    /// Comparator over the decoded entries. It follows the query's sort columns unless
    /// `force_default_order` is true
    fn object_comparator(
        &self,
        force_default_order: bool,
    ) -> EntryComparator<<Self::Serde as KeySerde>::Key>;
}
