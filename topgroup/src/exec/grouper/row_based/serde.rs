//! Serde of the [`RowBasedKey`]
//!
//! The encoded key is an optional 8-byte timestamp followed by a 4-byte dictionary id
//! for each string dimension. Ids are assigned in insertion order, therefore they can
//! not be compared directly. The default comparator compares the "sortable ids", the
//! rank of the dictionary value among all of the values, which are rebuilt lazily. When
//! the limit is pushed down the dictionary keeps growing while the heap compares the
//! buckets, in this case the dimensions are compared by their dictionary values.

use std::cmp::Ordering;
use std::sync::Arc;

use hashbrown::HashMap;

use super::RowBasedKey;
use crate::common::utils::bytes::{read_f32, read_f64, read_i64, read_u32};
use crate::common::utils::hash::{BUILD_HASHER_DEFAULT, BuildHasherDefault};
use crate::exec::aggregator::{AggregatorFactory, ValueType};
use crate::exec::grouper::{
    Entry, EntryComparator, KeySerde, KeySerdeFactory, NonNumericOrderBySnafu, Result,
};
use crate::exec::query::{DefaultLimitSpec, DimensionSpec, Direction};
use crate::exec::row::Value;

/// Estimated bytes used by a dictionary entry besides the string itself: the entry in
/// the dictionary and the node in the reverse dictionary
pub const ROUGH_OVERHEAD_PER_DICTIONARY_ENTRY: usize = 8 * 5 + 4;

const TIMESTAMP_SIZE: usize = std::mem::size_of::<i64>();
const DICTIONARY_ID_SIZE: usize = std::mem::size_of::<u32>();

/// Append-only dictionary of the dimension values with a budget on its estimated size
#[derive(Debug)]
struct Dictionary {
    values: Vec<String>,
    ids: HashMap<String, u32, BuildHasherDefault>,
    estimated_size: usize,
    max_size: usize,
}

impl Dictionary {
    fn new(max_size: usize) -> Self {
        Self {
            values: Vec::new(),
            ids: HashMap::with_hasher(BUILD_HASHER_DEFAULT),
            estimated_size: 0,
            max_size,
        }
    }

    /// Id of the `value`, insert it if it is absent. Returns `None` if the insertion
    /// exceeds the budget
    fn get_or_insert(&mut self, value: &str) -> Option<u32> {
        if let Some(&id) = self.ids.get(value) {
            return Some(id);
        }

        // Strings are estimated as UTF-16 to keep the budget compatible with the
        // configured sizes
        let additional = value.encode_utf16().count() * 2 + ROUGH_OVERHEAD_PER_DICTIONARY_ENTRY;
        if self.estimated_size + additional > self.max_size {
            return None;
        }

        let id = self.values.len() as u32;
        self.values.push(value.to_owned());
        self.ids.insert(value.to_owned(), id);
        self.estimated_size += additional;
        Some(id)
    }

    #[inline]
    fn get(&self, id: u32) -> &str {
        &self.values[id as usize]
    }

    #[inline]
    fn len(&self) -> usize {
        self.values.len()
    }

    fn clear(&mut self) {
        self.values.clear();
        self.ids.clear();
        self.estimated_size = 0;
    }
}

/// Where the timestamp is compared
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimestampOrder {
    /// The key does not have timestamp
    Excluded,
    /// Timestamp is compared before the other fields
    First,
    /// Timestamp is compared after the other fields
    Last,
}

impl TimestampOrder {
    fn new(include_timestamp: bool, sort_by_dims_first: bool) -> Self {
        match (include_timestamp, sort_by_dims_first) {
            (false, _) => Self::Excluded,
            (true, false) => Self::First,
            (true, true) => Self::Last,
        }
    }

    #[inline]
    fn then<T, F>(self, timestamp: T, fields: F) -> Ordering
    where
        T: FnOnce() -> Ordering,
        F: FnOnce() -> Ordering,
    {
        match self {
            Self::Excluded => fields(),
            Self::First => match timestamp() {
                Ordering::Equal => fields(),
                ordering => ordering,
            },
            Self::Last => match fields() {
                Ordering::Equal => timestamp(),
                ordering => ordering,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    /// Dictionary id compared by its rank
    SortableId,
    /// Dictionary id compared by its value
    DictionaryValue,
    Long,
    Float,
    Double,
}

#[derive(Debug, Clone, Copy)]
struct FieldComparator {
    kind: FieldKind,
    /// Position of the field relative to the start of the key
    position: usize,
    descending: bool,
}

/// Comparator over the encoded [`RowBasedKey`]s, created by the [`RowBasedKeySerde`]
#[derive(Debug, Clone)]
pub struct RowBasedKeyComparator {
    timestamp: TimestampOrder,
    fields: Vec<FieldComparator>,
}

/// [`KeySerde`] of the [`RowBasedKey`]
#[derive(Debug)]
pub struct RowBasedKeySerde {
    include_timestamp: bool,
    sort_by_dims_first: bool,
    dimensions: Arc<[DimensionSpec]>,
    limit_spec: Option<Arc<DefaultLimitSpec>>,
    dictionary: Dictionary,
    /// Rank of each dictionary id among the dictionary values
    sortable_ids: Vec<u32>,
    key_buffer: Vec<u8>,
    key_size: usize,
}

impl RowBasedKeySerde {
    /// Create a new serde. Dimensions are compared by dictionary values when the
    /// `limit_spec` is provided
    pub fn new(
        include_timestamp: bool,
        sort_by_dims_first: bool,
        dimensions: Arc<[DimensionSpec]>,
        max_dictionary_size: usize,
        limit_spec: Option<Arc<DefaultLimitSpec>>,
    ) -> Self {
        let key_size = if include_timestamp { TIMESTAMP_SIZE } else { 0 }
            + dimensions.len() * DICTIONARY_ID_SIZE;
        Self {
            include_timestamp,
            sort_by_dims_first,
            dimensions,
            limit_spec,
            dictionary: Dictionary::new(max_dictionary_size),
            sortable_ids: Vec::new(),
            key_buffer: Vec::with_capacity(key_size),
            key_size,
        }
    }

    /// Number of distinct values in the dictionary
    pub fn dictionary_len(&self) -> usize {
        self.dictionary.len()
    }

    /// Estimated size of the dictionary in bytes
    pub fn dictionary_estimated_size(&self) -> usize {
        self.dictionary.estimated_size
    }

    #[inline]
    fn dimension_position(&self, index: usize) -> usize {
        let start = if self.include_timestamp {
            TIMESTAMP_SIZE
        } else {
            0
        };
        start + index * DICTIONARY_ID_SIZE
    }

    #[inline]
    fn dimension_kind(&self) -> FieldKind {
        if self.limit_spec.is_some() {
            FieldKind::DictionaryValue
        } else {
            FieldKind::SortableId
        }
    }

    fn timestamp_order(&self) -> TimestampOrder {
        TimestampOrder::new(self.include_timestamp, self.sort_by_dims_first)
    }

    fn dimension_field(&self, index: usize, descending: bool) -> FieldComparator {
        FieldComparator {
            kind: self.dimension_kind(),
            position: self.dimension_position(index),
            descending,
        }
    }

    fn default_comparator(&self) -> RowBasedKeyComparator {
        RowBasedKeyComparator {
            timestamp: self.timestamp_order(),
            fields: (0..self.dimensions.len())
                .map(|index| self.dimension_field(index, false))
                .collect(),
        }
    }

    /// Rebuild the sortable ids if the dictionary grew since they were built
    fn refresh_sortable_ids(&mut self) {
        if self.sortable_ids.len() == self.dictionary.len() {
            return;
        }

        let mut ids = (0..self.dictionary.len() as u32).collect::<Vec<_>>();
        ids.sort_unstable_by(|&lhs, &rhs| self.dictionary.get(lhs).cmp(self.dictionary.get(rhs)));
        self.sortable_ids = vec![0; ids.len()];
        ids.into_iter()
            .enumerate()
            .for_each(|(rank, id)| self.sortable_ids[id as usize] = rank as u32);
    }

    fn compare_dictionary_ids(&self, kind: FieldKind, lhs: u32, rhs: u32) -> Ordering {
        if kind == FieldKind::SortableId {
            if let (Some(lhs), Some(rhs)) = (
                self.sortable_ids.get(lhs as usize),
                self.sortable_ids.get(rhs as usize),
            ) {
                return lhs.cmp(rhs);
            }
        }
        // Ranks agree with the order of the values, ids added after the last rebuild
        // fall back to the values
        self.dictionary.get(lhs).cmp(self.dictionary.get(rhs))
    }

    fn compare_fields(
        &self,
        fields: &[FieldComparator],
        lhs_buffer: &[u8],
        lhs_position: usize,
        rhs_buffer: &[u8],
        rhs_position: usize,
    ) -> Ordering {
        for field in fields {
            let lhs = lhs_position + field.position;
            let rhs = rhs_position + field.position;
            let ordering = match field.kind {
                FieldKind::SortableId | FieldKind::DictionaryValue => self.compare_dictionary_ids(
                    field.kind,
                    read_u32(lhs_buffer, lhs),
                    read_u32(rhs_buffer, rhs),
                ),
                FieldKind::Long => read_i64(lhs_buffer, lhs).cmp(&read_i64(rhs_buffer, rhs)),
                FieldKind::Float => read_f32(lhs_buffer, lhs).total_cmp(&read_f32(rhs_buffer, rhs)),
                FieldKind::Double => {
                    read_f64(lhs_buffer, lhs).total_cmp(&read_f64(rhs_buffer, rhs))
                }
            };
            let ordering = if field.descending {
                ordering.reverse()
            } else {
                ordering
            };
            if ordering.is_ne() {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

impl KeySerde for RowBasedKeySerde {
    type Key = RowBasedKey;
    type Comparator = RowBasedKeyComparator;

    #[inline]
    fn key_size(&self) -> usize {
        self.key_size
    }

    fn to_bytes(&mut self, key: &RowBasedKey) -> Option<&[u8]> {
        self.key_buffer.clear();
        if self.include_timestamp {
            let timestamp = key.timestamp.unwrap_or_default();
            self.key_buffer.extend_from_slice(&timestamp.to_le_bytes());
        }
        for dimension in &key.dimensions {
            let id = self.dictionary.get_or_insert(dimension)?;
            self.key_buffer.extend_from_slice(&id.to_le_bytes());
        }
        Some(&self.key_buffer)
    }

    fn from_bytes(&self, buffer: &[u8], position: usize) -> RowBasedKey {
        let timestamp = self
            .include_timestamp
            .then(|| read_i64(buffer, position));
        let dimensions = (0..self.dimensions.len())
            .map(|index| {
                let id = read_u32(buffer, position + self.dimension_position(index));
                self.dictionary.get(id).to_owned()
            })
            .collect();
        RowBasedKey {
            timestamp,
            dimensions,
        }
    }

    fn buffer_comparator(&mut self) -> RowBasedKeyComparator {
        if self.limit_spec.is_none() {
            self.refresh_sortable_ids();
        }
        self.default_comparator()
    }

    fn buffer_comparator_with_aggregators(
        &self,
        aggregator_factories: &[Arc<dyn AggregatorFactory>],
        aggregator_offsets: &[usize],
    ) -> Result<RowBasedKeyComparator> {
        let Some(limit_spec) = &self.limit_spec else {
            return Ok(self.default_comparator());
        };

        let mut fields = Vec::with_capacity(limit_spec.columns.len() + self.dimensions.len());
        let mut ordered_dimensions = vec![false; self.dimensions.len()];
        for column in &limit_spec.columns {
            let descending = column.direction == Direction::Descending;
            if let Some(index) = column.dimension_index(&self.dimensions) {
                fields.push(self.dimension_field(index, descending));
                ordered_dimensions[index] = true;
            } else if let Some(index) = column.aggregator_index(aggregator_factories) {
                let factory = &aggregator_factories[index];
                let kind = match factory.value_type() {
                    ValueType::Long => FieldKind::Long,
                    ValueType::Float => FieldKind::Float,
                    ValueType::Double => FieldKind::Double,
                    ValueType::Complex => {
                        return NonNumericOrderBySnafu {
                            aggregator: factory.name(),
                        }
                        .fail();
                    }
                };
                fields.push(FieldComparator {
                    kind,
                    position: aggregator_offsets[index],
                    descending,
                });
            }
        }

        fields.extend(
            ordered_dimensions
                .iter()
                .enumerate()
                .filter(|(_, ordered)| !**ordered)
                .map(|(index, _)| self.dimension_field(index, false)),
        );

        Ok(RowBasedKeyComparator {
            timestamp: self.timestamp_order(),
            fields,
        })
    }

    fn compare(
        &self,
        comparator: &RowBasedKeyComparator,
        lhs_buffer: &[u8],
        lhs_position: usize,
        rhs_buffer: &[u8],
        rhs_position: usize,
    ) -> Ordering {
        comparator.timestamp.then(
            || read_i64(lhs_buffer, lhs_position).cmp(&read_i64(rhs_buffer, rhs_position)),
            || {
                self.compare_fields(
                    &comparator.fields,
                    lhs_buffer,
                    lhs_position,
                    rhs_buffer,
                    rhs_position,
                )
            },
        )
    }

    fn reset(&mut self) {
        self.dictionary.clear();
        self.sortable_ids.clear();
    }
}

/// Field of the decoded entry
#[derive(Debug, Clone, Copy)]
enum EntryField {
    Dimension(usize),
    Aggregator(usize),
}

fn compare_values(lhs: &Value, rhs: &Value) -> Ordering {
    match (lhs, rhs) {
        (Value::Long(lhs), Value::Long(rhs)) => lhs.cmp(rhs),
        (Value::String(lhs), Value::String(rhs)) => lhs.cmp(rhs),
        _ => lhs.as_double().total_cmp(&rhs.as_double()),
    }
}

/// Factory of the [`RowBasedKeySerde`]
#[derive(Debug)]
pub struct RowBasedKeySerdeFactory {
    include_timestamp: bool,
    sort_by_dims_first: bool,
    dimensions: Arc<[DimensionSpec]>,
    max_dictionary_size: usize,
    aggregator_factories: Vec<Arc<dyn AggregatorFactory>>,
    limit_spec: Option<Arc<DefaultLimitSpec>>,
}

impl RowBasedKeySerdeFactory {
    /// Create a new factory. `limit_spec` should only be provided when the limit is
    /// pushed down into the grouper
    pub fn new(
        include_timestamp: bool,
        sort_by_dims_first: bool,
        dimensions: Vec<DimensionSpec>,
        max_dictionary_size: usize,
        aggregator_factories: Vec<Arc<dyn AggregatorFactory>>,
        limit_spec: Option<DefaultLimitSpec>,
    ) -> Self {
        Self {
            include_timestamp,
            sort_by_dims_first,
            dimensions: dimensions.into(),
            max_dictionary_size,
            aggregator_factories,
            limit_spec: limit_spec.map(Arc::new),
        }
    }

    /// Budget of the dictionary of each serde
    pub fn max_dictionary_size(&self) -> usize {
        self.max_dictionary_size
    }

    fn entry_fields(&self, force_default_order: bool) -> Vec<(EntryField, bool)> {
        let mut fields = Vec::new();
        let mut ordered_dimensions = vec![false; self.dimensions.len()];
        if let (Some(limit_spec), false) = (&self.limit_spec, force_default_order) {
            for column in &limit_spec.columns {
                let descending = column.direction == Direction::Descending;
                if let Some(index) = column.dimension_index(&self.dimensions) {
                    fields.push((EntryField::Dimension(index), descending));
                    ordered_dimensions[index] = true;
                } else if let Some(index) = column.aggregator_index(&self.aggregator_factories) {
                    fields.push((EntryField::Aggregator(index), descending));
                }
            }
        }
        fields.extend(
            ordered_dimensions
                .iter()
                .enumerate()
                .filter(|(_, ordered)| !**ordered)
                .map(|(index, _)| (EntryField::Dimension(index), false)),
        );
        fields
    }
}

impl KeySerdeFactory for RowBasedKeySerdeFactory {
    type Serde = RowBasedKeySerde;

    fn factorize(&self) -> RowBasedKeySerde {
        RowBasedKeySerde::new(
            self.include_timestamp,
            self.sort_by_dims_first,
            Arc::clone(&self.dimensions),
            self.max_dictionary_size,
            self.limit_spec.clone(),
        )
    }

    fn object_comparator(&self, force_default_order: bool) -> EntryComparator<RowBasedKey> {
        let timestamp = TimestampOrder::new(self.include_timestamp, self.sort_by_dims_first);
        let fields = self.entry_fields(force_default_order);

        Box::new(move |lhs: &Entry<RowBasedKey>, rhs: &Entry<RowBasedKey>| {
            timestamp.then(
                || lhs.key.timestamp.cmp(&rhs.key.timestamp),
                || {
                    fields
                        .iter()
                        .map(|&(field, descending)| {
                            let ordering = match field {
                                EntryField::Dimension(index) => {
                                    lhs.key.dimensions[index].cmp(&rhs.key.dimensions[index])
                                }
                                EntryField::Aggregator(index) => {
                                    compare_values(&lhs.values[index], &rhs.values[index])
                                }
                            };
                            if descending {
                                ordering.reverse()
                            } else {
                                ordering
                            }
                        })
                        .find(|ordering| ordering.is_ne())
                        .unwrap_or(Ordering::Equal)
                },
            )
        })
    }
}
