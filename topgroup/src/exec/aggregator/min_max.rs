//! Min/Max aggregator

use std::marker::PhantomData;

use crate::exec::row::{ColumnSelector, RowColumnSelectorFactory, Value};

use super::{AggregatorFactory, BufferAggregator, NumericType, ValueType};

/// Min of the 64-bit integers
pub type LongMin = MinMax<true, i64>;
/// Max of the 64-bit integers
pub type LongMax = MinMax<false, i64>;
/// Min of the 64-bit floats
pub type DoubleMin = MinMax<true, f64>;
/// Max of the 64-bit floats
pub type DoubleMax = MinMax<false, f64>;

/// Min/Max aggregator
///
/// FIXME: `NaN` never replaces the state and is never replaced by the following values
/// once it is the state
///
/// # Generic
///
/// - `IS_MIN`: If it is true, it will be min aggregator
/// - `T`: Type of the state
#[derive(Debug, Clone)]
pub struct MinMax<const IS_MIN: bool, T> {
    name: String,
    field_name: String,
    _phantom: PhantomData<T>,
}

impl<const IS_MIN: bool, T: NumericType> MinMax<IS_MIN, T> {
    /// Create a new min/max aggregator
    pub fn new(name: impl Into<String>, field_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_name: field_name.into(),
            _phantom: PhantomData,
        }
    }
}

impl<const IS_MIN: bool, T: NumericType> AggregatorFactory for MinMax<IS_MIN, T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn value_type(&self) -> ValueType {
        T::VALUE_TYPE
    }

    fn max_intermediate_size(&self) -> usize {
        T::SIZE
    }

    fn factorize_buffered(
        &self,
        selectors: &RowColumnSelectorFactory,
    ) -> Box<dyn BufferAggregator> {
        Box::new(MinMaxBufferAggregator::<IS_MIN, T> {
            selector: selectors.make_column_selector(&self.field_name),
            _phantom: PhantomData,
        })
    }
}

#[derive(Debug)]
struct MinMaxBufferAggregator<const IS_MIN: bool, T> {
    selector: ColumnSelector,
    _phantom: PhantomData<T>,
}

impl<const IS_MIN: bool, T: NumericType> BufferAggregator for MinMaxBufferAggregator<IS_MIN, T> {
    #[inline]
    fn init(&self, buffer: &mut [u8], position: usize) {
        let init = if IS_MIN {
            T::max_value()
        } else {
            T::min_value()
        };
        T::write(buffer, position, init);
    }

    #[inline]
    fn aggregate(&self, buffer: &mut [u8], position: usize) {
        let value = T::select(&self.selector);
        let state = T::read(buffer, position);
        let replace = if IS_MIN {
            value < state
        } else {
            value > state
        };
        if replace {
            T::write(buffer, position, value);
        }
    }

    fn get(&self, buffer: &[u8], position: usize) -> Value {
        T::read(buffer, position).into_value()
    }
}
