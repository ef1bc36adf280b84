//! Aggregators that keep their states in the buckets of the grouper
//!
//! An [`AggregatorFactory`] describes the aggregator: its output name, its value type
//! and the max number of bytes its state needs. The grouper lays the states of all of
//! the aggregators out in the bucket, one after another, and hands the position of
//! each state to the [`BufferAggregator`] created by the factory. The aggregator reads
//! the row currently being aggregated through the selectors it captured at creation.

pub mod count;
pub mod min_max;
pub mod sum;

use std::fmt::Debug;

use num_traits::{Bounded, Num, WrappingAdd};

use crate::common::utils::bytes::{read_f32, read_f64, read_i64, write_f32, write_f64, write_i64};
use crate::error::SendableError;
use crate::exec::row::{ColumnSelector, RowColumnSelectorFactory, Value};

/// Type of the value produced by the aggregator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// 64-bit integer
    Long,
    /// 32-bit float
    Float,
    /// 64-bit float
    Double,
    /// Non-numeric value, can not be sorted
    Complex,
}

/// Description of an aggregator
pub trait AggregatorFactory: Debug + Send + Sync {
    /// Output name of the aggregator
    fn name(&self) -> &str;

    /// Type of the value produced by the aggregator
    fn value_type(&self) -> ValueType;

    /// Max number of bytes used by the state of the aggregator
    fn max_intermediate_size(&self) -> usize;

    /// Create an aggregator that reads the input from `selectors`
    fn factorize_buffered(&self, selectors: &RowColumnSelectorFactory)
    -> Box<dyn BufferAggregator>;
}

/// Aggregator that keeps its state in a byte buffer. `position` is the start of the
/// state and the aggregator must not touch bytes outside of
/// [`AggregatorFactory::max_intermediate_size`]
pub trait BufferAggregator: Debug {
    /// Initialize the state
    fn init(&self, buffer: &mut [u8], position: usize);

    /// Fold the current row into the state
    fn aggregate(&self, buffer: &mut [u8], position: usize);

    /// Read the value of the state
    fn get(&self, buffer: &[u8], position: usize) -> Value;

    /// Release the resources held by the aggregator
    fn close(&mut self) -> Result<(), SendableError> {
        Ok(())
    }
}

/// Numeric types that can be stored as aggregator state
pub trait NumericType: Copy + Debug + Send + Sync + PartialOrd + Num + Bounded + 'static {
    /// Value type of the aggregators that produce this type
    const VALUE_TYPE: ValueType;

    /// Size of the state
    const SIZE: usize = std::mem::size_of::<Self>();

    /// Read the state stored at `position`
    fn read(buffer: &[u8], position: usize) -> Self;

    /// Write the state to `position`
    fn write(buffer: &mut [u8], position: usize, value: Self);

    /// Read the current row from the selector
    fn select(selector: &ColumnSelector) -> Self;

    /// Convert to the output value
    fn into_value(self) -> Value;

    /// Add without overflow checks. Integers wrap around
    fn sum(self, rhs: Self) -> Self;
}

macro_rules! impl_numeric_type {
    ($ty:ident, $variant:ident, $getter:ident, $sum:expr) => {
        paste::paste! {
            impl NumericType for $ty {
                const VALUE_TYPE: ValueType = ValueType::$variant;

                #[inline]
                fn read(buffer: &[u8], position: usize) -> Self {
                    [<read_ $ty>](buffer, position)
                }

                #[inline]
                fn write(buffer: &mut [u8], position: usize, value: Self) {
                    [<write_ $ty>](buffer, position, value)
                }

                #[inline]
                fn select(selector: &ColumnSelector) -> Self {
                    selector.$getter()
                }

                #[inline]
                fn into_value(self) -> Value {
                    Value::$variant(self)
                }

                #[inline]
                fn sum(self, rhs: Self) -> Self {
                    $sum(self, rhs)
                }
            }
        }
    };
}

impl_numeric_type!(i64, Long, as_long, |lhs: i64, rhs| WrappingAdd::wrapping_add(&lhs, &rhs));
impl_numeric_type!(f32, Float, as_float, |lhs: f32, rhs| lhs + rhs);
impl_numeric_type!(f64, Double, as_double, |lhs: f64, rhs| lhs + rhs);

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::exec::row::Row;

    /// Run the aggregator over `values` of the column `field` and return the result
    pub(crate) fn aggregate_values(
        factory: &dyn AggregatorFactory,
        field: &str,
        values: Vec<Value>,
    ) -> Value {
        let selectors = RowColumnSelectorFactory::new();
        let aggregator = factory.factorize_buffered(&selectors);
        // Unaligned position on purpose
        let position = 3;
        let mut buffer = vec![0; position + factory.max_intermediate_size()];
        aggregator.init(&mut buffer, position);
        for value in values {
            selectors.set_row(Some(Row::new(0, [(field, value)])));
            aggregator.aggregate(&mut buffer, position);
        }
        aggregator.get(&buffer, position)
    }
}
