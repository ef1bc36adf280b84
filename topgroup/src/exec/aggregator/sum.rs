//! Sum aggregator

use std::marker::PhantomData;

use crate::exec::row::{ColumnSelector, RowColumnSelectorFactory, Value};

use super::{AggregatorFactory, BufferAggregator, NumericType, ValueType};

/// Sum of the 64-bit integers
pub type LongSum = Sum<i64>;
/// Sum of the 32-bit floats
pub type FloatSum = Sum<f32>;
/// Sum of the 64-bit floats
pub type DoubleSum = Sum<f64>;

/// Aggregator that sums the `field_name` column. Missing values are zero
#[derive(Debug, Clone)]
pub struct Sum<T> {
    name: String,
    field_name: String,
    _phantom: PhantomData<T>,
}

impl<T: NumericType> Sum<T> {
    /// Create a new sum aggregator
    pub fn new(name: impl Into<String>, field_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_name: field_name.into(),
            _phantom: PhantomData,
        }
    }
}

impl<T: NumericType> AggregatorFactory for Sum<T> {
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
        Box::new(SumBufferAggregator::<T> {
            selector: selectors.make_column_selector(&self.field_name),
            _phantom: PhantomData,
        })
    }
}

#[derive(Debug)]
struct SumBufferAggregator<T> {
    selector: ColumnSelector,
    _phantom: PhantomData<T>,
}

impl<T: NumericType> BufferAggregator for SumBufferAggregator<T> {
    #[inline]
    fn init(&self, buffer: &mut [u8], position: usize) {
        T::write(buffer, position, T::zero());
    }

    #[inline]
    fn aggregate(&self, buffer: &mut [u8], position: usize) {
        let sum = T::read(buffer, position).sum(T::select(&self.selector));
        T::write(buffer, position, sum);
    }

    fn get(&self, buffer: &[u8], position: usize) -> Value {
        T::read(buffer, position).into_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::aggregator::tests::aggregate_values;

    #[test]
    fn test_sum() {
        let values = vec![
            Value::Long(3),
            Value::Null,
            Value::String("4".into()),
            Value::Double(2.5),
        ];
        assert_eq!(
            aggregate_values(&LongSum::new("sum", "v"), "v", values.clone()),
            Value::Long(9)
        );
        assert_eq!(
            aggregate_values(&DoubleSum::new("sum", "v"), "v", values.clone()),
            Value::Double(9.5)
        );
        assert_eq!(
            aggregate_values(&FloatSum::new("sum", "v"), "v", values),
            Value::Float(9.5)
        );
        assert_eq!(FloatSum::new("sum", "v").max_intermediate_size(), 4);
    }

    #[test]
    fn test_long_sum_wraps_on_overflow() {
        let values = vec![Value::Long(i64::MAX), Value::Long(1)];
        assert_eq!(
            aggregate_values(&LongSum::new("sum", "v"), "v", values),
            Value::Long(i64::MIN)
        );
    }
}
