//! Count aggregator

use crate::common::utils::bytes::{read_i64, write_i64};
use crate::exec::row::{RowColumnSelectorFactory, Value};

use super::{AggregatorFactory, BufferAggregator, ValueType};

/// Aggregator that counts the number of rows in the group
#[derive(Debug, Clone)]
pub struct Count {
    name: String,
}

impl Count {
    /// Create a new count aggregator
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl AggregatorFactory for Count {
    fn name(&self) -> &str {
        &self.name
    }

    fn value_type(&self) -> ValueType {
        ValueType::Long
    }

    fn max_intermediate_size(&self) -> usize {
        std::mem::size_of::<i64>()
    }

    fn factorize_buffered(
        &self,
        _selectors: &RowColumnSelectorFactory,
    ) -> Box<dyn BufferAggregator> {
        Box::new(CountBufferAggregator)
    }
}

#[derive(Debug)]
struct CountBufferAggregator;

impl BufferAggregator for CountBufferAggregator {
    #[inline]
    fn init(&self, buffer: &mut [u8], position: usize) {
        write_i64(buffer, position, 0);
    }

    #[inline]
    fn aggregate(&self, buffer: &mut [u8], position: usize) {
        write_i64(buffer, position, read_i64(buffer, position) + 1);
    }

    fn get(&self, buffer: &[u8], position: usize) -> Value {
        Value::Long(read_i64(buffer, position))
    }
}
