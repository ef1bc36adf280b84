//! Input rows and the selectors that read the row being aggregated

use std::fmt::Display;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

/// Value of a column in the row
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Missing value
    Null,
    /// 64-bit integer
    Long(i64),
    /// 32-bit float
    Float(f32),
    /// 64-bit float
    Double(f64),
    /// String
    String(String),
    /// Multi-valued string
    Strings(Vec<String>),
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Long(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v}"),
            Self::Strings(values) => write!(f, "[{}]", values.join(", ")),
        }
    }
}

macro_rules! impl_numeric_getter {
    ($func:ident, $ty:ty) => {
        /// Read the value as number. Strings are parsed, missing and unparsable values
        /// are zero
        pub fn $func(&self) -> $ty {
            match self {
                Self::Null => 0 as $ty,
                Self::Long(v) => *v as $ty,
                Self::Float(v) => *v as $ty,
                Self::Double(v) => *v as $ty,
                Self::String(v) => v.trim().parse::<$ty>().unwrap_or(0 as $ty),
                Self::Strings(values) => values
                    .first()
                    .and_then(|v| v.trim().parse::<$ty>().ok())
                    .unwrap_or(0 as $ty),
            }
        }
    };
}

impl Value {
    impl_numeric_getter!(as_long, i64);
    impl_numeric_getter!(as_float, f32);
    impl_numeric_getter!(as_double, f64);

    /// Value used as the grouping dimension. Only the first value of a multi-valued
    /// string is used, missing values and empty multi-values become the empty string
    pub fn to_dimension(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::String(v) => v.clone(),
            Self::Strings(values) => values.first().cloned().unwrap_or_default(),
            _ => self.to_string(),
        }
    }
}

/// Input row
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    timestamp: i64,
    event: HashMap<String, Value>,
}

impl Row {
    /// Create a row with timestamp in milliseconds
    pub fn new<I, S>(timestamp: i64, columns: I) -> Self
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        Self {
            timestamp,
            event: columns
                .into_iter()
                .map(|(name, value)| (name.into(), value))
                .collect(),
        }
    }

    /// Timestamp of the row in milliseconds
    #[inline]
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Value of the column, `None` if the row does not have it
    #[inline]
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.event.get(column)
    }

    /// Value of the column as grouping dimension
    pub fn dimension(&self, column: &str) -> String {
        self.get(column).map(Value::to_dimension).unwrap_or_default()
    }
}

/// Row currently being aggregated. The accumulator writes it and the column selectors
/// read it
type Cursor = Arc<RwLock<Option<Row>>>;

/// Factory of the column selectors over the row currently being aggregated
#[derive(Debug, Clone, Default)]
pub struct RowColumnSelectorFactory {
    cursor: Cursor,
}

impl RowColumnSelectorFactory {
    /// Create a new factory without current row
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `row` the current row, returns the previous one
    pub fn set_row(&self, row: Option<Row>) -> Option<Row> {
        std::mem::replace(&mut *self.cursor.write(), row)
    }

    /// Create a selector that reads `column` of the current row
    pub fn make_column_selector(&self, column: impl Into<String>) -> ColumnSelector {
        ColumnSelector {
            column: column.into(),
            cursor: Arc::clone(&self.cursor),
        }
    }
}

/// Selector that reads a single column of the current row
#[derive(Debug, Clone)]
pub struct ColumnSelector {
    column: String,
    cursor: Cursor,
}

macro_rules! impl_selector_getter {
    ($func:ident, $ty:ty) => {
        #[doc = concat!("Read the column of the current row as `", stringify!($ty), "`")]
        #[inline]
        pub fn $func(&self) -> $ty {
            self.cursor
                .read()
                .as_ref()
                .and_then(|row| row.get(&self.column))
                .map_or(0 as $ty, Value::$func)
        }
    };
}

impl ColumnSelector {
    impl_selector_getter!(as_long, i64);
    impl_selector_getter!(as_float, f32);
    impl_selector_getter!(as_double, f64);
}
