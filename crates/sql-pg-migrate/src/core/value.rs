//! SQL value types carried from source rows to target inserts.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use uuid::Uuid;

/// A single column value read from the source.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Decimal(Decimal),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    DateTimeOffset(DateTime<FixedOffset>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Build a text value, mapping `None` to NULL.
    pub fn text_or_null(value: Option<String>) -> Self {
        value.map(SqlValue::Text).unwrap_or(SqlValue::Null)
    }
}

/// One source row, values in column ordinal order.
pub type Row = Vec<SqlValue>;

/// A fixed-size group of rows read through the source cursor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub rows: Vec<Row>,
}

impl Batch {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_value_is_null() {
        assert!(SqlValue::Null.is_null());
        assert!(!SqlValue::I32(42).is_null());
        assert!(SqlValue::text_or_null(None).is_null());
        assert_eq!(
            SqlValue::text_or_null(Some("a".into())),
            SqlValue::Text("a".into())
        );
    }

    #[test]
    fn test_batch_operations() {
        let batch = Batch::new(vec![
            vec![SqlValue::I32(1), SqlValue::Text("a".to_string())],
            vec![SqlValue::I32(2), SqlValue::Text("b".to_string())],
        ]);

        assert_eq!(batch.len(), 2);
        assert!(!batch.is_empty());
        assert!(Batch::default().is_empty());
    }
}
