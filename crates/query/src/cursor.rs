//! Row cursors and the SQL value model.
//!
//! A [`RowCursor`] is a forward-only stream of typed rows pulled from a data
//! source. Values are carried in a source-neutral form ([`SqlValue`]) chosen
//! to map losslessly onto both the ndjson and the Arrow encoders.

use crate::error::{QueryError, QueryResult};
use async_trait::async_trait;
use std::collections::VecDeque;

/// Logical column type of a result column.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    /// Fixed-point decimal; precision and scale live on [`ColumnMeta`].
    Decimal,
    /// Calendar date, carried as days since the Unix epoch.
    Date,
    /// Time of day, carried as milliseconds since midnight.
    Time,
    /// Timestamp without time zone, milliseconds since the Unix epoch.
    Timestamp,
    /// Timestamp with time zone, normalized to UTC milliseconds.
    TimestampTz,
    Text,
    Binary,
}

/// Metadata for one result column.
#[derive(Clone, Debug)]
pub struct ColumnMeta {
    pub name: String,
    pub ty: ColumnType,
    pub nullable: bool,
    /// Decimal precision; ignored for other types.
    pub precision: u8,
    /// Decimal scale; ignored for other types.
    pub scale: i8,
}

impl ColumnMeta {
    pub fn new(name: impl Into<String>, ty: ColumnType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable,
            precision: 0,
            scale: 0,
        }
    }

    pub fn decimal(name: impl Into<String>, nullable: bool, precision: u8, scale: i8) -> Self {
        Self {
            name: name.into(),
            ty: ColumnType::Decimal,
            nullable,
            precision,
            scale,
        }
    }
}

/// One cell of a result row.
#[derive(Clone, Debug, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    /// Unscaled decimal mantissa; the column's scale applies.
    Decimal(i128),
    /// Days since 1970-01-01.
    DateDays(i32),
    /// Milliseconds since midnight.
    TimeMillis(i32),
    /// Milliseconds since the Unix epoch.
    TimestampMillis(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

/// Forward-only cursor over a query result.
#[async_trait]
pub trait RowCursor: Send {
    /// Column metadata, fixed for the lifetime of the cursor.
    fn columns(&self) -> &[ColumnMeta];

    /// Fetch the next row, or `None` when the result is exhausted.
    async fn next_row(&mut self) -> QueryResult<Option<Vec<SqlValue>>>;
}

/// In-memory cursor over pre-built rows.
pub struct MemoryCursor {
    columns: Vec<ColumnMeta>,
    rows: VecDeque<Vec<SqlValue>>,
}

impl MemoryCursor {
    pub fn new(columns: Vec<ColumnMeta>, rows: Vec<Vec<SqlValue>>) -> Self {
        Self {
            columns,
            rows: rows.into(),
        }
    }
}

#[async_trait]
impl RowCursor for MemoryCursor {
    fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    async fn next_row(&mut self) -> QueryResult<Option<Vec<SqlValue>>> {
        match self.rows.pop_front() {
            Some(row) => {
                if row.len() != self.columns.len() {
                    return Err(QueryError::Encode(format!(
                        "row has {} values for {} columns",
                        row.len(),
                        self.columns.len()
                    )));
                }
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_cursor_drains_in_order() {
        let columns = vec![ColumnMeta::new("id", ColumnType::I64, false)];
        let mut cursor = MemoryCursor::new(
            columns,
            vec![vec![SqlValue::I64(1)], vec![SqlValue::I64(2)]],
        );

        assert_eq!(
            cursor.next_row().await.unwrap(),
            Some(vec![SqlValue::I64(1)])
        );
        assert_eq!(
            cursor.next_row().await.unwrap(),
            Some(vec![SqlValue::I64(2)])
        );
        assert_eq!(cursor.next_row().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_cursor_rejects_ragged_rows() {
        let columns = vec![
            ColumnMeta::new("id", ColumnType::I64, false),
            ColumnMeta::new("name", ColumnType::Text, true),
        ];
        let mut cursor = MemoryCursor::new(columns, vec![vec![SqlValue::I64(1)]]);
        assert!(cursor.next_row().await.is_err());
    }
}
