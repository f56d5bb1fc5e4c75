//! Arrow IPC columnar encoding.
//!
//! Maps the SQL value model onto a fixed Arrow type table and writes results
//! as Arrow IPC streams (schema, record batches, end-of-stream marker). Used
//! two ways: [`encode_cursor`] drains a whole cursor into one stream, and
//! [`ArrowChunkEncoder`] plugs into the chunk writer so every chunk is a
//! self-contained stream a reader can decode on its own.

use crate::cursor::{ColumnMeta, ColumnType, RowCursor, SqlValue};
use crate::encode::RowEncoder;
use crate::error::{QueryError, QueryResult};
use arrow::array::{
    ArrayRef, BinaryBuilder, BooleanBuilder, Date32Builder, Decimal128Builder, Float32Builder,
    Float64Builder, Int8Builder, Int16Builder, Int32Builder, Int64Builder, StringBuilder,
    Time32MillisecondBuilder, TimestampMillisecondBuilder,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

fn arrow_err(e: arrow::error::ArrowError) -> QueryError {
    QueryError::Encode(e.to_string())
}

/// The fixed SQL-to-Arrow type table.
fn arrow_type(column: &ColumnMeta) -> DataType {
    match column.ty {
        ColumnType::Bool => DataType::Boolean,
        ColumnType::I8 => DataType::Int8,
        ColumnType::I16 => DataType::Int16,
        ColumnType::I32 => DataType::Int32,
        ColumnType::I64 => DataType::Int64,
        ColumnType::F32 => DataType::Float32,
        ColumnType::F64 => DataType::Float64,
        ColumnType::Decimal => DataType::Decimal128(column.precision, column.scale),
        ColumnType::Date => DataType::Date32,
        ColumnType::Time => DataType::Time32(TimeUnit::Millisecond),
        ColumnType::Timestamp => DataType::Timestamp(TimeUnit::Millisecond, None),
        ColumnType::TimestampTz => {
            DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into()))
        }
        ColumnType::Text => DataType::Utf8,
        ColumnType::Binary => DataType::Binary,
    }
}

/// Build the Arrow schema for a column list.
pub fn arrow_schema(columns: &[ColumnMeta]) -> Schema {
    let fields: Vec<Field> = columns
        .iter()
        .map(|c| Field::new(&c.name, arrow_type(c), c.nullable))
        .collect();
    Schema::new(fields)
}

/// Typed column builder, reusable across batches.
enum ColBuilder {
    Bool(BooleanBuilder),
    I8(Int8Builder),
    I16(Int16Builder),
    I32(Int32Builder),
    I64(Int64Builder),
    F32(Float32Builder),
    F64(Float64Builder),
    Decimal(Decimal128Builder),
    Date(Date32Builder),
    Time(Time32MillisecondBuilder),
    Timestamp(TimestampMillisecondBuilder),
    Text(StringBuilder),
    Binary(BinaryBuilder),
}

impl ColBuilder {
    fn for_column(column: &ColumnMeta) -> QueryResult<Self> {
        let builder = match column.ty {
            ColumnType::Bool => Self::Bool(BooleanBuilder::new()),
            ColumnType::I8 => Self::I8(Int8Builder::new()),
            ColumnType::I16 => Self::I16(Int16Builder::new()),
            ColumnType::I32 => Self::I32(Int32Builder::new()),
            ColumnType::I64 => Self::I64(Int64Builder::new()),
            ColumnType::F32 => Self::F32(Float32Builder::new()),
            ColumnType::F64 => Self::F64(Float64Builder::new()),
            ColumnType::Decimal => Self::Decimal(
                Decimal128Builder::new()
                    .with_precision_and_scale(column.precision, column.scale)
                    .map_err(arrow_err)?,
            ),
            ColumnType::Date => Self::Date(Date32Builder::new()),
            ColumnType::Time => Self::Time(Time32MillisecondBuilder::new()),
            ColumnType::Timestamp => Self::Timestamp(TimestampMillisecondBuilder::new()),
            ColumnType::TimestampTz => {
                Self::Timestamp(TimestampMillisecondBuilder::new().with_timezone("UTC"))
            }
            ColumnType::Text => Self::Text(StringBuilder::new()),
            ColumnType::Binary => Self::Binary(BinaryBuilder::new()),
        };
        Ok(builder)
    }

    fn append(&mut self, column: &ColumnMeta, value: &SqlValue) -> QueryResult<()> {
        if value.is_null() {
            match self {
                Self::Bool(b) => b.append_null(),
                Self::I8(b) => b.append_null(),
                Self::I16(b) => b.append_null(),
                Self::I32(b) => b.append_null(),
                Self::I64(b) => b.append_null(),
                Self::F32(b) => b.append_null(),
                Self::F64(b) => b.append_null(),
                Self::Decimal(b) => b.append_null(),
                Self::Date(b) => b.append_null(),
                Self::Time(b) => b.append_null(),
                Self::Timestamp(b) => b.append_null(),
                Self::Text(b) => b.append_null(),
                Self::Binary(b) => b.append_null(),
            }
            return Ok(());
        }

        // Integer and float widenings are accepted; anything else is a
        // cursor bug surfaced as an encode error.
        match (self, value) {
            (Self::Bool(b), SqlValue::Bool(v)) => b.append_value(*v),
            (Self::I8(b), SqlValue::I8(v)) => b.append_value(*v),
            (Self::I16(b), SqlValue::I16(v)) => b.append_value(*v),
            (Self::I16(b), SqlValue::I8(v)) => b.append_value(*v as i16),
            (Self::I32(b), SqlValue::I32(v)) => b.append_value(*v),
            (Self::I32(b), SqlValue::I16(v)) => b.append_value(*v as i32),
            (Self::I32(b), SqlValue::I8(v)) => b.append_value(*v as i32),
            (Self::I64(b), SqlValue::I64(v)) => b.append_value(*v),
            (Self::I64(b), SqlValue::I32(v)) => b.append_value(*v as i64),
            (Self::I64(b), SqlValue::I16(v)) => b.append_value(*v as i64),
            (Self::I64(b), SqlValue::I8(v)) => b.append_value(*v as i64),
            (Self::F32(b), SqlValue::F32(v)) => b.append_value(*v),
            (Self::F64(b), SqlValue::F64(v)) => b.append_value(*v),
            (Self::F64(b), SqlValue::F32(v)) => b.append_value(*v as f64),
            (Self::Decimal(b), SqlValue::Decimal(v)) => b.append_value(*v),
            (Self::Date(b), SqlValue::DateDays(v)) => b.append_value(*v),
            (Self::Time(b), SqlValue::TimeMillis(v)) => b.append_value(*v),
            (Self::Timestamp(b), SqlValue::TimestampMillis(v)) => b.append_value(*v),
            (Self::Text(b), SqlValue::Text(v)) => b.append_value(v),
            (Self::Binary(b), SqlValue::Bytes(v)) => b.append_value(v),
            (_, other) => {
                return Err(QueryError::Encode(format!(
                    "value {:?} does not match column '{}' ({:?})",
                    other, column.name, column.ty
                )));
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> ArrayRef {
        match self {
            Self::Bool(b) => Arc::new(b.finish()),
            Self::I8(b) => Arc::new(b.finish()),
            Self::I16(b) => Arc::new(b.finish()),
            Self::I32(b) => Arc::new(b.finish()),
            Self::I64(b) => Arc::new(b.finish()),
            Self::F32(b) => Arc::new(b.finish()),
            Self::F64(b) => Arc::new(b.finish()),
            Self::Decimal(b) => Arc::new(b.finish()),
            Self::Date(b) => Arc::new(b.finish()),
            Self::Time(b) => Arc::new(b.finish()),
            Self::Timestamp(b) => Arc::new(b.finish()),
            Self::Text(b) => Arc::new(b.finish()),
            Self::Binary(b) => Arc::new(b.finish()),
        }
    }
}

fn make_builders(columns: &[ColumnMeta]) -> QueryResult<Vec<ColBuilder>> {
    columns.iter().map(ColBuilder::for_column).collect()
}

fn append_row(
    builders: &mut [ColBuilder],
    columns: &[ColumnMeta],
    row: &[SqlValue],
) -> QueryResult<()> {
    if row.len() != columns.len() {
        return Err(QueryError::Encode(format!(
            "row has {} values for {} columns",
            row.len(),
            columns.len()
        )));
    }
    for ((builder, column), value) in builders.iter_mut().zip(columns).zip(row) {
        builder.append(column, value)?;
    }
    Ok(())
}

fn flush_batch<W: std::io::Write>(
    writer: &mut StreamWriter<W>,
    schema: &Arc<Schema>,
    builders: &mut [ColBuilder],
) -> QueryResult<()> {
    let arrays: Vec<ArrayRef> = builders.iter_mut().map(|b| b.finish()).collect();
    let batch = RecordBatch::try_new(schema.clone(), arrays).map_err(arrow_err)?;
    writer.write(&batch).map_err(arrow_err)
}

/// Drain a cursor into one Arrow IPC stream.
///
/// Rows are buffered into batches of `batch_rows`. The cancel flag is polled
/// between rows and between batches; on cancellation the partial batch is
/// flushed, the stream is terminated properly, and the count of rows actually
/// emitted is returned.
pub async fn encode_cursor<W: std::io::Write>(
    cursor: &mut (dyn RowCursor + '_),
    batch_rows: usize,
    cancel: &AtomicBool,
    out: W,
    mut on_batch: Option<&mut (dyn FnMut(usize) + Send)>,
) -> QueryResult<u64> {
    if batch_rows == 0 {
        return Err(QueryError::InvalidOptions("batch_rows must be > 0".into()));
    }

    let columns = cursor.columns().to_vec();
    let schema = Arc::new(arrow_schema(&columns));
    let mut writer = StreamWriter::try_new(out, &schema).map_err(arrow_err)?;
    let mut builders = make_builders(&columns)?;

    let mut rows_in_batch = 0usize;
    let mut total_rows = 0u64;

    loop {
        if cancel.load(Ordering::Relaxed) {
            break;
        }
        let Some(row) = cursor.next_row().await? else {
            break;
        };
        append_row(&mut builders, &columns, &row)?;
        rows_in_batch += 1;
        total_rows += 1;

        if rows_in_batch == batch_rows {
            flush_batch(&mut writer, &schema, &mut builders)?;
            if let Some(cb) = on_batch.as_deref_mut() {
                cb(rows_in_batch);
            }
            rows_in_batch = 0;
        }
    }

    if rows_in_batch > 0 {
        flush_batch(&mut writer, &schema, &mut builders)?;
        if let Some(cb) = on_batch.as_deref_mut() {
            cb(rows_in_batch);
        }
    }

    writer.finish().map_err(arrow_err)?;
    Ok(total_rows)
}

struct ChunkState {
    schema: Arc<Schema>,
    writer: StreamWriter<Vec<u8>>,
    builders: Vec<ColBuilder>,
    rows_in_batch: usize,
    drained: usize,
}

impl ChunkState {
    /// Copy bytes the IPC writer produced since the last drain into `buf`.
    fn drain_into(&mut self, buf: &mut Vec<u8>) {
        let inner = self.writer.get_ref();
        buf.extend_from_slice(&inner[self.drained..]);
        self.drained = inner.len();
    }
}

/// Chunked Arrow encoder for the chunk writer.
///
/// Every chunk is a complete Arrow IPC stream with its own schema header and
/// end-of-stream marker.
pub struct ArrowChunkEncoder {
    batch_rows: usize,
    state: Option<ChunkState>,
}

impl ArrowChunkEncoder {
    pub fn new(batch_rows: usize) -> Self {
        Self {
            batch_rows: batch_rows.max(1),
            state: None,
        }
    }
}

impl RowEncoder for ArrowChunkEncoder {
    fn begin_chunk(&mut self, columns: &[ColumnMeta], buf: &mut Vec<u8>) -> QueryResult<()> {
        let schema = Arc::new(arrow_schema(columns));
        let writer = StreamWriter::try_new(Vec::new(), &schema).map_err(arrow_err)?;
        let builders = make_builders(columns)?;
        let mut state = ChunkState {
            schema,
            writer,
            builders,
            rows_in_batch: 0,
            drained: 0,
        };
        state.drain_into(buf);
        self.state = Some(state);
        Ok(())
    }

    fn encode_row(
        &mut self,
        columns: &[ColumnMeta],
        row: &[SqlValue],
        buf: &mut Vec<u8>,
    ) -> QueryResult<()> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| QueryError::Encode("encode_row before begin_chunk".into()))?;

        append_row(&mut state.builders, columns, row)?;
        state.rows_in_batch += 1;

        if state.rows_in_batch == self.batch_rows {
            flush_batch(&mut state.writer, &state.schema, &mut state.builders)?;
            state.rows_in_batch = 0;
            state.drain_into(buf);
        }
        Ok(())
    }

    fn finish_chunk(&mut self, buf: &mut Vec<u8>) -> QueryResult<()> {
        let mut state = self
            .state
            .take()
            .ok_or_else(|| QueryError::Encode("finish_chunk before begin_chunk".into()))?;

        if state.rows_in_batch > 0 {
            flush_batch(&mut state.writer, &state.schema, &mut state.builders)?;
        }
        state.writer.finish().map_err(arrow_err)?;
        state.drain_into(buf);
        Ok(())
    }

    fn content_type(&self, compressed: bool) -> &'static str {
        if compressed {
            "application/vnd.apache.arrow.stream+gzip"
        } else {
            "application/vnd.apache.arrow.stream"
        }
    }

    fn file_extension(&self, compressed: bool) -> &'static str {
        if compressed { ".arrow.gz" } else { ".arrow" }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::MemoryCursor;
    use arrow::array::{Array, Int64Array, StringArray};
    use arrow::ipc::reader::StreamReader;

    fn test_columns() -> Vec<ColumnMeta> {
        vec![
            ColumnMeta::new("id", ColumnType::I64, false),
            ColumnMeta::new("label", ColumnType::Text, true),
        ]
    }

    fn test_rows(n: i64) -> Vec<Vec<SqlValue>> {
        (0..n)
            .map(|i| {
                vec![
                    SqlValue::I64(i),
                    if i % 3 == 0 {
                        SqlValue::Null
                    } else {
                        SqlValue::Text(format!("row-{i}"))
                    },
                ]
            })
            .collect()
    }

    fn read_all(bytes: &[u8]) -> Vec<RecordBatch> {
        let reader = StreamReader::try_new(std::io::Cursor::new(bytes), None).unwrap();
        reader.map(|b| b.unwrap()).collect()
    }

    #[tokio::test]
    async fn test_encode_cursor_batches_rows() {
        let mut cursor = MemoryCursor::new(test_columns(), test_rows(25));
        let cancel = AtomicBool::new(false);
        let mut out = Vec::new();

        let rows = encode_cursor(&mut cursor, 10, &cancel, &mut out, None)
            .await
            .unwrap();
        assert_eq!(rows, 25);

        let batches = read_all(&out);
        assert_eq!(batches.len(), 3);
        assert_eq!(
            batches.iter().map(|b| b.num_rows()).collect::<Vec<_>>(),
            vec![10, 10, 5]
        );

        let ids = batches[2]
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert_eq!(ids.value(4), 24);

        let labels = batches[0]
            .column(1)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert!(labels.is_null(0));
        assert_eq!(labels.value(1), "row-1");
    }

    #[tokio::test]
    async fn test_cancellation_stops_after_current_batch() {
        let mut cursor = MemoryCursor::new(test_columns(), test_rows(25));
        let cancel = Arc::new(AtomicBool::new(false));
        let mut out = Vec::new();

        let cancel_on_batch = cancel.clone();
        let mut on_batch = move |_rows: usize| {
            cancel_on_batch.store(true, Ordering::Relaxed);
        };

        let rows = encode_cursor(&mut cursor, 10, &cancel, &mut out, Some(&mut on_batch))
            .await
            .unwrap();
        // Cancel raised after the first flush: exactly one batch emitted and
        // the stream is still well formed.
        assert_eq!(rows, 10);
        let batches = read_all(&out);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].num_rows(), 10);
    }

    #[tokio::test]
    async fn test_chunk_encoder_emits_self_contained_streams() {
        let columns = test_columns();
        let mut encoder = ArrowChunkEncoder::new(4);

        let mut first = Vec::new();
        encoder.begin_chunk(&columns, &mut first).unwrap();
        for row in test_rows(6) {
            encoder.encode_row(&columns, &row, &mut first).unwrap();
        }
        encoder.finish_chunk(&mut first).unwrap();

        let mut second = Vec::new();
        encoder.begin_chunk(&columns, &mut second).unwrap();
        for row in test_rows(2) {
            encoder.encode_row(&columns, &row, &mut second).unwrap();
        }
        encoder.finish_chunk(&mut second).unwrap();

        // Each chunk decodes on its own.
        let batches = read_all(&first);
        assert_eq!(batches.iter().map(|b| b.num_rows()).sum::<usize>(), 6);
        let batches = read_all(&second);
        assert_eq!(batches.iter().map(|b| b.num_rows()).sum::<usize>(), 2);
    }

    #[test]
    fn test_type_table() {
        let schema = arrow_schema(&[
            ColumnMeta::decimal("d", true, 38, 9),
            ColumnMeta::new("day", ColumnType::Date, true),
            ColumnMeta::new("at", ColumnType::TimestampTz, true),
        ]);
        assert_eq!(schema.field(0).data_type(), &DataType::Decimal128(38, 9));
        assert_eq!(schema.field(1).data_type(), &DataType::Date32);
        assert_eq!(
            schema.field(2).data_type(),
            &DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into()))
        );
    }
}
