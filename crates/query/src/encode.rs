//! Row encoders.
//!
//! A [`RowEncoder`] turns cursor rows into chunk payload bytes. Chunks are
//! self-contained: `begin_chunk`/`finish_chunk` bracket every chunk so a
//! reader can decode any chunk on its own (for ndjson that is trivially true;
//! for Arrow each chunk carries its own schema and end-of-stream marker).

use crate::cursor::{ColumnMeta, ColumnType, SqlValue};
use crate::error::{QueryError, QueryResult};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};

/// Encodes rows into chunk payloads.
pub trait RowEncoder: Send {
    /// Start a new chunk.
    fn begin_chunk(&mut self, columns: &[ColumnMeta], buf: &mut Vec<u8>) -> QueryResult<()>;

    /// Append one row to the current chunk.
    fn encode_row(
        &mut self,
        columns: &[ColumnMeta],
        row: &[SqlValue],
        buf: &mut Vec<u8>,
    ) -> QueryResult<()>;

    /// Finalize the current chunk.
    fn finish_chunk(&mut self, buf: &mut Vec<u8>) -> QueryResult<()>;

    /// Content type of chunk objects.
    fn content_type(&self, compressed: bool) -> &'static str;

    /// File extension of chunk objects, including the leading dot.
    fn file_extension(&self, compressed: bool) -> &'static str;
}

/// One JSON object per row, newline-delimited.
#[derive(Default)]
pub struct NdjsonEncoder;

impl RowEncoder for NdjsonEncoder {
    fn begin_chunk(&mut self, _columns: &[ColumnMeta], _buf: &mut Vec<u8>) -> QueryResult<()> {
        Ok(())
    }

    fn encode_row(
        &mut self,
        columns: &[ColumnMeta],
        row: &[SqlValue],
        buf: &mut Vec<u8>,
    ) -> QueryResult<()> {
        let mut object = Map::with_capacity(columns.len());
        for (column, value) in columns.iter().zip(row) {
            object.insert(column.name.clone(), json_value(column, value)?);
        }
        serde_json::to_writer(&mut *buf, &Value::Object(object))
            .map_err(|e| QueryError::Encode(e.to_string()))?;
        buf.push(b'\n');
        Ok(())
    }

    fn finish_chunk(&mut self, _buf: &mut Vec<u8>) -> QueryResult<()> {
        Ok(())
    }

    fn content_type(&self, compressed: bool) -> &'static str {
        if compressed {
            "application/x-ndjson+gzip"
        } else {
            "application/x-ndjson"
        }
    }

    fn file_extension(&self, compressed: bool) -> &'static str {
        if compressed { ".ndjson.gz" } else { ".ndjson" }
    }
}

fn json_value(column: &ColumnMeta, value: &SqlValue) -> QueryResult<Value> {
    let value = match value {
        SqlValue::Null => Value::Null,
        SqlValue::Bool(v) => Value::Bool(*v),
        SqlValue::I8(v) => Value::from(*v),
        SqlValue::I16(v) => Value::from(*v),
        SqlValue::I32(v) => Value::from(*v),
        SqlValue::I64(v) => Value::from(*v),
        // JSON has no NaN or infinity; encode those as null.
        SqlValue::F32(v) => serde_json::Number::from_f64(*v as f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        SqlValue::F64(v) => serde_json::Number::from_f64(*v)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        SqlValue::Decimal(mantissa) => Value::String(format_decimal(*mantissa, column.scale)),
        SqlValue::DateDays(days) => Value::String(format_date(*days)?),
        SqlValue::TimeMillis(millis) => Value::String(format_time(*millis)),
        SqlValue::TimestampMillis(millis) => Value::String(format_timestamp(*millis)?),
        SqlValue::Text(text) => Value::String(text.clone()),
        SqlValue::Bytes(bytes) => Value::String(BASE64.encode(bytes)),
    };
    Ok(value)
}

/// Render an unscaled decimal mantissa at the given scale, e.g.
/// `(12345, 2)` -> `"123.45"`.
fn format_decimal(mantissa: i128, scale: i8) -> String {
    if scale <= 0 {
        return mantissa.to_string();
    }
    let scale = scale as u32;
    let negative = mantissa < 0;
    let digits = mantissa.unsigned_abs().to_string();
    let (int_part, frac_part) = if digits.len() > scale as usize {
        let split = digits.len() - scale as usize;
        (digits[..split].to_string(), digits[split..].to_string())
    } else {
        (
            "0".to_string(),
            format!("{:0>width$}", digits, width = scale as usize),
        )
    };
    let sign = if negative { "-" } else { "" };
    format!("{sign}{int_part}.{frac_part}")
}

fn format_date(days: i32) -> QueryResult<String> {
    let date = time::macros::date!(1970 - 01 - 01)
        .checked_add(Duration::days(days as i64))
        .ok_or_else(|| QueryError::Encode(format!("date out of range: {days} days")))?;
    Ok(date.to_string())
}

fn format_time(millis: i32) -> String {
    let total_seconds = millis.div_euclid(1000);
    let millis = millis.rem_euclid(1000);
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        total_seconds / 3600,
        (total_seconds / 60) % 60,
        total_seconds % 60,
        millis
    )
}

fn format_timestamp(millis: i64) -> QueryResult<String> {
    let timestamp = OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000)
        .map_err(|e| QueryError::Encode(format!("timestamp out of range: {e}")))?;
    timestamp
        .format(&Rfc3339)
        .map_err(|e| QueryError::Encode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns() -> Vec<ColumnMeta> {
        vec![
            ColumnMeta::new("id", ColumnType::I64, false),
            ColumnMeta::new("name", ColumnType::Text, true),
            ColumnMeta::decimal("price", true, 10, 2),
            ColumnMeta::new("created", ColumnType::TimestampTz, true),
        ]
    }

    #[test]
    fn test_ndjson_rows() {
        let columns = columns();
        let mut encoder = NdjsonEncoder;
        let mut buf = Vec::new();

        encoder.begin_chunk(&columns, &mut buf).unwrap();
        encoder
            .encode_row(
                &columns,
                &[
                    SqlValue::I64(7),
                    SqlValue::Text("widget".to_string()),
                    SqlValue::Decimal(12345),
                    SqlValue::TimestampMillis(0),
                ],
                &mut buf,
            )
            .unwrap();
        encoder
            .encode_row(
                &columns,
                &[
                    SqlValue::I64(8),
                    SqlValue::Null,
                    SqlValue::Null,
                    SqlValue::Null,
                ],
                &mut buf,
            )
            .unwrap();
        encoder.finish_chunk(&mut buf).unwrap();

        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["id"], 7);
        assert_eq!(first["name"], "widget");
        assert_eq!(first["price"], "123.45");
        assert_eq!(first["created"], "1970-01-01T00:00:00Z");

        let second: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["name"], Value::Null);
    }

    #[test]
    fn test_nan_becomes_null() {
        let columns = vec![ColumnMeta::new("x", ColumnType::F64, true)];
        let mut encoder = NdjsonEncoder;
        let mut buf = Vec::new();
        encoder
            .encode_row(&columns, &[SqlValue::F64(f64::NAN)], &mut buf)
            .unwrap();
        let parsed: Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(parsed["x"], Value::Null);
    }

    #[test]
    fn test_format_decimal() {
        assert_eq!(format_decimal(12345, 2), "123.45");
        assert_eq!(format_decimal(-12345, 2), "-123.45");
        assert_eq!(format_decimal(5, 3), "0.005");
        assert_eq!(format_decimal(42, 0), "42");
    }

    #[test]
    fn test_format_date_and_time() {
        assert_eq!(format_date(0).unwrap(), "1970-01-01");
        assert_eq!(format_date(19723).unwrap(), "2024-01-01");
        assert_eq!(format_time(0), "00:00:00.000");
        assert_eq!(format_time(3_661_042), "01:01:01.042");
    }

    #[test]
    fn test_content_types() {
        let encoder = NdjsonEncoder;
        assert_eq!(encoder.content_type(false), "application/x-ndjson");
        assert_eq!(encoder.content_type(true), "application/x-ndjson+gzip");
        assert_eq!(encoder.file_extension(true), ".ndjson.gz");
    }
}
