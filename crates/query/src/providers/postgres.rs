//! PostgreSQL provider on top of sqlx.
//!
//! Each open builds a single-connection pool for that cursor; the connection
//! closes when the cursor is dropped. Result columns are described up front
//! and mapped onto the neutral column model; values decode per column type
//! with a text fallback for types the table does not know.

use super::{ConnectionProvider, ProviderContext};
use crate::cursor::{ColumnMeta, ColumnType, RowCursor, SqlValue};
use crate::error::{QueryError, QueryResult};
use async_trait::async_trait;
use futures::stream::{Stream, StreamExt, TryStreamExt};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow, PgSslMode};
use sqlx::{Column as _, Executor as _, Row as _, TypeInfo as _};
use std::pin::Pin;
use std::str::FromStr;
use time::macros::date;
use tracing::debug;

/// Precision and scale assigned to `numeric` columns. Values are rescaled to
/// this fixed scale so the unscaled mantissa is comparable across rows.
const NUMERIC_PRECISION: u8 = 38;
const NUMERIC_SCALE: i8 = 9;

#[derive(Default)]
pub struct PostgresProvider;

impl PostgresProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ConnectionProvider for PostgresProvider {
    fn id(&self) -> &'static str {
        "postgres"
    }

    fn supports(&self, ctx: &ProviderContext) -> bool {
        ctx.url.starts_with("postgres://") || ctx.url.starts_with("postgresql://")
    }

    async fn open(
        &self,
        ctx: &ProviderContext,
        username: Option<&str>,
        password: Option<&str>,
        sql: &str,
        params: &[String],
    ) -> QueryResult<Box<dyn RowCursor>> {
        let mut options = PgConnectOptions::from_str(&ctx.url)?;
        if let Some(user) = username {
            options = options.username(user);
        }
        if let Some(pass) = password {
            options = options.password(pass);
        }
        let mut server_settings = Vec::new();
        for (key, value) in &ctx.properties {
            match key.as_str() {
                "sslmode" => options = options.ssl_mode(PgSslMode::from_str(value)?),
                "application_name" => options = options.application_name(value),
                _ => server_settings.push((key.clone(), value.clone())),
            }
        }
        if !server_settings.is_empty() {
            options = options.options(server_settings);
        }

        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let describe = pool.describe(sql).await?;
        let columns: Vec<ColumnMeta> = describe
            .columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let (ty, precision, scale) = column_type_for(col.type_info().name());
                ColumnMeta {
                    name: col.name().to_string(),
                    ty,
                    nullable: describe.nullable(idx).unwrap_or(true),
                    precision,
                    scale,
                }
            })
            .collect();
        debug!(columns = columns.len(), "described result shape");

        let sql = sql.to_string();
        let params = params.to_vec();
        let stream = async_stream::try_stream! {
            let mut query = sqlx::query(&sql);
            for param in &params {
                query = query.bind(param);
            }
            let mut rows = query.fetch(&pool);
            while let Some(row) = rows.try_next().await? {
                yield row;
            }
        };

        Ok(Box::new(PgCursor {
            columns,
            rows: Box::pin(stream),
        }))
    }
}

/// Map a Postgres type name onto the neutral column model. Returns
/// `(type, precision, scale)`; precision and scale are zero except for
/// decimals.
fn column_type_for(type_name: &str) -> (ColumnType, u8, i8) {
    let ty = match type_name {
        "BOOL" => ColumnType::Bool,
        "\"CHAR\"" => ColumnType::I8,
        "INT2" | "SMALLINT" | "SMALLSERIAL" => ColumnType::I16,
        "INT4" | "INT" | "SERIAL" => ColumnType::I32,
        "INT8" | "BIGINT" | "BIGSERIAL" => ColumnType::I64,
        "FLOAT4" | "REAL" => ColumnType::F32,
        "FLOAT8" | "DOUBLE PRECISION" => ColumnType::F64,
        "NUMERIC" => return (ColumnType::Decimal, NUMERIC_PRECISION, NUMERIC_SCALE),
        "DATE" => ColumnType::Date,
        "TIME" => ColumnType::Time,
        "TIMESTAMP" => ColumnType::Timestamp,
        "TIMESTAMPTZ" => ColumnType::TimestampTz,
        "BYTEA" => ColumnType::Binary,
        // TEXT, VARCHAR, BPCHAR, NAME, UUID rendered as text, and anything
        // else we do not know.
        _ => ColumnType::Text,
    };
    (ty, 0, 0)
}

struct PgCursor {
    columns: Vec<ColumnMeta>,
    rows: Pin<Box<dyn Stream<Item = QueryResult<PgRow>> + Send>>,
}

#[async_trait]
impl RowCursor for PgCursor {
    fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    async fn next_row(&mut self) -> QueryResult<Option<Vec<SqlValue>>> {
        match self.rows.next().await.transpose()? {
            Some(row) => Ok(Some(decode_row(&self.columns, &row)?)),
            None => Ok(None),
        }
    }
}

fn decode_row(columns: &[ColumnMeta], row: &PgRow) -> QueryResult<Vec<SqlValue>> {
    let mut values = Vec::with_capacity(columns.len());
    for (idx, column) in columns.iter().enumerate() {
        values.push(decode_value(column, row, idx)?);
    }
    Ok(values)
}

fn decode_value(column: &ColumnMeta, row: &PgRow, idx: usize) -> QueryResult<SqlValue> {
    macro_rules! opt {
        ($ty:ty, $variant:expr) => {
            match row.try_get::<Option<$ty>, _>(idx)? {
                Some(v) => $variant(v),
                None => SqlValue::Null,
            }
        };
    }

    let value = match column.ty {
        ColumnType::Bool => opt!(bool, SqlValue::Bool),
        ColumnType::I8 => opt!(i8, SqlValue::I8),
        ColumnType::I16 => opt!(i16, SqlValue::I16),
        ColumnType::I32 => opt!(i32, SqlValue::I32),
        ColumnType::I64 => opt!(i64, SqlValue::I64),
        ColumnType::F32 => opt!(f32, SqlValue::F32),
        ColumnType::F64 => opt!(f64, SqlValue::F64),
        ColumnType::Decimal => match row.try_get::<Option<rust_decimal::Decimal>, _>(idx)? {
            Some(mut v) => {
                v.rescale(column.scale.max(0) as u32);
                SqlValue::Decimal(v.mantissa())
            }
            None => SqlValue::Null,
        },
        ColumnType::Date => match row.try_get::<Option<time::Date>, _>(idx)? {
            Some(v) => SqlValue::DateDays((v - date!(1970 - 01 - 01)).whole_days() as i32),
            None => SqlValue::Null,
        },
        ColumnType::Time => match row.try_get::<Option<time::Time>, _>(idx)? {
            Some(v) => SqlValue::TimeMillis((v - time::Time::MIDNIGHT).whole_milliseconds() as i32),
            None => SqlValue::Null,
        },
        ColumnType::Timestamp => match row.try_get::<Option<time::PrimitiveDateTime>, _>(idx)? {
            Some(v) => SqlValue::TimestampMillis(
                (v.assume_utc().unix_timestamp_nanos() / 1_000_000) as i64,
            ),
            None => SqlValue::Null,
        },
        ColumnType::TimestampTz => match row.try_get::<Option<time::OffsetDateTime>, _>(idx)? {
            Some(v) => SqlValue::TimestampMillis((v.unix_timestamp_nanos() / 1_000_000) as i64),
            None => SqlValue::Null,
        },
        ColumnType::Binary => opt!(Vec<u8>, SqlValue::Bytes),
        ColumnType::Text => opt!(String, SqlValue::Text),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supports_postgres_urls() {
        let provider = PostgresProvider::new();
        let ctx = |url: &str| ProviderContext {
            url: url.to_string(),
            ..Default::default()
        };
        assert!(provider.supports(&ctx("postgres://db/x")));
        assert!(provider.supports(&ctx("postgresql://db/x")));
        assert!(!provider.supports(&ctx("mysql://db/x")));
    }

    #[test]
    fn test_column_type_table() {
        assert_eq!(column_type_for("BOOL").0, ColumnType::Bool);
        assert_eq!(column_type_for("INT8").0, ColumnType::I64);
        assert_eq!(column_type_for("FLOAT8").0, ColumnType::F64);
        assert_eq!(
            column_type_for("NUMERIC"),
            (ColumnType::Decimal, NUMERIC_PRECISION, NUMERIC_SCALE)
        );
        assert_eq!(column_type_for("TIMESTAMPTZ").0, ColumnType::TimestampTz);
        assert_eq!(column_type_for("BYTEA").0, ColumnType::Binary);
        // Unknown types fall back to text.
        assert_eq!(column_type_for("JSONB").0, ColumnType::Text);
    }
}
