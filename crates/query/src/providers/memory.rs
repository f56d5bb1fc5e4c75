//! In-memory provider backed by seeded fixtures.
//!
//! Serves urls with a `memory:` scheme (or datasources tagged `memory`).
//! Results are looked up by normalized SQL text, which makes it a convenient
//! stand-in for a real database in tests and demos.

use super::{ConnectionProvider, ProviderContext};
use crate::cursor::{ColumnMeta, MemoryCursor, RowCursor, SqlValue};
use crate::error::{QueryError, QueryResult};
use async_trait::async_trait;
use quarry_core::key::normalize_sql;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

type Fixture = (Vec<ColumnMeta>, Vec<Vec<SqlValue>>);

#[derive(Default)]
pub struct MemoryProvider {
    fixtures: Mutex<HashMap<String, Fixture>>,
    opened: AtomicUsize,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the result to serve for `sql` (matched after normalization).
    pub fn seed(&self, sql: &str, columns: Vec<ColumnMeta>, rows: Vec<Vec<SqlValue>>) {
        self.fixtures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(normalize_sql(sql), (columns, rows));
    }

    /// How many cursors were opened. Lets tests assert a query ran at most
    /// once per cache key.
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ConnectionProvider for MemoryProvider {
    fn id(&self) -> &'static str {
        "memory"
    }

    fn supports(&self, ctx: &ProviderContext) -> bool {
        ctx.url.starts_with("memory:") || ctx.tags.iter().any(|t| t == "memory")
    }

    async fn open(
        &self,
        _ctx: &ProviderContext,
        _username: Option<&str>,
        _password: Option<&str>,
        sql: &str,
        _params: &[String],
    ) -> QueryResult<Box<dyn RowCursor>> {
        let (columns, rows) = self
            .fixtures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&normalize_sql(sql))
            .cloned()
            .ok_or_else(|| QueryError::Datasource(format!("no fixture for sql: {sql}")))?;
        self.opened.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemoryCursor::new(columns, rows)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::ColumnType;

    #[tokio::test]
    async fn test_fixture_lookup_ignores_whitespace() {
        let provider = MemoryProvider::new();
        provider.seed(
            "select id from t",
            vec![ColumnMeta::new("id", ColumnType::I64, false)],
            vec![vec![SqlValue::I64(1)]],
        );

        let ctx = ProviderContext {
            url: "memory://fixtures".to_string(),
            ..Default::default()
        };
        let mut cursor = provider
            .open(&ctx, None, None, "  select   id\nfrom t ", &[])
            .await
            .unwrap();
        assert_eq!(
            cursor.next_row().await.unwrap(),
            Some(vec![SqlValue::I64(1)])
        );
        assert_eq!(provider.open_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_fixture_is_a_datasource_error() {
        let provider = MemoryProvider::new();
        let ctx = ProviderContext {
            url: "memory://fixtures".to_string(),
            ..Default::default()
        };
        let err = provider
            .open(&ctx, None, None, "select 1", &[])
            .await
            .map(drop)
            .unwrap_err();
        assert!(matches!(err, QueryError::Datasource(_)));
        assert_eq!(provider.open_count(), 0);
    }
}
