//! Connection providers.
//!
//! A [`ConnectionProvider`] knows how to open a [`RowCursor`] against one
//! family of data sources. The [`ProviderRegistry`] resolves the provider for
//! a request, either by the id configured on the datasource or by asking each
//! provider whether it supports the connection context.

pub mod memory;
pub mod postgres;

use crate::cursor::RowCursor;
use crate::error::{QueryError, QueryResult};
use async_trait::async_trait;
use quarry_core::config::DatasourceConfig;
use quarry_core::request::CacheRequest;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

pub use memory::MemoryProvider;
pub use postgres::PostgresProvider;

/// Resolved connection context a provider sees: the merged view of the
/// server-side datasource config and the request's inline fields.
#[derive(Clone, Debug, Default)]
pub struct ProviderContext {
    pub datasource_id: Option<String>,
    pub url: String,
    pub tags: Vec<String>,
    pub properties: BTreeMap<String, String>,
}

#[async_trait]
pub trait ConnectionProvider: Send + Sync + 'static {
    /// Stable provider id, matched against `DatasourceConfig::provider`.
    fn id(&self) -> &'static str;

    /// Whether this provider can serve the given context.
    fn supports(&self, ctx: &ProviderContext) -> bool;

    /// Open a cursor over the query result.
    async fn open(
        &self,
        ctx: &ProviderContext,
        username: Option<&str>,
        password: Option<&str>,
        sql: &str,
        params: &[String],
    ) -> QueryResult<Box<dyn RowCursor>>;
}

/// Orders providers by id so resolution is deterministic when several
/// providers claim support.
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn ConnectionProvider>>,
}

impl ProviderRegistry {
    pub fn new(mut providers: Vec<Arc<dyn ConnectionProvider>>) -> Self {
        providers.sort_by_key(|p| p.id());
        Self { providers }
    }

    /// Registry with the built-in providers.
    pub fn with_defaults() -> Self {
        Self::new(vec![
            Arc::new(MemoryProvider::new()),
            Arc::new(PostgresProvider::new()),
        ])
    }

    /// Resolve the provider for `ctx`. A non-empty `forced` id pins the
    /// choice; otherwise the first supporting provider (by id) wins.
    pub fn resolve(
        &self,
        forced: Option<&str>,
        ctx: &ProviderContext,
    ) -> QueryResult<Arc<dyn ConnectionProvider>> {
        if let Some(id) = forced.filter(|id| !id.is_empty()) {
            return self
                .providers
                .iter()
                .find(|p| p.id() == id)
                .cloned()
                .ok_or_else(|| QueryError::Datasource(format!("unknown provider '{id}'")));
        }
        self.providers
            .iter()
            .find(|p| p.supports(ctx))
            .cloned()
            .ok_or_else(|| {
                QueryError::Datasource(format!("no provider supports url '{}'", ctx.url))
            })
    }

    /// Resolve the request's datasource against the configured ones and open
    /// a cursor for its SQL.
    pub async fn open_for_request(
        &self,
        request: &CacheRequest,
        datasources: &BTreeMap<String, DatasourceConfig>,
    ) -> QueryResult<Box<dyn RowCursor>> {
        let source = &request.datasource;

        let (ctx, forced, username, password) = match &source.datasource_id {
            Some(id) => {
                let config = datasources.get(id).ok_or_else(|| {
                    QueryError::Datasource(format!("unknown datasource '{id}'"))
                })?;
                // Request properties first, then the server side on top:
                // configured values win on conflict.
                let mut properties = source.properties.clone();
                properties.extend(
                    config
                        .properties
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone())),
                );
                let ctx = ProviderContext {
                    datasource_id: Some(id.clone()),
                    url: config.url.clone(),
                    tags: config.tags.clone(),
                    properties,
                };
                let forced = (!config.provider.is_empty()).then(|| config.provider.clone());
                (ctx, forced, config.username.clone(), config.password.clone())
            }
            None => {
                let url = source.url.clone().ok_or_else(|| {
                    QueryError::InvalidOptions(
                        "request needs either datasource.datasourceId or datasource.url"
                            .to_string(),
                    )
                })?;
                let ctx = ProviderContext {
                    datasource_id: None,
                    url,
                    tags: Vec::new(),
                    properties: source.properties.clone(),
                };
                (ctx, None, source.username.clone(), source.password.clone())
            }
        };

        let provider = self.resolve(forced.as_deref(), &ctx)?;
        debug!(
            provider = provider.id(),
            datasource_id = ctx.datasource_id.as_deref().unwrap_or("-"),
            "opening cursor"
        );
        provider
            .open(
                &ctx,
                username.as_deref(),
                password.as_deref(),
                &request.sql,
                &request.params,
            )
            .await
    }
}
