//! Public API request model for the query cache.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A request to materialize (or look up) a query result.
///
/// Immutable once submitted; every field that can change the bytes of the
/// result participates in cache-key derivation (see [`crate::key`]).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRequest {
    /// Optional caller-supplied salt mixed into the cache key. Setting a
    /// fresh value forces a new materialization for an otherwise identical
    /// request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_override: Option<String>,

    /// Where to run the query.
    pub datasource: DatasourceRef,

    /// The SQL text. Only trivially normalized (trim + collapse whitespace)
    /// for key derivation; executed as provided.
    pub sql: String,

    /// Bind parameter values in positional order. They participate in key
    /// derivation; binding itself is the connection provider's concern.
    #[serde(default)]
    pub params: Vec<String>,

    #[serde(default)]
    pub format: FormatOptions,

    #[serde(default)]
    pub chunking: ChunkingOptions,

    #[serde(default)]
    pub cache: CacheOptions,
}

/// Reference to a data source: either a server-configured datasource id
/// (preferred) or an inline connection URL with credentials.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasourceRef {
    /// Server-side datasource identity (e.g. "warehouse-prod"). When set,
    /// connection details are resolved from configuration and the request
    /// needs no credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datasource_id: Option<String>,

    /// Inline connection URL (legacy mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Provider-specific connection properties (non-secret). Merged with the
    /// server-side datasource properties; the server side wins on conflict.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

/// Row encoding for materialized chunks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowEncoding {
    /// One JSON object per line.
    #[default]
    Ndjson,
    /// Arrow IPC stream; every chunk is a self-contained stream
    /// (schema + batches + end-of-stream).
    Arrow,
}

impl RowEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ndjson => "ndjson",
            Self::Arrow => "arrow",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatOptions {
    #[serde(default)]
    pub encoding: RowEncoding,
    /// Gzip chunks before upload.
    #[serde(default = "default_gzip")]
    pub gzip: bool,
}

fn default_gzip() -> bool {
    true
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            encoding: RowEncoding::Ndjson,
            gzip: true,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkingOptions {
    /// Target chunk size as a data-size expression (e.g. "4MiB").
    /// Falls back to the server default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_chunk_bytes: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheOptions {
    /// Lock/cache time-to-live in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
}
