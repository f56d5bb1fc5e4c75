//! Configuration types.

use crate::datasize;
use crate::error::{Error, Result};
use crate::{MAX_TARGET_CHUNK_BYTES, MIN_TARGET_CHUNK_BYTES};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    pub query_cache: QueryCacheConfig,

    pub storage: StorageConfig,

    /// Named datasources available by `datasourceId`.
    #[serde(default)]
    pub datasources: BTreeMap<String, DatasourceConfig>,
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        self.query_cache.validate()?;
        self.storage.validate()?;
        for (id, ds) in &self.datasources {
            if ds.url.is_empty() {
                return Err(Error::Config(format!("datasource '{id}': url is required")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind the HTTP server to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Expose Prometheus metrics at /metrics.
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

fn default_bind_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            metrics_enabled: true,
        }
    }
}

/// Materialization and result-cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryCacheConfig {
    /// Logical bucket results are written to. For the filesystem backend this
    /// is a top-level directory name.
    pub bucket: String,

    /// Key prefix under which run directories are created.
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Gzip chunk payloads unless the request says otherwise.
    #[serde(default = "default_true")]
    pub compress: bool,

    /// Target chunk size as a data-size expression.
    #[serde(default = "default_target_chunk_bytes")]
    pub target_chunk_bytes: String,

    /// Upper bound on sealed chunks queued for upload.
    #[serde(default = "default_max_inflight_chunks")]
    pub max_inflight_chunks: usize,

    /// Upper bound on bytes held by queued chunks, as a data-size expression.
    #[serde(default = "default_max_inflight_bytes")]
    pub max_inflight_bytes: String,

    /// Concurrent upload workers per materialization.
    #[serde(default = "default_upload_workers")]
    pub upload_workers: usize,

    /// Concurrent materializations per node.
    #[serde(default = "default_max_concurrent_writes")]
    pub max_concurrent_writes: usize,

    /// Default lock time-to-live in seconds.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,

    /// Rows fetched per encoder batch.
    #[serde(default = "default_batch_rows")]
    pub batch_rows: usize,

    /// Optional bounded local disk cache in front of the object store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_cache: Option<LocalCacheConfig>,
}

fn default_prefix() -> String {
    "quarry/results".to_string()
}

fn default_target_chunk_bytes() -> String {
    "4MiB".to_string()
}

fn default_max_inflight_chunks() -> usize {
    4
}

fn default_max_inflight_bytes() -> String {
    "16MiB".to_string()
}

fn default_upload_workers() -> usize {
    2
}

fn default_max_concurrent_writes() -> usize {
    4
}

fn default_lock_ttl_secs() -> u64 {
    3600
}

fn default_batch_rows() -> usize {
    1024
}

impl QueryCacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bucket.is_empty() {
            return Err(Error::Config("query_cache.bucket is required".to_string()));
        }
        let chunk = datasize::evaluate(&self.target_chunk_bytes)?;
        if !(MIN_TARGET_CHUNK_BYTES..=MAX_TARGET_CHUNK_BYTES).contains(&chunk) {
            return Err(Error::InvalidChunkSize {
                size: chunk,
                min: MIN_TARGET_CHUNK_BYTES,
                max: MAX_TARGET_CHUNK_BYTES,
            });
        }
        let inflight = datasize::evaluate(&self.max_inflight_bytes)?;
        if inflight < chunk {
            return Err(Error::Config(format!(
                "query_cache.max_inflight_bytes ({inflight}) must be >= target_chunk_bytes ({chunk})"
            )));
        }
        if self.max_inflight_chunks == 0
            || self.upload_workers == 0
            || self.max_concurrent_writes == 0
            || self.batch_rows == 0
        {
            return Err(Error::Config(
                "query_cache worker and queue settings must be > 0".to_string(),
            ));
        }
        if let Some(local) = &self.local_cache {
            local.validate()?;
        }
        Ok(())
    }
}

/// Bounded local read/write-through disk cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalCacheConfig {
    /// Directory the cache lives in.
    pub root_dir: PathBuf,

    /// Capacity as a data-size expression (e.g. "10GiB").
    pub capacity: String,
}

impl LocalCacheConfig {
    pub fn validate(&self) -> Result<()> {
        datasize::parse_bytes(&self.capacity)?;
        Ok(())
    }

    pub fn capacity_bytes(&self) -> Result<u64> {
        Ok(datasize::parse_bytes(&self.capacity)? as u64)
    }
}

/// Object storage backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    Filesystem {
        path: PathBuf,
    },
    S3 {
        bucket: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        region: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        access_key_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secret_access_key: Option<String>,
        #[serde(default)]
        force_path_style: bool,
    },
}

impl StorageConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Filesystem { path } => {
                if path.as_os_str().is_empty() {
                    return Err(Error::Config("storage.path is required".to_string()));
                }
            }
            Self::S3 {
                bucket,
                access_key_id,
                secret_access_key,
                ..
            } => {
                if bucket.is_empty() {
                    return Err(Error::Config("storage.bucket is required".to_string()));
                }
                if access_key_id.is_some() != secret_access_key.is_some() {
                    return Err(Error::Config(
                        "storage.access_key_id and storage.secret_access_key must be set together"
                            .to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// A server-configured datasource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasourceConfig {
    /// Connection provider id (e.g. "postgres", "memory"). When empty the
    /// provider is chosen from the url and tags.
    #[serde(default)]
    pub provider: String,

    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Provider-specific connection properties.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,

    /// Free-form tags providers may inspect when deciding support.
    #[serde(default)]
    pub tags: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
            [query_cache]
            bucket = "results"

            [storage]
            type = "filesystem"
            path = "/var/lib/quarry"
        "#
    }

    #[test]
    fn test_defaults_applied() {
        let config: AppConfig = toml::from_str(minimal_toml()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.bind_address, "127.0.0.1:8080");
        assert!(config.server.metrics_enabled);
        assert_eq!(config.query_cache.prefix, "quarry/results");
        assert_eq!(config.query_cache.target_chunk_bytes, "4MiB");
        assert_eq!(config.query_cache.upload_workers, 2);
        assert!(config.query_cache.local_cache.is_none());
    }

    #[test]
    fn test_chunk_size_bounds_enforced() {
        let mut config: AppConfig = toml::from_str(minimal_toml()).unwrap();
        config.query_cache.target_chunk_bytes = "1KiB".to_string();
        assert!(config.validate().is_err());
        config.query_cache.target_chunk_bytes = "1TiB".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inflight_budget_must_cover_chunk() {
        let mut config: AppConfig = toml::from_str(minimal_toml()).unwrap();
        config.query_cache.target_chunk_bytes = "8MiB".to_string();
        config.query_cache.max_inflight_bytes = "4MiB".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_s3_credentials_must_pair() {
        let config: std::result::Result<AppConfig, _> = toml::from_str(
            r#"
                [query_cache]
                bucket = "results"

                [storage]
                type = "s3"
                bucket = "quarry"
                access_key_id = "AKIA"
            "#,
        );
        let config = config.unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_datasource_section() {
        let config: AppConfig = toml::from_str(
            r#"
                [query_cache]
                bucket = "results"

                [storage]
                type = "filesystem"
                path = "/tmp/quarry"

                [datasources.warehouse]
                provider = "postgres"
                url = "postgres://db.internal/warehouse"
                username = "reader"
                tags = ["analytics"]

                [datasources.warehouse.properties]
                sslmode = "require"
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        let ds = &config.datasources["warehouse"];
        assert_eq!(ds.provider, "postgres");
        assert_eq!(ds.properties["sslmode"], "require");
    }
}
