//! Query cache orchestration.
//!
//! [`QueryService`] ties the pieces together: derive the cache key, answer
//! HIT from the object store, otherwise race for the materialization lock
//! and run the chunk writer in the background. Status is tracked in-process
//! and reconciled against the store, so a node that never saw the submit
//! can still answer DONE once the manifest exists.

use crate::error::{QueryError, QueryResult};
use crate::lock::LockService;
use crate::providers::ProviderRegistry;
use crate::writer::{self, ChunkWriteOptions};
use quarry_core::config::{DatasourceConfig, QueryCacheConfig};
use quarry_core::datasize;
use quarry_core::key::CacheKey;
use quarry_core::manifest::{ChunkDescriptor, Manifest, ResultRef, WritePlan};
use quarry_core::request::CacheRequest;
use quarry_core::status::QueryStatus;
use quarry_core::{MAX_TARGET_CHUNK_BYTES, MIN_TARGET_CHUNK_BYTES};
use quarry_storage::{ByteStream, ObjectStore, StorageError};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::{RwLock, Semaphore};
use tracing::{info, instrument, warn};

/// Externally visible state of a query, as returned by submit and status.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub query_id: String,
    pub status: QueryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Clone)]
struct StatusEntry {
    status: QueryStatus,
    result: Option<ResultRef>,
    error: Option<String>,
    updated_at: OffsetDateTime,
}

impl StatusEntry {
    fn new(status: QueryStatus) -> Self {
        Self {
            status,
            result: None,
            error: None,
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    fn with_result(status: QueryStatus, result: ResultRef) -> Self {
        Self {
            result: Some(result),
            ..Self::new(status)
        }
    }

    fn failed(error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::new(QueryStatus::Failed)
        }
    }

    fn response(&self, query_id: &str) -> StatusResponse {
        StatusResponse {
            query_id: query_id.to_string(),
            status: self.status,
            result: self.result.clone(),
            error: self.error.clone(),
            updated_at: self.updated_at,
        }
    }
}

pub struct QueryService {
    config: QueryCacheConfig,
    datasources: BTreeMap<String, DatasourceConfig>,
    store: Arc<dyn ObjectStore>,
    lock: Arc<dyn LockService>,
    registry: ProviderRegistry,
    statuses: RwLock<HashMap<String, StatusEntry>>,
    /// Caps concurrent materializations on this node.
    write_permits: Arc<Semaphore>,
}

impl QueryService {
    pub fn new(
        config: QueryCacheConfig,
        datasources: BTreeMap<String, DatasourceConfig>,
        store: Arc<dyn ObjectStore>,
        lock: Arc<dyn LockService>,
        registry: ProviderRegistry,
    ) -> QueryResult<Self> {
        config.validate()?;
        let write_permits = Arc::new(Semaphore::new(config.max_concurrent_writes));
        Ok(Self {
            config,
            datasources,
            store,
            lock,
            registry,
            statuses: RwLock::new(HashMap::new()),
            write_permits,
        })
    }

    fn plan_for(&self, query_id: &str) -> WritePlan {
        WritePlan::new(
            self.config.bucket.clone(),
            self.config.prefix.clone(),
            query_id.to_string(),
        )
    }

    fn write_options(&self, request: &CacheRequest) -> QueryResult<ChunkWriteOptions> {
        let target_chunk_bytes = match &request.chunking.target_chunk_bytes {
            Some(expr) => {
                let size = datasize::evaluate(expr)
                    .map_err(|e| QueryError::InvalidOptions(e.to_string()))?;
                if !(MIN_TARGET_CHUNK_BYTES..=MAX_TARGET_CHUNK_BYTES).contains(&size) {
                    return Err(QueryError::InvalidOptions(format!(
                        "targetChunkBytes {size} outside [{MIN_TARGET_CHUNK_BYTES}, {MAX_TARGET_CHUNK_BYTES}]"
                    )));
                }
                size as usize
            }
            None => datasize::evaluate(&self.config.target_chunk_bytes)? as usize,
        };
        let max_inflight_bytes =
            (datasize::evaluate(&self.config.max_inflight_bytes)? as usize).max(target_chunk_bytes);

        Ok(ChunkWriteOptions {
            target_chunk_bytes,
            max_inflight_chunks: self.config.max_inflight_chunks,
            max_inflight_bytes,
            upload_workers: self.config.upload_workers,
            compress: self.config.compress && request.format.gzip,
            encoding: request.format.encoding,
            batch_rows: self.config.batch_rows,
        })
    }

    async fn set_status(&self, query_id: &str, entry: StatusEntry) {
        self.statuses
            .write()
            .await
            .insert(query_id.to_string(), entry);
    }

    /// Submit a request: HIT immediately when the manifest exists, otherwise
    /// RUNNING (whether this node won the lock or someone else is already
    /// materializing).
    #[instrument(skip_all)]
    pub async fn submit(self: &Arc<Self>, request: CacheRequest) -> QueryResult<StatusResponse> {
        let key = CacheKey::derive(&request);
        let query_id = key.to_hex();
        let plan = self.plan_for(&query_id);

        // Invalid options fail fast, before any lock traffic.
        let options = self.write_options(&request)?;

        if self.store.exists(&plan.manifest_key()).await? {
            let result = self.load_ref(&plan).await?;
            let entry = StatusEntry::with_result(QueryStatus::Hit, result);
            let response = entry.response(&query_id);
            self.set_status(&query_id, entry).await;
            info!(query_id, "cache hit");
            return Ok(response);
        }

        let owner = format!("quarry@{}", std::process::id());
        let ttl = request
            .cache
            .ttl_seconds
            .unwrap_or(self.config.lock_ttl_secs);
        let acquired = self
            .lock
            .try_acquire(&plan.lock_key(), &owner, ttl)
            .await?;

        let entry = StatusEntry::new(QueryStatus::Running);
        let response = entry.response(&query_id);
        self.set_status(&query_id, entry).await;

        if acquired {
            info!(query_id, "materialization started");
            let service = Arc::clone(self);
            tokio::spawn(async move {
                service.materialize(request, plan, options, query_id).await;
            });
        } else {
            info!(query_id, "materialization already in flight elsewhere");
        }

        Ok(response)
    }

    #[instrument(skip_all, fields(query_id = %query_id))]
    async fn materialize(
        self: Arc<Self>,
        request: CacheRequest,
        plan: WritePlan,
        options: ChunkWriteOptions,
        query_id: String,
    ) {
        let lock_key = plan.lock_key();
        let outcome = self.run_materialization(request, plan, options).await;

        match outcome {
            Ok(result) => {
                info!(rows = result.row_count, chunks = result.chunk_count, "materialization done");
                self.set_status(&query_id, StatusEntry::with_result(QueryStatus::Done, result))
                    .await;
            }
            Err(e) => {
                warn!(error = %e, "materialization failed");
                self.set_status(&query_id, StatusEntry::failed(e.to_string()))
                    .await;
            }
        }

        self.lock.release(&lock_key).await;
    }

    async fn run_materialization(
        &self,
        request: CacheRequest,
        plan: WritePlan,
        options: ChunkWriteOptions,
    ) -> QueryResult<ResultRef> {
        let _permit = self
            .write_permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| QueryError::Internal("write permit semaphore closed".to_string()))?;

        let cursor = self
            .registry
            .open_for_request(&request, &self.datasources)
            .await?;

        let cancel = Arc::new(AtomicBool::new(false));
        writer::write_result(self.store.clone(), plan, cursor, options, cancel).await
    }

    /// Look up the state of a previously submitted query. RUNNING entries are
    /// reconciled against the store so a winner on another node flips this
    /// node's answer to DONE.
    pub async fn status(&self, query_id: &str) -> QueryResult<StatusResponse> {
        // Query ids are cache keys; anything else is unknown by construction.
        CacheKey::from_hex(query_id)
            .map_err(|_| QueryError::UnknownQuery(query_id.to_string()))?;
        let plan = self.plan_for(query_id);

        let entry = self.statuses.read().await.get(query_id).cloned();
        match entry {
            Some(entry) if entry.status == QueryStatus::Running => {
                if self.store.exists(&plan.manifest_key()).await? {
                    let result = self.load_ref(&plan).await?;
                    let entry = StatusEntry::with_result(QueryStatus::Done, result);
                    let response = entry.response(query_id);
                    self.set_status(query_id, entry).await;
                    return Ok(response);
                }
                Ok(entry.response(query_id))
            }
            Some(entry) => Ok(entry.response(query_id)),
            None => {
                // This node never saw the submit; the store may still know.
                if self.store.exists(&plan.manifest_key()).await? {
                    let result = self.load_ref(&plan).await?;
                    let entry = StatusEntry::with_result(QueryStatus::Done, result);
                    let response = entry.response(query_id);
                    self.set_status(query_id, entry).await;
                    return Ok(response);
                }
                Err(QueryError::UnknownQuery(query_id.to_string()))
            }
        }
    }

    /// Fetch and parse the manifest of a completed query.
    pub async fn manifest(&self, query_id: &str) -> QueryResult<Manifest> {
        CacheKey::from_hex(query_id)
            .map_err(|_| QueryError::UnknownQuery(query_id.to_string()))?;
        let plan = self.plan_for(query_id);
        let data = match self.store.get(&plan.manifest_key()).await {
            Ok(data) => data,
            Err(StorageError::NotFound(_)) => {
                return Err(QueryError::UnknownQuery(query_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Manifest::from_json(&data)?)
    }

    /// Open a byte stream over one chunk of a completed query.
    pub async fn chunk(
        &self,
        query_id: &str,
        part: u32,
    ) -> QueryResult<(ChunkDescriptor, ByteStream)> {
        let manifest = self.manifest(query_id).await?;
        let descriptor = manifest
            .chunks
            .iter()
            .find(|c| c.part == part)
            .cloned()
            .ok_or_else(|| {
                QueryError::UnknownQuery(format!("{query_id}: no chunk part {part}"))
            })?;
        let stream = self.store.get_stream(&descriptor.key).await?;
        Ok((descriptor, stream))
    }

    /// Result pointer from the manifest, with a degraded fallback that lists
    /// chunk objects when the manifest itself does not parse.
    async fn load_ref(&self, plan: &WritePlan) -> QueryResult<ResultRef> {
        let manifest_key = plan.manifest_key();
        let data = self.store.get(&manifest_key).await?;
        match Manifest::from_json(&data) {
            Ok(manifest) => Ok(ResultRef {
                bucket: manifest.bucket,
                prefix: manifest.prefix,
                run_id: manifest.run_id,
                manifest_key,
                row_count: manifest.total_rows,
                chunk_count: manifest.chunks.len() as u32,
            }),
            Err(e) => {
                warn!(manifest_key, error = %e, "unreadable manifest, listing chunks instead");
                let chunks = self.store.list(&plan.chunk_prefix()).await?;
                Ok(ResultRef {
                    bucket: plan.bucket.clone(),
                    prefix: plan.prefix.clone(),
                    run_id: plan.run_id.clone(),
                    manifest_key,
                    row_count: 0,
                    chunk_count: chunks.len() as u32,
                })
            }
        }
    }
}
