//! Bounded local disk cache in front of a remote object store.
//!
//! `DiskCache` wraps an inner [`ObjectStore`] and keeps a byte-bounded local
//! mirror of fetched and written objects. Reads are served locally when
//! possible (read-through); writes go to the inner store first and are then
//! mirrored locally best-effort (write-through). Mirror failures are logged
//! and never fail the operation; the inner store stays authoritative.
//!
//! Local entries are content-addressed by the SHA-256 of `bucket\nkey` and
//! sharded by the first two hex characters. Each entry carries a sidecar
//! `.meta` JSON file recording where the bytes came from. When an insert
//! would exceed capacity, entries are evicted oldest-modification-time first;
//! when nothing evictable remains the insert proceeds over capacity rather
//! than fail.
//!
//! All size accounting and mutations run behind one async mutex; cache hits
//! read without taking it. Streaming reads (`get_stream`) bypass the local
//! mirror and go straight to the inner store.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, ObjectMeta, ObjectStore, PutOptions, StreamingUpload};
use async_trait::async_trait;
use bytes::Bytes;
use quarry_core::ContentHash;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Where a cached read was satisfied from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchSource {
    /// Served from the local disk mirror.
    Local,
    /// Fetched from the inner store (and mirrored).
    Remote,
}

/// Sidecar metadata stored next to each cached entry.
///
/// `source` is one of "put", "remote" or "peer" ("peer" is reserved for
/// entries seeded from another node's cache).
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheEntryMeta {
    bucket: String,
    key: String,
    size: u64,
    #[serde(with = "time::serde::rfc3339")]
    cached_at: OffsetDateTime,
    source: String,
}

struct CacheState {
    current_size: u64,
}

/// Bounded read-through/write-through disk cache over an inner object store.
pub struct DiskCache {
    inner: Arc<dyn ObjectStore>,
    bucket: String,
    root: PathBuf,
    capacity: u64,
    state: Mutex<CacheState>,
}

impl DiskCache {
    /// Create a disk cache rooted at `root` with the given byte capacity.
    ///
    /// `bucket` is the logical bucket name of the inner store; it namespaces
    /// the local entry hashes. Scans the root on startup to rebuild the size
    /// counter.
    pub async fn new(
        inner: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        root: impl AsRef<Path>,
        capacity: u64,
    ) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;

        let cache = Self {
            inner,
            bucket: bucket.into(),
            root,
            capacity,
            state: Mutex::new(CacheState { current_size: 0 }),
        };

        let size = cache.scan_size().await?;
        cache.state.lock().await.current_size = size;
        debug!(size, capacity, "disk cache initialized");
        Ok(cache)
    }

    /// Get an object, reporting where the bytes came from.
    #[instrument(skip(self), fields(backend = "disk-cache"))]
    pub async fn get_with_source(&self, key: &str) -> StorageResult<(Bytes, FetchSource)> {
        let entry = self.entry_path(key);

        // Hit path: no lock, no accounting.
        match fs::read(&entry).await {
            Ok(data) => return Ok((Bytes::from(data), FetchSource::Local)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(key, error = %e, "local cache read failed, falling back to inner store");
            }
        }

        let data = self.inner.get(key).await?;
        if let Err(e) = self.insert_local(key, &data, "remote").await {
            warn!(key, error = %e, "failed to mirror object into local cache");
        }
        Ok((data, FetchSource::Remote))
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let digest = ContentHash::compute(format!("{}\n{}", self.bucket, key).as_bytes()).to_hex();
        self.root.join(&digest[..2]).join(format!("{digest}.bin"))
    }

    fn meta_path(entry: &Path) -> PathBuf {
        entry.with_extension("meta")
    }

    /// Insert an entry, evicting as needed. Serialized behind the state mutex
    /// so concurrent inserts cannot corrupt the size counter.
    async fn insert_local(&self, key: &str, data: &[u8], source: &str) -> StorageResult<()> {
        let entry = self.entry_path(key);
        let size = data.len() as u64;

        let mut state = self.state.lock().await;

        // Another task may have filled the entry while we fetched.
        if fs::try_exists(&entry).await.unwrap_or(false) {
            return Ok(());
        }

        self.evict_for(&mut state, size).await?;

        if let Some(parent) = entry.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = entry.with_file_name(format!(".tmp.{}", Uuid::new_v4()));
        {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
        }
        fs::rename(&temp_path, &entry).await?;

        let meta = CacheEntryMeta {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            size,
            cached_at: OffsetDateTime::now_utc(),
            source: source.to_string(),
        };
        let meta_bytes = serde_json::to_vec(&meta)
            .map_err(|e| StorageError::Metadata(e.to_string()))?;
        fs::write(Self::meta_path(&entry), meta_bytes).await?;

        state.current_size += size;
        Ok(())
    }

    /// Evict oldest-mtime entries until `incoming` fits. If nothing is left
    /// to evict the insert proceeds over capacity.
    async fn evict_for(&self, state: &mut CacheState, incoming: u64) -> StorageResult<()> {
        while state.current_size + incoming > self.capacity {
            match self.oldest_entry().await? {
                Some((path, size)) => {
                    let _ = fs::remove_file(Self::meta_path(&path)).await;
                    fs::remove_file(&path).await?;
                    state.current_size = state.current_size.saturating_sub(size);
                    debug!(path = %path.display(), size, "evicted local cache entry");
                }
                None => {
                    warn!(
                        current_size = state.current_size,
                        incoming,
                        capacity = self.capacity,
                        "local cache over capacity with nothing to evict"
                    );
                    break;
                }
            }
        }
        Ok(())
    }

    /// Find the entry with the oldest modification time.
    async fn oldest_entry(&self) -> StorageResult<Option<(PathBuf, u64)>> {
        let mut oldest: Option<(PathBuf, u64, std::time::SystemTime)> = None;

        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::Io(e)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(path);
                    continue;
                }
                if path.extension().and_then(|e| e.to_str()) != Some("bin") {
                    continue;
                }
                let metadata = match entry.metadata().await {
                    Ok(m) => m,
                    Err(_) => continue,
                };
                let mtime = metadata
                    .modified()
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                let is_older = oldest
                    .as_ref()
                    .map(|(_, _, current)| mtime < *current)
                    .unwrap_or(true);
                if is_older {
                    oldest = Some((path, metadata.len(), mtime));
                }
            }
        }

        Ok(oldest.map(|(path, size, _)| (path, size)))
    }

    /// Sum the sizes of all cached entries.
    async fn scan_size(&self) -> StorageResult<u64> {
        let mut total = 0u64;
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::Io(e)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(entry.path());
                } else if entry.path().extension().and_then(|e| e.to_str()) == Some("bin") {
                    if let Ok(metadata) = entry.metadata().await {
                        total += metadata.len();
                    }
                }
            }
        }
        Ok(total)
    }

    /// Current cached bytes, for tests and diagnostics.
    pub async fn cached_bytes(&self) -> u64 {
        self.state.lock().await.current_size
    }
}

#[async_trait]
impl ObjectStore for DiskCache {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        if fs::try_exists(&self.entry_path(key)).await.unwrap_or(false) {
            return Ok(true);
        }
        self.inner.exists(key).await
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.inner.head(key).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let (data, _) = self.get_with_source(key).await?;
        Ok(data)
    }

    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        self.inner.get_stream(key).await
    }

    #[instrument(skip(self, data, options), fields(backend = "disk-cache", size = data.len()))]
    async fn put(
        &self,
        key: &str,
        data: Bytes,
        options: PutOptions,
    ) -> StorageResult<Option<String>> {
        // Inner store first; a failed remote write must leave no local trace.
        let etag = self.inner.put(key, data.clone(), options).await?;

        if let Err(e) = self.insert_local(key, &data, "put").await {
            warn!(key, error = %e, "failed to mirror written object into local cache");
        }
        Ok(etag)
    }

    /// Streaming uploads go straight to the inner store and are not mirrored.
    async fn put_stream(
        &self,
        key: &str,
        options: PutOptions,
    ) -> StorageResult<Box<dyn StreamingUpload>> {
        self.inner.put_stream(key, options).await
    }

    #[instrument(skip(self), fields(backend = "disk-cache"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await?;

        let entry = self.entry_path(key);
        let mut state = self.state.lock().await;
        match fs::metadata(&entry).await {
            Ok(metadata) => {
                let _ = fs::remove_file(Self::meta_path(&entry)).await;
                if fs::remove_file(&entry).await.is_ok() {
                    state.current_size = state.current_size.saturating_sub(metadata.len());
                }
            }
            Err(_) => {}
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.list(prefix).await
    }

    #[instrument(skip(self), fields(backend = "disk-cache"))]
    async fn copy(&self, from: &str, to: &str) -> StorageResult<()> {
        self.inner.copy(from, to).await?;

        // The destination may shadow an older local entry.
        let entry = self.entry_path(to);
        let mut state = self.state.lock().await;
        if let Ok(metadata) = fs::metadata(&entry).await {
            let _ = fs::remove_file(Self::meta_path(&entry)).await;
            if fs::remove_file(&entry).await.is_ok() {
                state.current_size = state.current_size.saturating_sub(metadata.len());
            }
        }
        Ok(())
    }

    async fn presign_get(
        &self,
        key: &str,
        expires_in: std::time::Duration,
    ) -> StorageResult<String> {
        self.inner.presign_get(key, expires_in).await
    }

    fn backend_name(&self) -> &'static str {
        "disk-cache"
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.inner.health_check().await
    }
}
