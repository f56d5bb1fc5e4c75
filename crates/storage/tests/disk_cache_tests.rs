//! Integration tests for the bounded local disk cache.

use async_trait::async_trait;
use bytes::Bytes;
use quarry_storage::{
    ByteStream, DiskCache, FetchSource, FilesystemBackend, ObjectMeta, ObjectStore, PutOptions,
    StorageError, StorageResult, StreamingUpload,
};
use std::sync::Arc;
use tempfile::tempdir;

async fn fixture(capacity: u64) -> (DiskCache, Arc<dyn ObjectStore>, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let inner: Arc<dyn ObjectStore> = Arc::new(
        FilesystemBackend::new(dir.path().join("remote"))
            .await
            .unwrap(),
    );
    let cache = DiskCache::new(inner.clone(), "results", dir.path().join("cache"), capacity)
        .await
        .unwrap();
    (cache, inner, dir)
}

#[tokio::test]
async fn read_through_mirrors_remote_objects() {
    let (cache, inner, _dir) = fixture(1024 * 1024).await;

    inner
        .put("runs/a/part-000001.ndjson", Bytes::from("rows"), PutOptions::default())
        .await
        .unwrap();

    let (data, source) = cache.get_with_source("runs/a/part-000001.ndjson").await.unwrap();
    assert_eq!(data, Bytes::from("rows"));
    assert_eq!(source, FetchSource::Remote);

    let (data, source) = cache.get_with_source("runs/a/part-000001.ndjson").await.unwrap();
    assert_eq!(data, Bytes::from("rows"));
    assert_eq!(source, FetchSource::Local);

    assert_eq!(cache.cached_bytes().await, 4);
}

#[tokio::test]
async fn write_through_hits_inner_store_first() {
    let (cache, inner, _dir) = fixture(1024 * 1024).await;

    let etag = cache
        .put("runs/a/manifest.json", Bytes::from("{}"), PutOptions::default())
        .await
        .unwrap();
    assert!(etag.is_some());

    // Authoritative copy exists remotely.
    assert_eq!(inner.get("runs/a/manifest.json").await.unwrap(), Bytes::from("{}"));

    // And the local mirror serves the next read.
    let (_, source) = cache.get_with_source("runs/a/manifest.json").await.unwrap();
    assert_eq!(source, FetchSource::Local);
}

#[tokio::test]
async fn eviction_keeps_cached_bytes_bounded() {
    let (cache, inner, _dir) = fixture(1000).await;

    for i in 0..5 {
        let key = format!("runs/a/part-{i:06}.ndjson");
        cache
            .put(&key, Bytes::from(vec![b'x'; 300]), PutOptions::default())
            .await
            .unwrap();
        // Keep mtimes distinguishable for oldest-first eviction.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    assert!(cache.cached_bytes().await <= 1000);

    // Eviction never touches the inner store.
    for i in 0..5 {
        let key = format!("runs/a/part-{i:06}.ndjson");
        assert!(inner.exists(&key).await.unwrap());
    }
}

#[tokio::test]
async fn oversized_entry_proceeds_over_capacity() {
    let (cache, _inner, _dir) = fixture(100).await;

    cache
        .put("runs/a/big.ndjson", Bytes::from(vec![b'x'; 300]), PutOptions::default())
        .await
        .unwrap();

    // Nothing evictable can make room, so the entry lands anyway.
    assert_eq!(cache.cached_bytes().await, 300);
    let (_, source) = cache.get_with_source("runs/a/big.ndjson").await.unwrap();
    assert_eq!(source, FetchSource::Local);
}

#[tokio::test]
async fn delete_removes_the_local_shadow() {
    let (cache, inner, _dir) = fixture(1024 * 1024).await;

    cache
        .put("runs/a/part-000001.ndjson", Bytes::from("rows"), PutOptions::default())
        .await
        .unwrap();
    assert_eq!(cache.cached_bytes().await, 4);

    cache.delete("runs/a/part-000001.ndjson").await.unwrap();
    assert_eq!(cache.cached_bytes().await, 0);
    assert!(!inner.exists("runs/a/part-000001.ndjson").await.unwrap());

    match cache.get("runs/a/part-000001.ndjson").await {
        Err(StorageError::NotFound(_)) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn copy_invalidates_stale_destination_shadow() {
    let (cache, inner, _dir) = fixture(1024 * 1024).await;

    cache
        .put("runs/a/old.ndjson", Bytes::from("old"), PutOptions::default())
        .await
        .unwrap();
    cache
        .put("runs/a/new.ndjson", Bytes::from("fresh"), PutOptions::default())
        .await
        .unwrap();

    cache.copy("runs/a/new.ndjson", "runs/a/old.ndjson").await.unwrap();

    // Inner store got the copy and the old local shadow no longer masks it.
    assert_eq!(inner.get("runs/a/old.ndjson").await.unwrap(), Bytes::from("fresh"));
    let (data, source) = cache.get_with_source("runs/a/old.ndjson").await.unwrap();
    assert_eq!(data, Bytes::from("fresh"));
    assert_eq!(source, FetchSource::Remote);
}

#[tokio::test]
async fn size_counter_rebuilt_on_startup() {
    let dir = tempdir().unwrap();
    let inner: Arc<dyn ObjectStore> = Arc::new(
        FilesystemBackend::new(dir.path().join("remote"))
            .await
            .unwrap(),
    );

    {
        let cache = DiskCache::new(inner.clone(), "results", dir.path().join("cache"), 1 << 20)
            .await
            .unwrap();
        cache
            .put("runs/a/part-000001.ndjson", Bytes::from("12345"), PutOptions::default())
            .await
            .unwrap();
    }

    let reopened = DiskCache::new(inner, "results", dir.path().join("cache"), 1 << 20)
        .await
        .unwrap();
    assert_eq!(reopened.cached_bytes().await, 5);
}

/// Inner store whose writes always fail.
struct FailingStore;

#[async_trait]
impl ObjectStore for FailingStore {
    async fn exists(&self, _key: &str) -> StorageResult<bool> {
        Ok(false)
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        Err(StorageError::NotFound(key.to_string()))
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        Err(StorageError::NotFound(key.to_string()))
    }

    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        Err(StorageError::NotFound(key.to_string()))
    }

    async fn put(
        &self,
        _key: &str,
        _data: Bytes,
        _options: PutOptions,
    ) -> StorageResult<Option<String>> {
        Err(StorageError::Io(std::io::Error::other("remote write failed")))
    }

    async fn put_stream(
        &self,
        _key: &str,
        _options: PutOptions,
    ) -> StorageResult<Box<dyn StreamingUpload>> {
        Err(StorageError::Io(std::io::Error::other("remote write failed")))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        Err(StorageError::NotFound(key.to_string()))
    }

    async fn list(&self, _prefix: &str) -> StorageResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn copy(&self, from: &str, _to: &str) -> StorageResult<()> {
        Err(StorageError::NotFound(from.to_string()))
    }

    async fn presign_get(
        &self,
        key: &str,
        _expires_in: std::time::Duration,
    ) -> StorageResult<String> {
        Err(StorageError::NotFound(key.to_string()))
    }

    fn backend_name(&self) -> &'static str {
        "failing"
    }
}

#[tokio::test]
async fn failed_remote_write_leaves_no_local_trace() {
    let dir = tempdir().unwrap();
    let cache = DiskCache::new(Arc::new(FailingStore), "results", dir.path(), 1 << 20)
        .await
        .unwrap();

    let result = cache
        .put("runs/a/part-000001.ndjson", Bytes::from("rows"), PutOptions::default())
        .await;
    assert!(result.is_err());
    assert_eq!(cache.cached_bytes().await, 0);

    // The failed write must not be readable locally either.
    assert!(cache.get("runs/a/part-000001.ndjson").await.is_err());
}
