//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::collections::BTreeMap;
use std::pin::Pin;

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Object store abstraction for result chunks, manifests and lock markers.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Check if an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Get an object's metadata without fetching content.
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta>;

    /// Get an object's content.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Get an object as a byte stream.
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream>;

    /// Put an object atomically. Returns the backend etag when available.
    async fn put(&self, key: &str, data: Bytes, options: PutOptions)
        -> StorageResult<Option<String>>;

    /// Start a streaming upload for payloads too large to buffer.
    async fn put_stream(&self, key: &str, options: PutOptions)
        -> StorageResult<Box<dyn StreamingUpload>>;

    /// Delete an object.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// List object keys with a string prefix. The prefix is not required to
    /// end on a path separator ("runs/abc/part-" matches chunk objects).
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Copy an object within the store.
    async fn copy(&self, from: &str, to: &str) -> StorageResult<()>;

    /// Produce a URL under which the object can be fetched directly for the
    /// given duration, when the backend supports it.
    async fn presign_get(&self, key: &str, expires_in: std::time::Duration)
        -> StorageResult<String>;

    /// Get the name of this storage backend.
    ///
    /// Returns a static string identifier for the backend type (e.g., "s3",
    /// "filesystem"). Used for metrics and logging.
    fn backend_name(&self) -> &'static str;

    /// Verify storage backend connectivity.
    ///
    /// Called during server startup to ensure the storage is available before
    /// accepting requests. The default implementation returns Ok(()).
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Trait for streaming uploads.
#[async_trait]
pub trait StreamingUpload: Send {
    /// Write a chunk of data.
    async fn write(&mut self, data: Bytes) -> StorageResult<()>;

    /// Finish the upload and return the total bytes written.
    async fn finish(self: Box<Self>) -> StorageResult<u64>;

    /// Abort the upload, discarding everything written so far.
    async fn abort(self: Box<Self>) -> StorageResult<()>;
}

/// Options for put operations.
#[derive(Clone, Debug, Default)]
pub struct PutOptions {
    /// Content type stored with the object, when the backend supports it.
    pub content_type: Option<String>,
    /// User metadata stored with the object, when the backend supports it.
    pub metadata: BTreeMap<String, String>,
}

impl PutOptions {
    pub fn content_type(content_type: impl Into<String>) -> Self {
        Self {
            content_type: Some(content_type.into()),
            metadata: BTreeMap::new(),
        }
    }
}

/// Metadata about a stored object.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time (if available).
    pub last_modified: Option<time::OffsetDateTime>,
    /// Content type (if available).
    pub content_type: Option<String>,
}
