//! Best-effort materialization locks.
//!
//! Locks keep redundant materializations rare; they are not a correctness
//! mechanism. Losers of a race produce identical bytes under a different
//! in-flight run, and stale locks self-heal via their ttl.

use crate::error::QueryResult;
use async_trait::async_trait;
use bytes::Bytes;
use quarry_storage::{ObjectStore, PutOptions, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;
use tracing::{debug, warn};

/// Advisory lock over a materialization run.
#[async_trait]
pub trait LockService: Send + Sync + 'static {
    /// Try to take the lock at `key`. Returns false when someone else holds
    /// it or when acquisition could not be confirmed.
    async fn try_acquire(&self, key: &str, owner: &str, ttl_seconds: u64) -> QueryResult<bool>;

    /// Release the lock at `key`. Best-effort: failures are logged, never
    /// escalated.
    async fn release(&self, key: &str);
}

struct LocalLockEntry {
    owner: String,
    expires_at: OffsetDateTime,
}

/// Process-local lock table for single-node deployments and tests.
#[derive(Default)]
pub struct LocalLockService {
    locks: Mutex<HashMap<String, LocalLockEntry>>,
}

impl LocalLockService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockService for LocalLockService {
    async fn try_acquire(&self, key: &str, owner: &str, ttl_seconds: u64) -> QueryResult<bool> {
        let now = OffsetDateTime::now_utc();
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match locks.get(key) {
            Some(entry) if entry.expires_at > now => Ok(false),
            stale => {
                if let Some(entry) = stale {
                    debug!(key, previous_owner = %entry.owner, "replacing expired lock");
                }
                locks.insert(
                    key.to_string(),
                    LocalLockEntry {
                        owner: owner.to_string(),
                        expires_at: now + time::Duration::seconds(ttl_seconds as i64),
                    },
                );
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str) {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.remove(key);
    }
}

/// Marker object written under the lock key.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockMarker {
    owner: String,
    #[serde(with = "time::serde::rfc3339")]
    started_at: OffsetDateTime,
    ttl_seconds: u64,
}

impl LockMarker {
    fn expired(&self, now: OffsetDateTime) -> bool {
        self.started_at + time::Duration::seconds(self.ttl_seconds as i64) <= now
    }
}

/// Lock over the shared object store: check-then-put of a marker object.
///
/// The check and the put are not atomic; two nodes can both observe no
/// marker and both acquire. That window is accepted (both produce the same
/// bytes). Markers older than their ttl are reclaimed on the next conflict.
pub struct StoreLockService {
    store: Arc<dyn ObjectStore>,
}

impl StoreLockService {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    async fn read_marker(&self, key: &str) -> Option<LockMarker> {
        match self.store.get(key).await {
            Ok(data) => match serde_json::from_slice(&data) {
                Ok(marker) => Some(marker),
                Err(e) => {
                    warn!(key, error = %e, "unreadable lock marker, treating as held");
                    None
                }
            },
            Err(StorageError::NotFound(_)) => None,
            Err(e) => {
                warn!(key, error = %e, "failed to read lock marker, treating as held");
                None
            }
        }
    }
}

#[async_trait]
impl LockService for StoreLockService {
    async fn try_acquire(&self, key: &str, owner: &str, ttl_seconds: u64) -> QueryResult<bool> {
        let now = OffsetDateTime::now_utc();

        match self.store.exists(key).await {
            Ok(true) => {
                match self.read_marker(key).await {
                    Some(marker) if marker.expired(now) => {
                        warn!(
                            key,
                            previous_owner = %marker.owner,
                            ttl_seconds = marker.ttl_seconds,
                            "reclaiming expired lock marker"
                        );
                        if let Err(e) = self.store.delete(key).await {
                            debug!(key, error = %e, "failed to delete expired lock marker");
                            return Ok(false);
                        }
                    }
                    // Held, or unreadable: stay conservative.
                    _ => return Ok(false),
                }
            }
            Ok(false) => {}
            Err(e) => {
                warn!(key, error = %e, "lock existence check failed, treating as lost");
                return Ok(false);
            }
        }

        let marker = LockMarker {
            owner: owner.to_string(),
            started_at: now,
            ttl_seconds,
        };
        let body = serde_json::to_vec(&marker)
            .map_err(|e| crate::error::QueryError::Internal(e.to_string()))?;

        match self
            .store
            .put(key, Bytes::from(body), PutOptions::content_type("application/json"))
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!(key, error = %e, "lock marker write failed, treating as lost");
                Ok(false)
            }
        }
    }

    async fn release(&self, key: &str) {
        match self.store.delete(key).await {
            Ok(()) => {}
            Err(StorageError::NotFound(_)) => {}
            Err(e) => debug!(key, error = %e, "failed to release lock marker"),
        }
    }
}
