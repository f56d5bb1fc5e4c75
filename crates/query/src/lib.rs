//! Query execution, encoding, and result materialization.
//!
//! The flow: a [`CacheRequest`](quarry_core::request::CacheRequest) resolves
//! to a [`providers`] cursor, the [`writer`] drains it into chunk objects and
//! a manifest on the object store, and [`QueryService`] orchestrates locks,
//! status, and cache hits around that.

pub mod arrow;
pub mod cursor;
pub mod encode;
pub mod error;
pub mod lock;
pub mod providers;
pub mod service;
pub mod writer;

pub use cursor::{ColumnMeta, ColumnType, MemoryCursor, RowCursor, SqlValue};
pub use encode::{NdjsonEncoder, RowEncoder};
pub use error::{QueryError, QueryResult};
pub use lock::{LocalLockService, LockService, StoreLockService};
pub use providers::{ConnectionProvider, MemoryProvider, PostgresProvider, ProviderRegistry};
pub use service::{QueryService, StatusResponse};
pub use writer::{write_result, ChunkWriteOptions};
