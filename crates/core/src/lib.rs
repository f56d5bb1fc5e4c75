//! Core domain types and shared logic for the Quarry query-result cache.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Cache requests and their deterministic cache keys
//! - Manifest structure and chunk descriptors
//! - Materialization status
//! - Data-size expression parsing
//! - Configuration types

pub mod config;
pub mod datasize;
pub mod error;
pub mod hash;
pub mod key;
pub mod manifest;
pub mod request;
pub mod status;

pub use error::{Error, Result};
pub use hash::ContentHash;
pub use key::CacheKey;
pub use manifest::{ChunkDescriptor, Manifest, ResultRef, WritePlan};
pub use request::{CacheRequest, DatasourceRef, RowEncoding};
pub use status::QueryStatus;

/// Default target chunk size: 4 MiB
pub const DEFAULT_TARGET_CHUNK_BYTES: u64 = 4 * 1024 * 1024;

/// Default in-flight byte budget: 16 MiB
pub const DEFAULT_MAX_INFLIGHT_BYTES: u64 = 16 * 1024 * 1024;

/// Minimum target chunk size: 64 KiB
pub const MIN_TARGET_CHUNK_BYTES: u64 = 64 * 1024;

/// Maximum target chunk size: 256 MiB
pub const MAX_TARGET_CHUNK_BYTES: u64 = 256 * 1024 * 1024;
