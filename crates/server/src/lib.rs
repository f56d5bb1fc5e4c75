//! HTTP API server for the Quarry query cache.
//!
//! This crate provides the HTTP surface:
//! - Query submission (HIT or RUNNING)
//! - Status polling
//! - Manifest retrieval
//! - Chunk and full-result streaming
//! - Health and metrics endpoints

pub mod error;
pub mod handlers;
pub mod metrics;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::create_router;
pub use state::AppState;
