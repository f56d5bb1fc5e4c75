//! Application state shared across handlers.

use quarry_core::config::AppConfig;
use quarry_query::QueryService;
use quarry_storage::ObjectStore;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Object storage backend (possibly wrapped in the local disk cache).
    pub storage: Arc<dyn ObjectStore>,
    /// Query cache orchestrator.
    pub service: Arc<QueryService>,
}

impl AppState {
    pub fn new(config: AppConfig, storage: Arc<dyn ObjectStore>, service: Arc<QueryService>) -> Self {
        Self {
            config: Arc::new(config),
            storage,
            service,
        }
    }
}
