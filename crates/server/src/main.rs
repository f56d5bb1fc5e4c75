//! Quarry server binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use quarry_core::config::AppConfig;
use quarry_query::{ProviderRegistry, QueryService, StoreLockService};
use quarry_server::{create_router, AppState};
use quarry_storage::{DiskCache, ObjectStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Quarry - a SQL query result cache
#[derive(Parser, Debug)]
#[command(name = "quarryd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "QUARRY_CONFIG",
        default_value = "config/server.toml"
    )]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Quarry v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration (file is optional, env vars can provide/override everything)
    let config_path = std::path::Path::new(&args.config);
    let mut figment = Figment::new();
    let has_config_file = config_path.exists();

    if has_config_file {
        tracing::info!(config_path = %args.config, "Loading configuration from file");
        figment = figment.merge(Toml::file(&args.config));
    } else {
        tracing::debug!("No config file found at {}", args.config);
    }

    let has_env_config =
        std::env::vars().any(|(key, _)| key.starts_with("QUARRY_") && key != "QUARRY_CONFIG");

    if !has_config_file && !has_env_config {
        anyhow::bail!(
            "No configuration provided.\n\n\
             Provide configuration via one of:\n  \
             1. Config file: quarryd --config /path/to/config.toml\n  \
             2. Environment variables: QUARRY_SERVER__BIND_ADDRESS=0.0.0.0:8080 \
             QUARRY_QUERY_CACHE__BUCKET=results quarryd\n\n\
             Set QUARRY_CONFIG to specify a default config file path."
        );
    }

    if !has_config_file {
        tracing::info!("Using environment variables for configuration");
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("QUARRY_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    // Register Prometheus metrics
    quarry_server::metrics::register_metrics();

    // Initialize storage backend
    let mut storage: Arc<dyn ObjectStore> = quarry_storage::from_config(&config.storage)
        .await
        .context("failed to initialize storage")?;
    tracing::info!(backend = storage.backend_name(), "Storage backend initialized");

    // Verify storage connectivity before accepting requests.
    storage
        .health_check()
        .await
        .context("storage health check failed")?;
    tracing::info!("Storage backend connectivity verified");

    // Optionally front the store with the bounded local disk cache.
    if let Some(local) = &config.query_cache.local_cache {
        let capacity = local.capacity_bytes()?;
        storage = Arc::new(
            DiskCache::new(
                storage,
                config.query_cache.bucket.clone(),
                &local.root_dir,
                capacity,
            )
            .await
            .context("failed to initialize local disk cache")?,
        );
        tracing::info!(
            root_dir = %local.root_dir.display(),
            capacity_bytes = capacity,
            "Local disk cache enabled"
        );
    }

    // Locks live next to the results, on the shared store.
    let lock = Arc::new(StoreLockService::new(storage.clone()));

    let service = Arc::new(
        QueryService::new(
            config.query_cache.clone(),
            config.datasources.clone(),
            storage.clone(),
            lock,
            ProviderRegistry::with_defaults(),
        )
        .context("failed to initialize query service")?,
    );

    let state = AppState::new(config.clone(), storage, service);
    let app = create_router(state);

    let addr: SocketAddr = config
        .server
        .bind_address
        .parse()
        .context("invalid bind address")?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind listener")?;
    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}
