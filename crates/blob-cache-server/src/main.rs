//! Blob cache server
//!
//! Serves a persistent on-disk blob cache over HTTP so that other services
//! can store and fetch blobs by (stash, key).

mod error;
mod server;
mod types;

use crate::error::{Result, ServerError};
use crate::server::{start_server, ServerState, SharedState};
use crate::types::ServerConfig;
use blob_cache::Cache;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let env_filter =
        EnvFilter::from_default_env().add_directive("blob_cache_server=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    };

    info!("Starting blob cache server...");

    let config = ServerConfig::from_env();
    if config.min_quota > config.max_quota {
        return Err(ServerError::Config(format!(
            "MIN_QUOTA ({}) exceeds MAX_QUOTA ({})",
            config.min_quota, config.max_quota
        )));
    }
    info!("Port: {}", config.port);
    info!("Cache dir: {:?}", config.cache_dir);
    let (min_mb, max_mb) = config.quota_bounds_mb();
    info!("Quota bounds: {} MB - {} MB", min_mb, max_mb);

    // Loading the index reads and sweeps the cache directory
    let cache_config = config.cache_config();
    let cache = tokio::task::spawn_blocking(move || Cache::init(cache_config))
        .await
        .map_err(|e| ServerError::Config(format!("Cache init task failed: {}", e)))??;

    let state: SharedState = Arc::new(ServerState::new(cache));

    start_server(state, config.port).await?;

    info!("Blob cache server stopped");
    Ok(())
}
