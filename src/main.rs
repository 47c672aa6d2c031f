//! ACE - Analysis Correlation Engine
//!
//! Main entry point for the core service.
//!
//! This binary assembles:
//! - The in-memory core system with local blob storage
//! - The background sweeper for expired requests, cache entries and blobs
//! - The HTTP facade with bearer-token authentication

use std::sync::Arc;
use std::time::Duration;

use ace::api::create_router;
use ace::constants::CONFIG_STORAGE_ROOT;
use ace::CoreSystem;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging with configurable level
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    log::info!("═══════════════════════════════════════════════════════════");
    log::info!("  ACE - Analysis Correlation Engine");
    log::info!("  Version: {}", ace::VERSION);
    log::info!("═══════════════════════════════════════════════════════════");

    let system = Arc::new(CoreSystem::new());
    system.initialize().await?;

    if let Some(setting) = system.get_config(CONFIG_STORAGE_ROOT).await? {
        log::info!("blob storage root: {}", setting.value);
    }

    // bootstrap api key so a fresh instance is reachable
    match system.create_api_key("bootstrap", None, true).await {
        Ok(api_key) => log::info!("bootstrap admin api key: {}", api_key),
        Err(error) => log::warn!("bootstrap api key not created: {}", error),
    }

    let sweep_interval = std::env::var("ACE_SWEEP_INTERVAL")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(30);
    system.start_sweeper(Duration::from_secs(sweep_interval));
    log::info!("expiration sweeper running every {}s", sweep_interval);

    let bind_address =
        std::env::var("ACE_BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8882".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    log::info!("listening on {}", bind_address);

    let router = create_router(Arc::clone(&system));
    axum::serve(listener, router).await?;

    system.stop_sweeper();
    Ok(())
}
