use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use config_cache_tier::config::{Cli, Config};
use config_cache_tier::engine::CacheEngine;
use config_cache_tier::server::api::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "config_cache_tier=debug,tower_http=debug"
    } else {
        "config_cache_tier=info,tower_http=info"
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.into());
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }

    info!("config-cache-tier v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Config::load(&cli.config)?;

    info!(
        backend = ?config.mirror.backend,
        quota_bytes = config.mirror.quota_bytes,
        remote = config.remote.enabled,
        host = %config.environment.host,
        "Configuration loaded"
    );

    let listen_addr = cli
        .listen
        .clone()
        .unwrap_or_else(|| config.server.listen.clone());

    // Build the engine and start its background tasks.
    let engine = Arc::new(CacheEngine::new(config)?);
    engine.start();

    let state = Arc::new(AppState {
        engine: engine.clone(),
        start_time: Instant::now(),
    });

    // Build the HTTP router.
    let app = build_router(state);

    // Start the server.
    info!(addr = listen_addr, "Starting server");

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    engine.shutdown();
    Ok(())
}
