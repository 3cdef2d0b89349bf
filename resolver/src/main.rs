//! Swap Resolver - hash/time-locked atomic swaps between EVM chains and the
//! Internet Computer
//!
//! The resolver accepts swap orders, locks its own liquidity in escrows on
//! both ledgers under a shared hashlock, and reveals the secret to release
//! both sides once the withdrawal timelock has passed.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

mod api;
mod chain;
mod clock;
mod config;
mod coordination;
mod error;
mod metrics;
mod state;
mod tx;

use chain::ChainManager;
use clock::Clock;
use config::Settings;
use coordination::SwapEngine;
use metrics::MetricsServer;
use state::MemoryOrderStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Swap Resolver v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    // Initialize metrics server
    let metrics_server = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(server)
    } else {
        None
    };

    // Bind chain adapters; chains missing credentials stay unconfigured
    let chain_manager = Arc::new(ChainManager::new(&settings).await);
    info!("Chain adapters initialized");

    // Orders live in memory only
    let store = Arc::new(MemoryOrderStore::new());

    let engine = Arc::new(SwapEngine::new(
        settings.resolver.clone(),
        chain_manager.clone(),
        store,
        Clock::new(),
    )?);
    info!("Swap engine initialized");

    // Start API server
    let api_handle = tokio::spawn({
        let api_config = settings.api.clone();
        let engine = engine.clone();
        async move {
            if let Err(e) = api::run_server(api_config, engine).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = metrics_server.map(|server| {
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        })
    });

    // Start the sweep loop
    let engine_handle = tokio::spawn({
        let engine = engine.clone();
        async move {
            if let Err(e) = engine.run().await {
                error!("Swap engine error: {}", e);
            }
        }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let chain_manager = chain_manager.clone();
        let interval = settings.resolver.health_check_interval_secs.max(1);
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                for (chain, healthy) in chain_manager.health_check().await {
                    if !healthy {
                        warn!("Chain {} health check failed", chain);
                    }
                }
            }
        }
    });

    info!("Swap Resolver is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    engine.stop().await;

    // Abort background tasks
    api_handle.abort();
    engine_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Swap Resolver stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,swap_resolver=debug,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
