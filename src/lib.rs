// src/lib.rs
pub mod api;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod fees;
pub mod intake;
pub mod reconcile;
pub mod stats;
pub mod storage;

use crate::config::{validate_config, Config};
use crate::dispatch::Dispatcher;
use crate::executor::{run_batch_loop, BatchExecutor};
use crate::reconcile::{run_reconcile_loop, Reconciler};
use crate::storage::create_storage;
use anyhow::Context;
use log::{error, info};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

/// Bring the node up and run it until ctrl-c.
///
/// Startup order:
/// 1. Validate the configuration (refuse to start on errors)
/// 2. Open storage for the configured backend
/// 3. Bind the API server
/// 4. Start the batch cycle and the reconciler
///
/// On shutdown the workers are signalled first so no batch is formed while
/// the API drains, then the server handle is awaited.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let validation = validate_config(&config);
    validation.print_summary();
    if !validation.valid {
        anyhow::bail!("invalid configuration - refusing to start");
    }

    let config = Arc::new(config);
    let storage = create_storage(config.storage_mode, &config.sqlite_path)
        .await
        .context("failed to open storage")?;

    let api_addr: SocketAddr = config
        .api_addr
        .parse()
        .with_context(|| format!("API_ADDR invalid: {}", config.api_addr))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // API server. with_connect_info is required for the rate limiter.
    let router = api::router(storage.clone(), config.clone());
    let mut server_shutdown = shutdown_rx.clone();
    let server = axum::Server::try_bind(&api_addr)
        .with_context(|| format!("failed to bind API address {}", api_addr))?
        .serve(router.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.changed().await;
        });
    info!("Starting API server on {}", api_addr);
    let server_handle = tokio::spawn(server);

    // Batch cycle
    let executor = Arc::new(BatchExecutor::new(
        storage.clone(),
        Dispatcher::new(config.dispatch_timeout_secs),
        config.max_batch_size,
    ));
    let batch_handle = tokio::spawn(run_batch_loop(
        executor,
        config.batch_window_secs,
        shutdown_rx.clone(),
    ));

    // Reconciler for batches a crash left open
    let reconciler = Arc::new(Reconciler::new(storage.clone(), config.reconcile_stale_secs));
    let reconcile_handle = tokio::spawn(run_reconcile_loop(
        reconciler,
        config.reconcile_interval_secs,
        shutdown_rx,
    ));

    info!(
        "🌑 Darkpool node running (batch window {}s, max batch size {})",
        config.batch_window_secs, config.max_batch_size
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    let _ = batch_handle.await;
    let _ = reconcile_handle.await;
    match server_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("API server exited with error: {}", e),
        Err(e) => error!("API server task panicked: {}", e),
    }

    info!("Node stopped");
    Ok(())
}
