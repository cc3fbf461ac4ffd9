// [[CONDUIT]]/apps/kernel-server/src/main.rs
// Purpose: Entry point. Loads config, recovers orphaned tasks, serves until Ctrl-C.
// Architecture: Application Boot
// Dependencies: Axum, Tokio, anyhow

use anyhow::Context;
use std::time::Duration;

use conduit_kernel::observability;
use conduit_kernel::{router, KernelConfig, KernelState};

const RETENTION_SWEEP_EVERY: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init_tracing();

    tracing::info!("Initializing Conduit Kernel...");

    let config = KernelConfig::from_env().context("invalid configuration")?;
    if config.api_key.is_none() {
        tracing::warn!("KERNEL_API_KEY not set. Task API is unauthenticated.");
    }
    let port = config.port;

    let state = KernelState::build(config).await?;

    // === PERSISTENCE RECOVERY ===
    match state.dispatcher.recover_orphans().await {
        Ok(0) => {}
        Ok(n) => tracing::warn!("Marked {} tasks from a previous run as failed", n),
        Err(e) => tracing::error!("Orphan recovery failed: {}", e),
    }
    state.spawn_retention_sweeper(RETENTION_SWEEP_EVERY);

    let app = router(state.clone());

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    tracing::info!("Conduit Kernel listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    state.dispatcher.shutdown();
    tracing::info!("Conduit Kernel stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
