//! lxp-daemon entry point.
//!
//! This file is intentionally thin: it sets up tracing, builds the
//! handler registry, boots the worker pool, and waits for shutdown.
//! The boot sequence lives in `boot.rs`.

use std::sync::Arc;

use anyhow::Context;
use lxp_worker::HandlerRegistry;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file
    // does not exist — production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    // Handlers for business job types (chat response, content indexing,
    // taxonomy refinement, …) are registered by the embedding
    // application; a bare daemon still claims, parks frozen types, and
    // fails undispatchable jobs visibly.
    let registry = Arc::new(HandlerRegistry::new());

    let daemon = lxp_daemon::boot(registry).await.context("daemon boot failed")?;
    info!("lxp-daemon running; press ctrl-c to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    info!("shutdown requested; draining workers");
    daemon.handle.shutdown().await;
    info!("worker pool drained; bye");

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}
