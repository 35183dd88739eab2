//! capture-resync: recovers after a crash and keeps draining the durable
//! upload queue until interrupted.
//!
//! Usage: `capture-resync [config.toml]` (defaults to `capture.toml`).
//! The bearer token can be supplied through `CAPTURE_TOKEN`.

use protocol_capture::{CaptureConfig, CaptureError, CaptureServices};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        log::error!("{}", e);
        eprintln!("{}", e.user_message());
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CaptureError> {
    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("capture.toml"));
    let config = CaptureConfig::load(&path)?;
    log::info!("Using API at {}", config.api_base());

    let services = CaptureServices::from_config(config)?;
    if let Ok(token) = std::env::var("CAPTURE_TOKEN") {
        services.tokens.set_session_token(Some(token));
    }

    if let Some(report) = services.recovery.initialize().await? {
        log::warn!(
            "Previous session ended without shutdown ({}s since last heartbeat), {} queued uploads",
            report.gap_ms / 1000,
            report.queued_tasks.len()
        );
        if let Some(draft) = &report.resumable_draft {
            log::warn!("Unfinished protocol draft: {}", draft.protocol_id);
        }
    }

    let cancel = CancellationToken::new();
    let handle = services.resync.start(cancel.clone());

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Cannot listen for shutdown signal: {}", e);
    }
    log::info!("Shutting down");
    cancel.cancel();
    if let Some(handle) = handle {
        if let Err(e) = handle.await {
            log::error!("Resync loop ended abnormally: {}", e);
        }
    }

    for entry in services.resync.sweep_log().iter().rev().take(5) {
        log::debug!("Sweep at {}: {:?}", entry.ts_ms, entry.stats);
    }
    services.recovery.shutdown().await?;
    services.store.close();
    Ok(())
}
