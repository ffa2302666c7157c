//! OS signal handling.
//!
//! SIGINT and SIGTERM both mean drain-and-exit. Uses Tokio's async-safe
//! signal primitives; on non-Unix targets only Ctrl+C is wired.

use crate::lifecycle::Shutdown;

/// Wait for SIGINT or SIGTERM, then trigger shutdown. Intended to be
/// spawned once per process.
pub async fn shutdown_on_signals(shutdown: &Shutdown) {
    wait_for_signal().await;
    tracing::info!("shutdown signal received");
    shutdown.trigger();
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
