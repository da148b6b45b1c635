//! Graceful shutdown on SIGINT / SIGTERM.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use eyre::Result;
use tokio::{signal, sync::broadcast};

#[derive(Debug, Clone)]
pub enum ShutdownReason {
    /// SIGINT or SIGTERM received.
    Signal,
    /// Shutdown requested programmatically.
    Requested,
}

/// Coordinates shutdown: one task listens for signals, everyone else waits
/// on the broadcast.
pub struct GracefulShutdown {
    shutdown_tx: broadcast::Sender<ShutdownReason>,
    initiated: Arc<AtomicBool>,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            initiated: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_initiated(&self) -> bool {
        self.initiated.load(Ordering::Relaxed)
    }

    pub fn trigger(&self, reason: ShutdownReason) {
        if self
            .initiated
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            tracing::info!(?reason, "shutdown triggered");
            let _ = self.shutdown_tx.send(reason);
        }
    }

    /// Listen for OS signals and broadcast the first one seen.
    pub async fn run_signal_handler(&self) -> Result<()> {
        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("received SIGINT, initiating graceful shutdown");
            }
            _ = wait_for_sigterm() => {
                tracing::info!("received SIGTERM, initiating graceful shutdown");
            }
        }
        self.trigger(ShutdownReason::Signal);
        Ok(())
    }

    /// Resolve once shutdown is triggered.
    pub async fn wait_for_shutdown_signal(&self) -> ShutdownReason {
        let mut rx = self.shutdown_tx.subscribe();
        if self.is_initiated() {
            return ShutdownReason::Requested;
        }
        rx.recv().await.unwrap_or(ShutdownReason::Requested)
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to register SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
