//! Graceful shutdown handling.
//!
//! [`ShutdownCoordinator`] turns SIGTERM/SIGINT (Ctrl+C elsewhere) into a
//! [`CancellationToken`] that the worker pool watches. Workers finish the
//! run in hand and stop taking jobs.

use std::time::Duration;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::queue::WorkerPool;

#[derive(Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled when shutdown is requested. Child tokens made from
    /// it are cancelled too.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Request shutdown. Can be called multiple times safely.
    pub fn request_shutdown(&self) {
        if !self.token.is_cancelled() {
            info!("Shutdown requested");
            self.token.cancel();
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once shutdown is requested, immediately if it already was.
    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// Spawn a task that requests shutdown on SIGTERM or SIGINT.
    pub fn start_signal_listener(&self) {
        let coordinator = self.clone();

        tokio::spawn(async move {
            #[cfg(unix)]
            {
                use signal::unix::{signal as unix_signal, SignalKind};

                let mut sigterm = match unix_signal(SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("Failed to create SIGTERM handler: {}", e);
                        signal::ctrl_c().await.ok();
                        coordinator.request_shutdown();
                        return;
                    }
                };

                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, initiating graceful shutdown");
                    }
                    _ = signal::ctrl_c() => {
                        info!("Received SIGINT, initiating graceful shutdown");
                    }
                    _ = coordinator.token.cancelled() => return,
                }
            }

            #[cfg(not(unix))]
            {
                tokio::select! {
                    result = signal::ctrl_c() => {
                        if let Err(e) = result {
                            warn!("Failed to listen for Ctrl+C: {}", e);
                            return;
                        }
                        info!("Received Ctrl+C, initiating graceful shutdown");
                    }
                    _ = coordinator.token.cancelled() => return,
                }
            }

            coordinator.request_shutdown();
        });
    }

    /// Wait for shutdown, then give the pool `grace` to drain. Returns
    /// false if workers were still busy when the grace period ran out.
    pub async fn drain(&self, pool: WorkerPool, grace: Duration) -> bool {
        self.wait_for_shutdown().await;
        pool.shutdown();
        match tokio::time::timeout(grace, pool.join()).await {
            Ok(()) => {
                info!("All workers stopped");
                true
            }
            Err(_) => {
                warn!(grace_secs = grace.as_secs(), "Workers still busy after grace period");
                false
            }
        }
    }
}
