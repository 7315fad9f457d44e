//! Ctrl-C driven shutdown for the daemon's background tasks.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ShutdownManager {
    cancel_token: CancellationToken,
    task_handles: Vec<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            task_handles: Vec::new(),
        }
    }

    /// Cancelled once shutdown starts.
    pub fn token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn register_task(&mut self, handle: JoinHandle<()>) {
        self.task_handles.push(handle);
    }

    /// Waits for ctrl-c (or an external cancel), then for registered tasks.
    pub async fn wait_for_shutdown(self) {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    tracing::error!(error = %e, "Failed to listen for shutdown signal");
                }
                tracing::info!("Shutdown signal received");
            }
            _ = self.cancel_token.cancelled() => {}
        }
        self.shutdown(SHUTDOWN_TIMEOUT).await;
    }

    /// Cancels the token and waits up to `timeout` for registered tasks.
    /// Returns false if some task was still running.
    pub async fn shutdown(mut self, timeout: Duration) -> bool {
        self.cancel_token.cancel();

        let handles = std::mem::take(&mut self.task_handles);
        let join_all = async {
            for handle in handles {
                let _ = handle.await;
            }
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(()) => {
                tracing::info!("All tasks shut down gracefully");
                true
            }
            Err(_) => {
                tracing::warn!("Shutdown timeout: some tasks did not complete");
                false
            }
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}
