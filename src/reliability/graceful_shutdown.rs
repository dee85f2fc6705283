//! Graceful shutdown handling.
//!
//! One [`GracefulShutdown`] is created at startup; every listener and
//! background loop holds a child of its cancellation token and winds down when
//! it fires.

use std::future::Future;
use std::time::Duration;

use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Handle for managing graceful shutdown.
#[derive(Clone, Default)]
pub struct GracefulShutdown {
    token: CancellationToken,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that is cancelled when shutdown begins.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Trigger graceful shutdown.
    pub fn shutdown(&self) {
        if !self.token.is_cancelled() {
            info!("Initiating graceful shutdown");
        }
        self.token.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once shutdown has been triggered.
    pub async fn wait(&self) {
        self.token.cancelled().await
    }

    /// Trigger shutdown on SIGINT or SIGTERM.
    pub fn listen_for_signals(&self) -> JoinHandle<()> {
        let shutdown = self.clone();

        tokio::spawn(async move {
            let ctrl_c = async {
                if let Err(e) = signal::ctrl_c().await {
                    error!("Failed to install Ctrl+C handler: {}", e);
                    std::future::pending::<()>().await;
                }
            };

            #[cfg(unix)]
            let terminate = async {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut stream) => {
                        stream.recv().await;
                    }
                    Err(e) => {
                        error!("Failed to install SIGTERM handler: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            };

            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            tokio::select! {
                _ = ctrl_c => info!("Received Ctrl+C signal"),
                _ = terminate => info!("Received SIGTERM signal"),
                _ = shutdown.wait() => return,
            }

            shutdown.shutdown();
        })
    }

    /// Spawn a task that is handed its own shutdown token.
    pub fn spawn<F, Fut>(&self, name: &'static str, task: F) -> JoinHandle<()>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let fut = task(self.token());
        tokio::spawn(async move {
            fut.await;
            info!("Task '{}' stopped", name);
        })
    }
}

/// Wait for `tasks` to finish, giving up after `grace_period`.
pub async fn drain_tasks(tasks: Vec<JoinHandle<()>>, grace_period: Duration) -> bool {
    let remaining = tasks.len();
    match tokio::time::timeout(grace_period, futures::future::join_all(tasks)).await {
        Ok(results) => {
            for result in results.into_iter().filter_map(|result| result.err()) {
                warn!("Task ended abnormally: {}", result);
            }
            true
        }
        Err(_) => {
            warn!(
                "Grace period ({:?}) exceeded with up to {} tasks still running",
                grace_period, remaining
            );
            false
        }
    }
}
