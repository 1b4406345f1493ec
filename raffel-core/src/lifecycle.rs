//! Server lifecycle: start/stop ordering and drain semantics.
//!
//! Cancellation forms a forest: the server-wide token is the root, each
//! connection takes a child, and each call takes a child of its connection.
//! Shutdown cancels the root (reason "server shutting down"), stops
//! accepting, then waits up to the grace period for tracked tasks to drain.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

/// Shared shutdown/drain handle passed to every transport adapter.
#[derive(Clone)]
pub struct ServerHandle {
    token: CancellationToken,
    tracker: TaskTracker,
    grace: Duration,
}

impl ServerHandle {
    pub fn new(grace: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            grace,
        }
    }

    /// The server-wide cancellation root.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// A child token for one connection. Cancelling it cancels the
    /// connection's calls without touching the rest of the server.
    pub fn connection_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Spawn a task that shutdown will wait for (bounded by the grace
    /// period). Use for connection loops and in-flight invocation pumps.
    pub fn spawn_tracked<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(future)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when shutdown begins.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Begin shutdown: cancel every context in the forest, stop tracking
    /// new tasks, and wait for in-flight work up to the grace period.
    pub async fn shutdown(&self) {
        info!("shutdown: cancelling in-flight calls");
        self.token.cancel();
        self.tracker.close();
        if tokio::time::timeout(self.grace, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                grace_ms = self.grace.as_millis() as u64,
                "shutdown: grace period elapsed with tasks still running"
            );
        } else {
            info!("shutdown: drained");
        }
    }
}

/// Wait for a shutdown signal (Ctrl-C or SIGTERM on Unix).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            tracing::error!("failed to listen for Ctrl-C; shutting down");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => {
                tracing::error!("failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, starting graceful shutdown");
}
