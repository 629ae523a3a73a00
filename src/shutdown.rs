//! Graceful shutdown on SIGTERM / SIGINT.
//!
//! A background task listens for either signal and cancels a shared token.
//! Every pipeline loop selects on the token: receivers stop pulling,
//! in-flight claims finish, WebSocket pumps stop, and the queue visibility
//! timeout covers anything interrupted mid-flight.

use tokio::signal::unix::SignalKind;
use tokio::signal::unix::signal;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Signal-driven shutdown coordinator.
pub struct ShutdownSignal {
    tracker: TaskTracker,
    token: CancellationToken,
}

impl ShutdownSignal {
    /// Register the signal handlers.
    ///
    /// Fails if signal registration with the runtime fails.
    pub fn try_new() -> Result<Self, std::io::Error> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let token = CancellationToken::new();
        let task_token = token.clone();
        let tracker = TaskTracker::new();
        tracker.spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("SIGTERM received, shutting down");
                }
                _ = sigint.recv() => {
                    tracing::info!("SIGINT received, shutting down");
                }
            }
            task_token.cancel();
        });
        tracker.close();
        Ok(Self { tracker, token })
    }

    /// Token to distribute to pipeline loops.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for a shutdown signal.
    pub async fn recv(&self) {
        self.token.cancelled().await;
        self.tracker.wait().await;
    }
}
