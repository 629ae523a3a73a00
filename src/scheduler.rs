//! Deterministic scheduling primitives.
//!
//! All periodic work in the pipeline runs through [`Ticker`], which re-arms
//! after each run completes, so a slow iteration can never overlap the next
//! one. One-shot delays go through [`after`], which loses the race against
//! the shutdown token.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Sleep for `duration`, returning `false` if the token was cancelled first.
pub async fn after(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// A re-arming periodic schedule.
#[derive(Debug, Clone, Copy)]
pub struct Ticker {
    period: Duration,
}

impl Ticker {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Run `task` every period until `cancel` fires. The next arming starts
    /// after the previous run returns.
    pub async fn run<F, Fut>(&self, cancel: CancellationToken, mut task: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        loop {
            if !after(self.period, &cancel).await {
                return;
            }
            task().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn ticker_does_not_overlap_slow_runs() {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let handle = tokio::spawn(async move {
            Ticker::new(Duration::from_millis(100))
                .run(stop, move || {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        // Each run takes longer than the period.
                        tokio::time::sleep(Duration::from_millis(150)).await;
                    }
                })
                .await;
        });
        // 1 s of virtual time: with re-arming, each cycle is 100 + 150 ms.
        tokio::time::sleep(Duration::from_millis(1000)).await;
        cancel.cancel();
        handle.await.unwrap();
        let total = runs.load(Ordering::SeqCst);
        assert!(total == 4, "expected 4 non-overlapping runs, saw {total}");
    }

    #[tokio::test]
    async fn after_yields_to_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!after(Duration::from_secs(3600), &cancel).await);
    }
}
