use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Shared timer for per-invocation heartbeats.
///
/// Every heartbeat runs as its own task under a child of the pool's root token, so
/// `shutdown` stops all of them at once.
pub struct HeartbeatPool {
    root: CancellationToken,
}

/// Cancels one scheduled heartbeat. Dropping the handle does not cancel it.
#[derive(Debug, Clone)]
pub struct HeartbeatHandle {
    token: CancellationToken,
}

impl HeartbeatHandle {
    fn inert() -> Self {
        let token = CancellationToken::new();
        token.cancel();
        Self { token }
    }

    /// Stops future ticks. A tick already running finishes.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl HeartbeatPool {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
        }
    }

    /// Runs `tick` right away and then every `period` until cancelled.
    ///
    /// After `shutdown` the request is rejected with a warning and an already-cancelled handle.
    pub fn schedule<F, Fut>(&self, label: &str, period: Duration, mut tick: F) -> HeartbeatHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.root.is_cancelled() {
            tracing::warn!(label, "heartbeat rejected, pool is shut down");
            return HeartbeatHandle::inert();
        }
        let token = self.root.child_token();
        let task_token = token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    biased;
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => tick().await,
                }
            }
        });
        HeartbeatHandle { token }
    }

    pub fn shutdown(&self) {
        self.root.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.root.is_cancelled()
    }
}

impl Default for HeartbeatPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting(counter: &Arc<AtomicUsize>) -> impl FnMut() -> std::future::Ready<()> + Send {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_immediately_then_every_period() {
        let pool = HeartbeatPool::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = pool.schedule("test", Duration::from_secs(300), counting(&counter));

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        handle.cancel();
        tokio::time::sleep(Duration::from_secs(900)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(handle.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_running_and_rejects_new() {
        let pool = HeartbeatPool::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let running = pool.schedule("running", Duration::from_secs(60), counting(&counter));
        tokio::time::sleep(Duration::from_millis(1)).await;

        pool.shutdown();
        assert!(pool.is_shutdown());
        assert!(running.is_cancelled());

        let rejected = pool.schedule("late", Duration::from_secs(60), counting(&counter));
        assert!(rejected.is_cancelled());
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        rejected.cancel();
    }
}
