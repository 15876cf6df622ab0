//! Production implementation of FloorContext using Tokio.

use crate::FloorContext;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Production context backed by Tokio and OS entropy.
///
/// Time comes from the system clock, randomness from the thread RNG.
pub struct TokioContext {
    /// Start time for monotonic duration calculations
    start: Instant,
}

impl TokioContext {
    /// Creates a new TokioContext.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Creates an Arc-wrapped context for sharing across tasks.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for TokioContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FloorContext for TokioContext {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(duration).await;
        }
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let _ = name;
        tokio::spawn(future);
    }

    fn derive_seed(&self, _extension: u64) -> u64 {
        // Production runs are not meant to be replayed
        rand::random()
    }

    fn seed(&self) -> u64 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tokio_context_time() {
        let ctx = TokioContext::new();
        let t1 = ctx.now();
        ctx.sleep(Duration::from_millis(10)).await;
        let t2 = ctx.now();

        assert!(t2 > t1);
        assert!(t2 - t1 >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_tokio_context_spawn_runs() {
        let ctx = TokioContext::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        ctx.spawn("tick", async move {
            let _ = tx.send(5u8);
        });
        assert_eq!(rx.await.unwrap(), 5);
    }

    #[test]
    fn test_tokio_context_seed() {
        let ctx = TokioContext::new();
        assert_eq!(ctx.seed(), 0);
    }
}
