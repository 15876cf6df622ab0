//! Core environment context trait for Floorcast engines.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// The central interface for environment interaction.
///
/// This trait abstracts the "real world" so that the day simulation and
/// the Monte Carlo engine can run against wall-clock time in production
/// and against a virtual clock under test.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`, OS entropy
/// - **Simulation**: `SimContext` - virtual clock, `ChaCha8Rng(seed)`
#[async_trait]
pub trait FloorContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// In simulation, this is the virtual clock time.
    fn now(&self) -> Duration;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances the virtual clock and yields
    async fn sleep(&self, duration: Duration);

    /// Spawns a detached background task.
    ///
    /// Used for fire-and-forget work such as forecast refreshes that must
    /// not block the caller's loop.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Derives a seed for a sub-component (one trial, one day run).
    ///
    /// Simulation contexts combine the master seed with `extension` so
    /// the result is reproducible; production draws fresh entropy.
    fn derive_seed(&self, extension: u64) -> u64;

    /// Returns the context's master seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    fn seed(&self) -> u64;
}
