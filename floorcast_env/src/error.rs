//! Error types for the Floorcast environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// A background task could not be started
    #[error("Spawn error: {0}")]
    SpawnError(String),

    /// A spawned task panicked or was aborted before producing a value
    #[error("Join error: {0}")]
    JoinError(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a join error from anything printable (usually `tokio::task::JoinError`).
    pub fn join(err: impl std::fmt::Display) -> Self {
        Self::JoinError(err.to_string())
    }

    /// Creates a timeout error from a duration.
    pub fn timeout(after: std::time::Duration) -> Self {
        Self::Timeout(after.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_timeout_message() {
        let err = EnvError::timeout(Duration::from_secs(2));
        assert_eq!(err.to_string(), "Timeout after 2000ms");
    }

    #[test]
    fn test_join_message() {
        let err = EnvError::join("task 7 panicked");
        assert!(matches!(err, EnvError::JoinError(ref m) if m == "task 7 panicked"));
    }
}
