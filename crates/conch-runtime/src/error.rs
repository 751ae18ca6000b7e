//! Error types for conch-runtime.

use std::io;

/// Error type for runtime operations.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Error surfaced from the core layer.
    #[error(transparent)]
    Core(#[from] conch_core::CoreError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// State (de)serialization failed.
    #[error("state serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// A read was cancelled by Ctrl+C or context cancellation.
    #[error("interrupted")]
    Interrupted,

    /// Lifecycle misuse: registration while running, duplicate or
    /// missing component, double start.
    #[error("lifecycle error: {0}")]
    Lifecycle(String),

    /// State manager misuse (no open transaction, missing file).
    #[error("state error: {0}")]
    State(String),

    /// Event delivery failed in a subscriber.
    #[error("event handler error: {0}")]
    Handler(String),

    /// A queue or service was already shut down.
    #[error("closed: {0}")]
    Closed(String),
}

impl RuntimeError {
    /// Whether this error is the distinguishable interruption marker.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, RuntimeError::Interrupted)
    }
}

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupted_is_distinguishable() {
        assert!(RuntimeError::Interrupted.is_interrupted());
        assert!(!RuntimeError::Lifecycle("x".into()).is_interrupted());
    }

    #[test]
    fn core_error_converts() {
        let core = conch_core::CoreError::Terminal("gone".into());
        let err: RuntimeError = core.into();
        assert_eq!(err.to_string(), "terminal error: gone");
    }
}
