//! Error types for conch-core.

use std::io;

/// Error type for conch-core operations.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Terminal operation failed.
    #[error("terminal error: {0}")]
    Terminal(String),

    /// Layout validation or region lookup failed.
    #[error("layout error: {0}")]
    Layout(String),

    /// Invalid argument or state.
    #[error("validation error: {0}")]
    Validation(String),
}

/// Result type alias for conch-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CoreError::Terminal("no tty".into());
        assert_eq!(err.to_string(), "terminal error: no tty");
    }

    #[test]
    fn io_error_converts() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "missing");
        let err: CoreError = io_err.into();
        assert!(matches!(err, CoreError::Io(_)));
    }

    #[test]
    fn layout_error_display() {
        let err = CoreError::Layout("region outside terminal".into());
        assert_eq!(err.to_string(), "layout error: region outside terminal");
    }
}
