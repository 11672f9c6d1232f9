//! Error types for CarbonBOM.
//!
//! Library crates use [`CarbonBomError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all CarbonBOM operations.
#[derive(Debug, thiserror::Error)]
pub enum CarbonBomError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Reasoning-oracle transport error (HTTP, timeout, non-2xx reply).
    #[error("oracle error: {0}")]
    Oracle(String),

    /// Structured-reply parse error (strict `*key: value` grammar rejection).
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or node-store layer error.
    #[error("store error: {0}")]
    Store(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (tree invariant breach, invalid input, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, CarbonBomError>;

impl CarbonBomError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = CarbonBomError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = CarbonBomError::parse("missing *mass_value field");
        assert!(err.to_string().contains("*mass_value"));
    }
}
