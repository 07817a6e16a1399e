//! Unified error type for the seqsieve library.
//!
//! Library code returns `SieveError`; the CLI wraps it in `anyhow::Result`
//! at the top level.
//!
//! # Error Categories
//!
//! - **Io**: File system operations (open, read, write, map)
//! - **Format**: Invalid file structure (magic bytes, record sizes)
//! - **Config**: Build-time contract violations (unsupported match mode,
//!   invalid parameters); not recoverable at runtime
//! - **Validation**: Invalid data encountered while loading or building
//! - **Overflow**: A value exceeded a format or safety limit
//!
//! A container whose VERSION record does not match is deliberately NOT an
//! error: `is_index_container` returns `false` and the caller rebuilds.

use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum SieveError {
    /// I/O error with path context.
    Io {
        path: PathBuf,
        operation: &'static str,
        source: std::io::Error,
    },

    /// Invalid file format (magic bytes, truncated records, bad sizes).
    Format { path: PathBuf, detail: String },

    /// Configuration contract violation. Fatal: the CLI exits nonzero.
    Config(String),

    /// Validation error (invalid parameters or data invariants).
    Validation(String),

    /// A value exceeded a format or safety limit.
    Overflow {
        context: String,
        limit: usize,
        actual: usize,
    },
}

impl fmt::Display for SieveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SieveError::Io {
                path,
                operation,
                source,
            } => {
                write!(
                    f,
                    "I/O error during {} on '{}': {}",
                    operation,
                    path.display(),
                    source
                )
            }
            SieveError::Format { path, detail } => {
                write!(f, "Invalid format in '{}': {}", path.display(), detail)
            }
            SieveError::Config(msg) => write!(f, "Configuration error: {}", msg),
            SieveError::Validation(msg) => write!(f, "Validation error: {}", msg),
            SieveError::Overflow {
                context,
                limit,
                actual,
            } => {
                write!(
                    f,
                    "Overflow in {}: limit is {}, got {}",
                    context, limit, actual
                )
            }
        }
    }
}

impl std::error::Error for SieveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SieveError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SieveError {
    fn from(err: std::io::Error) -> Self {
        SieveError::Io {
            path: PathBuf::new(),
            operation: "unknown",
            source: err,
        }
    }
}

/// Convenience type alias for Results using SieveError.
pub type Result<T> = std::result::Result<T, SieveError>;

impl SieveError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, operation: &'static str, source: std::io::Error) -> Self {
        SieveError::Io {
            path: path.into(),
            operation,
            source,
        }
    }

    /// Create a format error.
    pub fn format(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        SieveError::Format {
            path: path.into(),
            detail: detail.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        SieveError::Config(msg.into())
    }

    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        SieveError::Validation(msg.into())
    }

    /// Create an overflow error.
    pub fn overflow(context: impl Into<String>, limit: usize, actual: usize) -> Self {
        SieveError::Overflow {
            context: context.into(),
            limit,
            actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_display() {
        let err = SieveError::io(
            "/path/to/db.ssidx",
            "read",
            std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/path/to/db.ssidx"));
        assert!(msg.contains("read"));
        assert!(msg.contains("file not found"));
    }

    #[test]
    fn test_format_error_display() {
        let err = SieveError::format("/path/to/db.ssidx", "invalid magic bytes");
        let msg = err.to_string();
        assert!(msg.contains("/path/to/db.ssidx"));
        assert!(msg.contains("invalid magic bytes"));
    }

    #[test]
    fn test_config_error_display() {
        let err = SieveError::config("match mode 7 is not supported");
        assert!(err.to_string().contains("match mode 7"));
    }

    #[test]
    fn test_overflow_error_display() {
        let err = SieveError::overflow("sequence length", 100, 150);
        let msg = err.to_string();
        assert!(msg.contains("sequence length"));
        assert!(msg.contains("100"));
        assert!(msg.contains("150"));
    }

    #[test]
    fn test_error_source_chain() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let err = SieveError::io("/path", "open", io_err);
        assert!(std::error::Error::source(&err).is_some());
    }
}
