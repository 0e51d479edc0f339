//! # Bermy Common
//!
//! Shared error type, logging configuration and retry helpers for the Bermy
//! offline cache agent and the host that drives it.
//!
//! ## Features
//!
//! - Unified host-facing error type
//! - Logging configuration and setup
//! - Retry and timeout utilities

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, retry_with_backoff_if, with_timeout, RetryConfig};

/// Unified error type reported to the host.
#[derive(Error, Debug)]
pub enum BermyError {
    /// Transport-level network errors.
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Cache storage errors.
    #[error("Cache error: {message}")]
    Cache {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A precached resource could not be fetched or stored.
    #[error("Precache resource unavailable: {url}: {message}")]
    Precache { url: String, message: String },

    /// Lifecycle errors (invalid state transitions, failed activation).
    #[error("Lifecycle error: {message}")]
    Lifecycle {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout errors.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),
}

impl BermyError {
    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    /// Create a network error with source.
    pub fn network_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a cache error.
    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
            source: None,
        }
    }

    /// Create a cache error with source.
    pub fn cache_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Cache {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a lifecycle error.
    pub fn lifecycle(message: impl Into<String>) -> Self {
        Self::Lifecycle {
            message: message.into(),
            source: None,
        }
    }

    /// Create a lifecycle error with source.
    pub fn lifecycle_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Lifecycle {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error with source.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Check if the host may retry the operation that produced this error.
    ///
    /// A missing precache resource is retryable: the deployment may still be
    /// rolling out, and retry policy for failed installs belongs to the host.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BermyError::Network { .. }
                | BermyError::Precache { .. }
                | BermyError::Timeout(_)
                | BermyError::Io(_)
        )
    }

    /// Get the error category for logs.
    pub fn category(&self) -> &'static str {
        match self {
            BermyError::Network { .. } => "network",
            BermyError::Cache { .. } => "cache",
            BermyError::Precache { .. } => "precache",
            BermyError::Lifecycle { .. } => "lifecycle",
            BermyError::Config { .. } => "config",
            BermyError::Io(_) => "io",
            BermyError::Timeout(_) => "timeout",
            BermyError::NotFound(_) => "not_found",
        }
    }
}

/// Result type alias for host operations.
pub type Result<T> = std::result::Result<T, BermyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(BermyError::network("test").category(), "network");
        assert_eq!(BermyError::cache("test").category(), "cache");
        assert_eq!(
            BermyError::Precache {
                url: "/".into(),
                message: "404".into()
            }
            .category(),
            "precache"
        );
        assert_eq!(
            BermyError::Timeout(Duration::from_secs(1)).category(),
            "timeout"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(BermyError::network("test").is_retryable());
        assert!(BermyError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(BermyError::Precache {
            url: "/css/tachyons.min.css".into(),
            message: "connection refused".into()
        }
        .is_retryable());
        assert!(!BermyError::config("test").is_retryable());
        assert!(!BermyError::cache("test").is_retryable());
        assert!(!BermyError::NotFound("worker-1".into()).is_retryable());
    }

    #[test]
    fn test_source_is_kept() {
        use std::error::Error as _;

        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err = BermyError::cache_with_source("write failed", io);
        assert!(err.source().is_some());
        assert_eq!(err.to_string(), "Cache error: write failed");
    }
}
