// src/error.rs

//! Unified error handling for the enrichment pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for enricher operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization failed
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// Configuration error (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed identity input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Record lookup failed
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Retryable failure from an external collaborator
    #[error("Transient external error: {0}")]
    TransientExternal(ExternalError),

    /// Concurrent write detected by the record store
    #[error("Store conflict on {identity}: expected revision {expected}, found {found}")]
    StoreConflict {
        identity: String,
        expected: u64,
        found: u64,
    },

    /// Retry budget for a stage transition is used up
    #[error("Retry budget exhausted for {identity} after {attempts} attempt(s)")]
    BudgetExhausted { identity: String, attempts: u32 },

    /// Record store backend failure
    #[error("Store error: {0}")]
    Store(String),
}

impl AppError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a store backend error.
    pub fn store(message: impl fmt::Display) -> Self {
        Self::Store(message.to_string())
    }

    /// Whether this error is a store conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::StoreConflict { .. })
    }
}

/// Failure category reported by the extraction or summarization client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalErrorKind {
    RateLimited,
    Timeout,
    NotFound,
    ContentTooLarge,
    ServerError,
}

impl ExternalErrorKind {
    /// Retrying cannot help with a missing page or an oversize input.
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::NotFound | Self::ContentTooLarge)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::NotFound => "not_found",
            Self::ContentTooLarge => "content_too_large",
            Self::ServerError => "server_error",
        }
    }
}

impl fmt::Display for ExternalErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error returned by an external collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ExternalError {
    pub kind: ExternalErrorKind,
    pub message: String,
}

impl ExternalError {
    pub fn new(kind: ExternalErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ExternalErrorKind::RateLimited, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ExternalErrorKind::Timeout, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ExternalErrorKind::NotFound, message)
    }

    pub fn too_large(message: impl Into<String>) -> Self {
        Self::new(ExternalErrorKind::ContentTooLarge, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(ExternalErrorKind::ServerError, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<reqwest::Error> for ExternalError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout(err.to_string())
        } else if let Some(status) = err.status() {
            crate::utils::http::classify_status(status.as_u16(), err.to_string())
        } else {
            Self::server(err.to_string())
        }
    }
}

impl From<ExternalError> for AppError {
    fn from(err: ExternalError) -> Self {
        Self::TransientExternal(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(ExternalErrorKind::RateLimited.is_retryable());
        assert!(ExternalErrorKind::Timeout.is_retryable());
        assert!(ExternalErrorKind::ServerError.is_retryable());
        assert!(!ExternalErrorKind::NotFound.is_retryable());
        assert!(!ExternalErrorKind::ContentTooLarge.is_retryable());
    }

    #[test]
    fn external_error_display() {
        let err = ExternalError::rate_limited("slow down");
        assert_eq!(err.to_string(), "rate_limited: slow down");
    }

    #[test]
    fn conflict_detection() {
        let err = AppError::StoreConflict {
            identity: "mit::mit.edu/ds".into(),
            expected: 1,
            found: 2,
        };
        assert!(err.is_conflict());
        assert!(!AppError::validation("nope").is_conflict());
    }

    #[test]
    fn external_error_converts_to_transient() {
        let err = AppError::from(ExternalError::timeout("extractor took too long"));
        assert!(matches!(err, AppError::TransientExternal(ref e) if e.kind == ExternalErrorKind::Timeout));
        assert_eq!(
            err.to_string(),
            "Transient external error: timeout: extractor took too long"
        );
    }
}
