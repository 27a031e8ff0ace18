//! Error types for the QA annotation pipeline
//!
//! `PipelineError` is the error every stage, store and service returns. Queue
//! backends report `MqError`, configuration loading reports `ConfigError` and
//! the SQLite task store surfaces `sqlx::Error`; all of them fold into
//! `PipelineError` through `From`.

use crate::model::TaskStatus;
use crate::mq::MqError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Maximum length of error text stored in dead-letter entries and unit records
pub const MAX_ERROR_TEXT_LEN: usize = 500;

/// Main error type for pipeline operations
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("Duplicate content hash: {content_hash}")]
    Duplicate { content_hash: String },

    #[error("Backend unavailable: {message}")]
    TransientBackend { message: String },

    #[error("Conflict on {data_id}: status is {actual}, expected one of [{expected}]")]
    Conflict {
        data_id: String,
        expected: String,
        actual: TaskStatus,
    },

    #[error("Configuration error: {0}")]
    Configuration(#[from] crate::config::ConfigError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Import failed: {message}")]
    Import { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Queue error: {0}")]
    Queue(#[from] MqError),

    #[error("Task store error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl PipelineError {
    /// Create validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create duplicate error for a content hash
    pub fn duplicate<S: Into<String>>(content_hash: S) -> Self {
        Self::Duplicate {
            content_hash: content_hash.into(),
        }
    }

    /// Create transient backend error
    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self::TransientBackend {
            message: message.into(),
        }
    }

    /// Create conflict error from the statuses a caller expected
    pub fn conflict(data_id: &str, expected: &[TaskStatus], actual: TaskStatus) -> Self {
        let expected = expected
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        Self::Conflict {
            data_id: data_id.to_string(),
            expected,
            actual,
        }
    }

    /// Create not found error
    pub fn not_found<S: Into<String>>(what: S) -> Self {
        Self::NotFound(what.into())
    }

    /// Create import error
    pub fn import<S: Into<String>>(message: S) -> Self {
        Self::Import {
            message: message.into(),
        }
    }

    /// Whether a consumer should request redelivery instead of dead-lettering
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::TransientBackend { .. } => true,
            PipelineError::Queue(e) => e.is_transient(),
            PipelineError::Storage(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }

    /// Error text safe to persist in dead-letter entries and unit records
    pub fn sanitized(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("secret pattern compiles")
});

static SECRET_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .expect("secret path pattern compiles")
});

/// Sanitize error text before it is stored or published
///
/// Redacts `key=value` style secrets and credential paths, then caps the
/// result at [`MAX_ERROR_TEXT_LEN`] characters.
pub fn sanitize_error_message(message: &str) -> String {
    let sanitized = SECRET_PATTERN.replace_all(message, "${1}=***");
    let sanitized = SECRET_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .to_string();

    if sanitized.chars().count() > MAX_ERROR_TEXT_LEN {
        let truncate_suffix = "...[truncated]";
        let max_content_len = MAX_ERROR_TEXT_LEN - truncate_suffix.len();
        let head: String = sanitized.chars().take(max_content_len).collect();
        return format!("{head}{truncate_suffix}");
    }

    sanitized
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;
