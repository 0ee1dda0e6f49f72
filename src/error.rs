//! Error types for chat-harvest.

use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDate;

use crate::model::{FailedRange, FetchChunk, Platform};

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by a platform adapter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdapterError {
    #[error("Transient error from {platform}: {reason}")]
    Transient { platform: Platform, reason: String },

    #[error("Credentials for {platform} have expired")]
    AuthExpired { platform: Platform },

    #[error("{platform} resource not found: {resource}")]
    NotFound { platform: Platform, resource: String },

    #[error("Invalid response from {platform}: {reason}")]
    InvalidResponse { platform: Platform, reason: String },
}

impl AdapterError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, AdapterError::Transient { .. })
    }

    /// Map an HTTP status into the adapter taxonomy.
    pub fn from_status(platform: Platform, status: reqwest::StatusCode, resource: &str) -> Self {
        match status.as_u16() {
            401 => AdapterError::AuthExpired { platform },
            404 | 410 => AdapterError::NotFound {
                platform,
                resource: resource.to_string(),
            },
            408 | 425 | 429 => AdapterError::Transient {
                platform,
                reason: format!("HTTP {status} for {resource}"),
            },
            _ if status.is_server_error() => AdapterError::Transient {
                platform,
                reason: format!("HTTP {status} for {resource}"),
            },
            _ => AdapterError::InvalidResponse {
                platform,
                reason: format!("HTTP {status} for {resource}"),
            },
        }
    }

    /// Map a transport-level reqwest failure.
    pub fn from_reqwest(platform: Platform, err: reqwest::Error) -> Self {
        if err.is_decode() {
            AdapterError::InvalidResponse {
                platform,
                reason: err.to_string(),
            }
        } else {
            AdapterError::Transient {
                platform,
                reason: err.to_string(),
            }
        }
    }
}

/// Cache store errors. Never surfaced to callers of the fetch API.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt cache entry {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cache write task failed: {0}")]
    Task(String),
}

/// The only errors surfaced by `get_messages`.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("All {} chunk(s) failed to fetch", failed_ranges.len())]
    Total { failed_ranges: Vec<FailedRange> },

    #[error(
        "{} chunk(s) failed to fetch ({} succeeded)",
        failed_ranges.len(),
        succeeded_ranges.len()
    )]
    Partial {
        succeeded_ranges: Vec<FetchChunk>,
        failed_ranges: Vec<FailedRange>,
    },

    #[error("Credentials for {platform} have expired")]
    AuthExpired { platform: Platform },

    #[error("Invalid date range: {start} is after {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },

    #[error("Fetch timed out after {after:?}")]
    TimedOut { after: Duration },

    #[error("No adapter registered for {platform}")]
    UnknownPlatform { platform: Platform },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias using the crate's Error.
pub type Result<T> = std::result::Result<T, Error>;
