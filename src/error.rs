//! Error types for FieldSync
//!
//! Every failure inside the engine is converted to `SyncError`.
//! Task outcomes are observed by many waiters, so a rejected task
//! stores its error behind an `Arc` (see [`crate::sync::TaskResult`]).

use std::sync::Arc;
use thiserror::Error;

use crate::sync::JobStatus;

/// Engine-wide error type
#[derive(Debug, Error)]
pub enum SyncError {
    /// Record or resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Table does not exist in the local store
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    /// Table or column name that cannot be used as an SQL identifier
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Malformed input (payloads, records, configuration values)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Local store error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Local store migration failed
    #[error("Migration failed: {0}")]
    Migration(String),

    /// HTTP client error (connection refused, timeout, body decoding)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Remote authority answered with a failure status
    #[error("Transport error (HTTP {status}): {message}")]
    Transport { status: u16, message: String },

    /// Wire document could not be encoded or decoded
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Local file storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A job was moved out of a terminal status
    #[error("Invalid job transition for {job}: {from} -> {to}")]
    InvalidTransition {
        job: String,
        from: JobStatus,
        to: JobStatus,
    },

    /// Job was cancelled before its result could be trusted
    #[error("Job cancelled")]
    Cancelled,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl SyncError {
    /// Short, stable label used for metrics and sync-log entries
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::NotFound(_) => "not_found",
            SyncError::UnknownTable(_) => "unknown_table",
            SyncError::InvalidIdentifier(_) => "invalid_identifier",
            SyncError::Validation(_) => "validation",
            SyncError::Database(_) => "database",
            SyncError::Migration(_) => "migration",
            SyncError::HttpClient(_) => "http_client",
            SyncError::Transport { .. } => "transport",
            SyncError::Encoding(_) => "encoding",
            SyncError::Storage(_) => "storage",
            SyncError::Config(_) => "config",
            SyncError::InvalidTransition { .. } => "invalid_transition",
            SyncError::Cancelled => "cancelled",
            SyncError::Internal(_) => "internal",
        }
    }

    /// Whether the failure came from talking to the remote authority
    pub fn is_transport(&self) -> bool {
        matches!(self, SyncError::HttpClient(_) | SyncError::Transport { .. })
    }
}

impl From<config::ConfigError> for SyncError {
    fn from(err: config::ConfigError) -> Self {
        SyncError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Encoding(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for SyncError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        SyncError::Migration(err.to_string())
    }
}

/// Unwrap the error of a rejected task, copying it when other waiters
/// still share it
impl From<Arc<SyncError>> for SyncError {
    fn from(err: Arc<SyncError>) -> Self {
        Arc::try_unwrap(err).unwrap_or_else(|shared| match &*shared {
            SyncError::NotFound(what) => SyncError::NotFound(what.clone()),
            SyncError::UnknownTable(table) => SyncError::UnknownTable(table.clone()),
            SyncError::Validation(message) => SyncError::Validation(message.clone()),
            SyncError::Transport { status, message } => SyncError::Transport {
                status: *status,
                message: message.clone(),
            },
            SyncError::Encoding(message) => SyncError::Encoding(message.clone()),
            SyncError::Storage(message) => SyncError::Storage(message.clone()),
            SyncError::Cancelled => SyncError::Cancelled,
            other => SyncError::Internal(anyhow::anyhow!("{}", other)),
        })
    }
}

/// Result type alias using SyncError
pub type Result<T> = std::result::Result<T, SyncError>;
