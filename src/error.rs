//! Error types for a3s-audit

use thiserror::Error;

/// Errors that can occur in the audit pipeline
#[derive(Debug, Error)]
pub enum AuditError {
    /// Raw event failed shape validation
    #[error("Invalid audit event: {0}")]
    InvalidEvent(String),

    /// Append to the audit log failed
    #[error("Failed to persist audit record to '{path}': {reason}")]
    Persistence {
        path: String,
        reason: String,
    },

    /// Write attempted after the writer was closed
    #[error("Audit writer is closed")]
    WriterClosed,

    /// Subsystem could not be brought up (audit directory, config)
    #[error("Initialization failed: {0}")]
    Initialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Query engine failure
    #[error("Query error: {0}")]
    Query(String),

    /// Webhook transport failure
    #[error("Webhook error: {0}")]
    Webhook(String),

    /// Malformed or unsupported audit URI
    #[error("Invalid audit URI '{0}'")]
    Uri(String),

    /// Operation rejected because the coordinator is not running
    #[error("Audit coordinator is not accepting events")]
    ShuttingDown,

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for audit operations
pub type Result<T> = std::result::Result<T, AuditError>;
