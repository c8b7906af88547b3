//! Error types for the native unit orchestrator.
//!
//! Every error maps onto one of the numeric codes published to the state
//! store (see [`Error::code`]).

use crate::constants::{
    ERROR_CODE_DUPLICATE, ERROR_CODE_GENERIC, ERROR_CODE_NOT_FOUND, ERROR_CODE_UNSUPPORTED,
};

/// Result type alias for orchestrator operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving native units.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// Instance not present in the local table.
    #[error("instance not found: {0}")]
    NotFound(String),

    /// Instance already present in the local table.
    #[error("instance already exists: {0}")]
    AlreadyExists(String),

    /// Operation requested from the wrong lifecycle state.
    #[error("instance '{id}' is in state '{state}', expected '{expected}'")]
    IllegalTransition {
        id: String,
        state: String,
        expected: String,
    },

    /// Operation the native plugin never performs (pause, resume, migrate).
    #[error("operation '{operation}' not supported for instance '{id}'")]
    UnsupportedOperation { id: String, operation: String },

    // =========================================================================
    // Process Errors
    // =========================================================================
    /// Spawning or supervising the unit process failed.
    #[error("execution failed for instance '{id}': {reason}")]
    ExecutionFailure { id: String, reason: String },

    /// Signal delivery failed.
    #[error("failed to signal pid {pid}: {reason}")]
    SignalFailed { pid: i32, reason: String },

    // =========================================================================
    // Staging Errors
    // =========================================================================
    /// Artifact download, copy or extraction failed.
    #[error("artifact '{reference}' failed: {reason}")]
    ArtifactFailed { reference: String, reason: String },

    /// Artifact exceeded the configured size limit.
    #[error("artifact exceeds size limit: {size} > {limit} bytes")]
    ArtifactTooLarge { size: u64, limit: u64 },

    /// Requested instance file is missing or a directory.
    #[error("file not exists or is directory")]
    FileUnavailable { path: String },

    /// Path traversal attempt detected in an archive or file request.
    #[error("path traversal detected: {path}")]
    PathTraversal { path: String },

    // =========================================================================
    // Network Errors
    // =========================================================================
    /// A namespace or interface primitive failed.
    #[error("network operation '{operation}' failed: {reason}")]
    NetworkFailed { operation: String, reason: String },

    // =========================================================================
    // Input / Configuration Errors
    // =========================================================================
    /// Malformed caller input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Invalid node configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Numeric code reported to the state store alongside the message.
    pub fn code(&self) -> i32 {
        match self {
            Error::AlreadyExists(_) => ERROR_CODE_DUPLICATE,
            Error::UnsupportedOperation { .. } => ERROR_CODE_UNSUPPORTED,
            Error::NotFound(_) => ERROR_CODE_NOT_FOUND,
            _ => ERROR_CODE_GENERIC,
        }
    }

    /// Shorthand for [`Error::UnsupportedOperation`].
    pub fn unsupported(id: &str, operation: &str) -> Self {
        Error::UnsupportedOperation {
            id: id.to_string(),
            operation: operation.to_string(),
        }
    }

    /// Shorthand for [`Error::ExecutionFailure`].
    pub fn execution(id: &str, reason: impl std::fmt::Display) -> Self {
        Error::ExecutionFailure {
            id: id.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Shorthand for [`Error::NetworkFailed`].
    pub fn network(operation: &str, reason: impl std::fmt::Display) -> Self {
        Error::NetworkFailed {
            operation: operation.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
