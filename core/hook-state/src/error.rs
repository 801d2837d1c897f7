//! Error types for hook-state operations.
//!
//! None of these escape the engine's tracking operations as failures of the
//! hook itself. They surface as fields on [`crate::ExecutionResult`] or as the
//! `Err` side of best-effort maintenance calls.

use std::path::PathBuf;
use std::time::Duration;

/// Coarse failure class, used to pick the metric counter a failure lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    ConcurrentAccess,
    Persistence,
    Other,
}

/// All errors that can occur in hook-state operations.
#[derive(Debug, thiserror::Error)]
pub enum HookStateError {
    // ─────────────────────────────────────────────────────────────────────
    // Concurrency Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Failed to acquire lock for {operation} within {timeout:?}")]
    LockTimeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Background worker did not stop within {timeout:?}")]
    WorkerJoinTimeout { timeout: Duration },

    // ─────────────────────────────────────────────────────────────────────
    // Persistence Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("State persistence is disabled")]
    PersistenceDisabled,

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Invalid configuration value for {field}: {reason}")]
    ConfigInvalid { field: &'static str, reason: String },

    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // Input & Internal Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Invalid {field}: {reason}")]
    InvalidInput { field: &'static str, reason: String },

    #[error("Unexpected failure: {0}")]
    Unexpected(String),
}

impl HookStateError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        HookStateError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        HookStateError::Json {
            context: context.into(),
            source,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            HookStateError::LockTimeout { .. } => FailureKind::ConcurrentAccess,
            HookStateError::Io { .. } | HookStateError::Json { .. } => FailureKind::Persistence,
            _ => FailureKind::Other,
        }
    }
}

/// Convenience type alias for Results using HookStateError.
pub type Result<T> = std::result::Result<T, HookStateError>;

impl From<HookStateError> for String {
    fn from(err: HookStateError) -> String {
        err.to_string()
    }
}
