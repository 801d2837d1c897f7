//! Values returned to callers of the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// The decision for one tracking call. Never persisted.
///
/// `executed` is true whenever the engine could not safely decide otherwise.
/// A failed lock or an internal fault shows up in `error`/`warning`, never as
/// a blocked hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub executed: bool,
    pub duplicate: bool,
    pub execution_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub execution_count: u64,
    pub duplicate_count: u64,
    pub execution_time_ms: f64,
    pub state_operations_count: u32,
    pub cache_hit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    /// A fresh "go ahead" result with a new execution id.
    pub fn allowed(timestamp: DateTime<Utc>) -> Self {
        ExecutionResult {
            executed: true,
            duplicate: false,
            execution_id: new_execution_id(),
            timestamp,
            hook_name: None,
            phase: None,
            command: None,
            reason: None,
            execution_count: 0,
            duplicate_count: 0,
            execution_time_ms: 0.0,
            state_operations_count: 0,
            cache_hit: false,
            warning: None,
            error: None,
        }
    }

    /// The result returned when tracking itself failed: execution proceeds
    /// and the failure is attached.
    pub fn degraded(timestamp: DateTime<Utc>, error: impl Into<String>, warning: &str) -> Self {
        ExecutionResult {
            error: Some(error.into()),
            warning: Some(warning.to_string()),
            ..ExecutionResult::allowed(timestamp)
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.error.is_some()
    }
}

pub fn new_execution_id() -> String {
    Ulid::new().to_string()
}
