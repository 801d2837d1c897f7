//! Serialized state records.
//!
//! Timestamps are fractional Unix seconds so the files stay readable by the
//! shell tooling that also inspects them.
//!
//! ```json
//! // hook_execution_state.json
//! { "SessionStart": { "count": 2, "last_execution": 1700000000.5,
//!                     "last_phase": "compact", "executions": [ ... ] } }
//!
//! // command_execution_state.json
//! { "last_command": "/alfred:2-run", "last_timestamp": 1700000000.5,
//!   "is_running": true, "execution_count": 1, "duplicate_count": 0 }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookExecution {
    pub timestamp: f64,
    #[serde(default)]
    pub phase: Option<String>,
    pub execution_id: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HookRecord {
    #[serde(default)]
    pub count: u64,
    /// Zero means the hook has never executed.
    #[serde(default)]
    pub last_execution: f64,
    #[serde(default)]
    pub last_phase: Option<String>,
    #[serde(default)]
    pub executions: Vec<HookExecution>,
}

impl HookRecord {
    pub fn seconds_since_last(&self, now: f64) -> f64 {
        now - self.last_execution
    }

    /// Drops history entries older than `cutoff`, then trims the oldest
    /// entries down to `max_entries`. Returns how many were removed.
    pub fn prune_history(&mut self, cutoff: f64, max_entries: usize) -> usize {
        let before = self.executions.len();
        self.executions.retain(|entry| entry.timestamp >= cutoff);
        if self.executions.len() > max_entries {
            let excess = self.executions.len() - max_entries;
            self.executions.drain(..excess);
        }
        before - self.executions.len()
    }
}

/// Hook name → record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HookState {
    pub hooks: BTreeMap<String, HookRecord>,
}

impl HookState {
    pub fn get(&self, hook_name: &str) -> Option<&HookRecord> {
        self.hooks.get(hook_name)
    }

    pub fn entry(&mut self, hook_name: &str) -> &mut HookRecord {
        self.hooks.entry(hook_name.to_string()).or_default()
    }

    pub fn count_for(&self, hook_name: &str) -> u64 {
        self.get(hook_name).map_or(0, |record| record.count)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CommandRecord {
    #[serde(default)]
    pub last_command: Option<String>,
    #[serde(default)]
    pub last_timestamp: Option<f64>,
    #[serde(default)]
    pub is_running: bool,
    #[serde(default)]
    pub execution_count: u64,
    #[serde(default)]
    pub duplicate_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_timestamp: Option<f64>,
}

impl CommandRecord {
    /// True when `command` repeats the stored command inside `window_secs`.
    pub fn is_repeat_within(&self, command: &str, now: f64, window_secs: f64) -> bool {
        match (&self.last_command, self.last_timestamp) {
            (Some(last), Some(at)) => last == command && now - at < window_secs,
            _ => false,
        }
    }
}
