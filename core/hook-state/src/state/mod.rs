//! Persisted hook and command state.
//!
//! Each engine owns two [`JsonStateStore`]s in its state directory:
//!
//! ```text
//! <state_dir>/
//! ├── hook_execution_state.json      # hook name → HookRecord
//! ├── command_execution_state.json   # single CommandRecord
//! └── *.json.backup                  # previous versions, when backups are on
//! ```
//!
//! No other component reads or writes these files directly. Within a process
//! the engine lock serializes writers; across processes the last writer wins.

mod store;
mod types;

pub use store::{JsonStateStore, Loaded};
pub use types::{CommandRecord, HookExecution, HookRecord, HookState};

pub const HOOK_STATE_FILE: &str = "hook_execution_state.json";
pub const COMMAND_STATE_FILE: &str = "command_execution_state.json";
pub const PERFORMANCE_METRICS_FILE: &str = "performance_metrics.json";
