//! # hook-state
//!
//! Execution tracking and deduplication for agent lifecycle hooks. Decides
//! whether a hook firing (or a namespaced slash command) is a fresh execution
//! or an echo of one that just ran, and keeps the bookkeeping on disk so that
//! separate short-lived hook processes agree.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime dependency. One background thread per engine for cache expiry.
//! - **Thread-safe**: Engines are shared as `Arc<HookStateEngine>`; mutations serialize on an instance lock.
//! - **Graceful degradation**: Any failure inside tracking lets the hook run. Errors ride along in the result.
//! - **Bounded waits**: Lock acquisition and worker shutdown both have timeouts.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use hook_state::EngineRegistry;
//!
//! let engine = EngineRegistry::global().get("/path/to/project", None)?;
//! let result = engine.track_hook_execution("SessionStart", Some("compact"));
//! if result.executed {
//!     // run the hook
//! }
//! ```

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod state;
pub mod types;
pub mod worker;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::HookConfig;
pub use engine::{EngineBuilder, HookStateEngine, DEFAULT_CLEANUP_TIMEOUT};
pub use error::{FailureKind, HookStateError, Result};
pub use metrics::{MetricsSummary, PerformanceMetrics};
pub use registry::{
    cleanup_all_engines, cleanup_old_states, deduplicate_command, force_cleanup_all_engines,
    get_performance_summary, install_exit_hook, mark_command_complete, track_hook_execution,
    EngineRegistry,
};
pub use state::{CommandRecord, HookExecution, HookRecord, HookState};
pub use types::ExecutionResult;
