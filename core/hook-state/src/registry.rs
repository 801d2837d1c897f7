//! One engine per working directory.
//!
//! The registry is an explicit object so tests and embedders can own their
//! own; [`EngineRegistry::global`] is the shared instance behind the free
//! functions at the bottom of this module.
//!
//! Two teardown routes exist and both are safe to run more than once:
//! [`EngineRegistry::cleanup_all`] over the registry map, and
//! [`force_cleanup_all_engines`] over every engine ever built, registered or
//! not. [`install_exit_hook`] runs both when the process exits.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once, Weak};
use std::time::Duration;

use chrono::Utc;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

use crate::config::HookConfig;
use crate::engine::{HookStateEngine, DEFAULT_CLEANUP_TIMEOUT};
use crate::error::{HookStateError, Result};
use crate::metrics::{MetricsSummary, PerformanceMetrics};
use crate::types::ExecutionResult;
use crate::worker::panic_message;

static GLOBAL_REGISTRY: Lazy<EngineRegistry> = Lazy::new(EngineRegistry::new);
static LIVE_ENGINES: Lazy<LiveEngines> = Lazy::new(LiveEngines::default);
static EXIT_HOOK: Once = Once::new();

pub struct EngineRegistry {
    engines: RwLock<HashMap<PathBuf, Arc<HookStateEngine>>>,
    metrics: Arc<PerformanceMetrics>,
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineRegistry {
    /// A registry whose engines report into the process-wide metrics.
    pub fn new() -> Self {
        Self::with_metrics(PerformanceMetrics::global())
    }

    pub fn with_metrics(metrics: Arc<PerformanceMetrics>) -> Self {
        EngineRegistry {
            engines: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    pub fn global() -> &'static EngineRegistry {
        &GLOBAL_REGISTRY
    }

    pub fn metrics(&self) -> &Arc<PerformanceMetrics> {
        &self.metrics
    }

    /// Returns the engine for `working_dir`, building it on first use.
    ///
    /// `config` only applies when a new engine is built; `None` reads the
    /// environment. A failed build leaves no entry behind.
    pub fn get(
        &self,
        working_dir: impl AsRef<Path>,
        config: Option<HookConfig>,
    ) -> Result<Arc<HookStateEngine>> {
        let key = normalize_key(working_dir.as_ref());

        if let Some(engine) = self.engines.read().get(&key) {
            if !engine.is_stopped() {
                return Ok(Arc::clone(engine));
            }
        }

        let mut engines = self.engines.write();
        if let Some(engine) = engines.get(&key) {
            if !engine.is_stopped() {
                return Ok(Arc::clone(engine));
            }
            tracing::debug!(working_dir = %key.display(), "Replacing stopped engine");
        }

        let engine = HookStateEngine::builder(key.clone())
            .config(config.unwrap_or_else(HookConfig::from_env))
            .metrics(Arc::clone(&self.metrics))
            .build()?;
        engines.insert(key, Arc::clone(&engine));
        Ok(engine)
    }

    pub fn remove(&self, working_dir: impl AsRef<Path>) -> Option<Arc<HookStateEngine>> {
        self.engines.write().remove(&normalize_key(working_dir.as_ref()))
    }

    pub fn contains(&self, working_dir: impl AsRef<Path>) -> bool {
        self.engines
            .read()
            .contains_key(&normalize_key(working_dir.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.engines.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.read().is_empty()
    }

    /// Tears down every registered engine and empties the map. Individual
    /// failures are logged and skipped. Returns how many cleaned up cleanly.
    pub fn cleanup_all(&self, timeout: Duration) -> usize {
        let engines: Vec<_> = self.engines.write().drain().collect();
        let total = engines.len();
        let mut cleaned = 0;

        for (working_dir, engine) in engines {
            match cleanup_engine(&engine, timeout) {
                Ok(()) => cleaned += 1,
                Err(err) => {
                    tracing::warn!(working_dir = %working_dir.display(), error = %err, "Engine cleanup failed");
                }
            }
        }

        if total > 0 {
            tracing::debug!(cleaned, total, "Cleaned up registered engines");
        }
        cleaned
    }
}

/// `/a/b/`, `/a/b//` and `/a/./b` all name the same engine.
fn normalize_key(working_dir: &Path) -> PathBuf {
    working_dir.components().collect()
}

fn cleanup_engine(engine: &HookStateEngine, timeout: Duration) -> Result<()> {
    match panic::catch_unwind(AssertUnwindSafe(|| engine.cleanup(timeout))) {
        Ok(result) => result,
        Err(payload) => Err(HookStateError::Unexpected(panic_message(payload.as_ref()))),
    }
}

/// Weak handles to every engine built in this process.
#[derive(Default)]
struct LiveEngines {
    engines: Mutex<Vec<Weak<HookStateEngine>>>,
}

impl LiveEngines {
    fn track(&self, engine: &Arc<HookStateEngine>) {
        let mut live = self.engines.lock();
        live.retain(|weak| weak.strong_count() > 0);
        live.push(Arc::downgrade(engine));
    }

    fn cleanup_all(&self, timeout: Duration) -> usize {
        let engines: Vec<_> = {
            let mut live = self.engines.lock();
            let engines = live.iter().filter_map(Weak::upgrade).collect();
            live.clear();
            engines
        };

        let mut cleaned = 0;
        for engine in engines {
            match cleanup_engine(&engine, timeout) {
                Ok(()) => cleaned += 1,
                Err(err) => {
                    tracing::warn!(working_dir = %engine.working_dir().display(), error = %err, "Forced engine cleanup failed");
                }
            }
        }
        cleaned
    }
}

pub(crate) fn track_live_engine(engine: &Arc<HookStateEngine>) {
    LIVE_ENGINES.track(engine);
}

/// Cleans every engine still alive in this process, whether or not a
/// registry holds it. Returns how many were cleaned without error.
pub fn force_cleanup_all_engines(timeout: Duration) -> usize {
    LIVE_ENGINES.cleanup_all(timeout)
}

/// Registers teardown of all engines at process exit. Only the first call
/// has an effect.
pub fn install_exit_hook() {
    EXIT_HOOK.call_once(|| {
        // SAFETY: `run_exit_cleanup` is a plain `extern "C" fn()` with no
        // captured state, which is all `atexit` requires.
        let rc = unsafe { libc::atexit(run_exit_cleanup) };
        if rc != 0 {
            tracing::warn!(rc, "Failed to register exit cleanup");
        }
    });
}

extern "C" fn run_exit_cleanup() {
    // Unwinding out of an `extern "C"` function aborts the process.
    let _ = panic::catch_unwind(|| {
        EngineRegistry::global().cleanup_all(DEFAULT_CLEANUP_TIMEOUT);
        force_cleanup_all_engines(DEFAULT_CLEANUP_TIMEOUT);
    });
}

// ─────────────────────────────────────────────────────────────────────────────
// Free functions over the global registry
// ─────────────────────────────────────────────────────────────────────────────

fn unavailable(err: HookStateError) -> ExecutionResult {
    tracing::error!(error = %err, "State engine unavailable, allowing execution");
    PerformanceMetrics::global().record_failure(err.kind());
    ExecutionResult::degraded(
        Utc::now(),
        err.to_string(),
        "State tracking unavailable; continuing execution",
    )
}

pub fn track_hook_execution(
    hook_name: &str,
    working_dir: impl AsRef<Path>,
    phase: Option<&str>,
) -> ExecutionResult {
    match EngineRegistry::global().get(working_dir, None) {
        Ok(engine) => engine.track_hook_execution(hook_name, phase),
        Err(err) => {
            let mut result = unavailable(err);
            result.hook_name = Some(hook_name.to_string());
            result.phase = phase.map(str::to_string);
            result
        }
    }
}

pub fn deduplicate_command(command: &str, working_dir: impl AsRef<Path>) -> ExecutionResult {
    match EngineRegistry::global().get(working_dir, None) {
        Ok(engine) => engine.deduplicate_command(command),
        Err(err) => {
            let mut result = unavailable(err);
            result.command = Some(command.to_string());
            result
        }
    }
}

pub fn mark_command_complete(command: Option<&str>, working_dir: impl AsRef<Path>) -> Result<()> {
    EngineRegistry::global()
        .get(working_dir, None)?
        .mark_command_complete(command)
}

pub fn cleanup_old_states(working_dir: impl AsRef<Path>, max_age_hours: Option<u64>) -> Result<()> {
    EngineRegistry::global()
        .get(working_dir, None)?
        .cleanup_old_states(max_age_hours)
}

pub fn get_performance_summary() -> MetricsSummary {
    EngineRegistry::global().metrics().summary()
}

pub fn cleanup_all_engines() -> usize {
    EngineRegistry::global().cleanup_all(DEFAULT_CLEANUP_TIMEOUT)
}
