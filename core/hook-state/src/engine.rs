//! The deduplication engine bound to one working directory.
//!
//! Every state-mutating operation runs under a single reentrant instance lock
//! acquired with a bounded wait. When the lock can't be had in time, or the
//! tracking logic faults, the caller is told to proceed: bookkeeping degrades,
//! the hook still runs.
//!
//! # Decision Rules
//!
//! ```text
//! track_hook_execution(name, phase)
//!   name == session-start hook && phase given:
//!       duplicate ⇔ phase == last_phase && elapsed < hook window
//!   otherwise:
//!       duplicate ⇔ elapsed < hook window
//!
//! deduplicate_command(cmd)
//!   cmd empty or outside the namespace  → never a duplicate, no write
//!   duplicate ⇔ cmd == last_command && elapsed < command window
//!   duplicates are flagged, not blocked (executed stays true)
//! ```

use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fs_err as fs;
use parking_lot::{Mutex, ReentrantMutex};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::clock::{to_epoch, SharedClock, SystemClock};
use crate::config::HookConfig;
use crate::error::{HookStateError, Result};
use crate::metrics::{MetricsSummary, PerformanceMetrics};
use crate::registry;
use crate::state::{
    CommandRecord, HookExecution, HookState, JsonStateStore, COMMAND_STATE_FILE, HOOK_STATE_FILE,
    PERFORMANCE_METRICS_FILE,
};
use crate::types::ExecutionResult;
use crate::worker::{panic_message, CacheSweeper};

/// Default bound on waiting for the background worker during teardown.
pub const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);
/// Teardown bound used when an engine is dropped without an explicit stop.
const DROP_CLEANUP_TIMEOUT: Duration = Duration::from_secs(1);

const NON_NAMESPACED_REASON: &str = "non-namespaced command";

/// State shared between the engine and its background worker.
struct EngineInner {
    working_dir: PathBuf,
    state_dir: PathBuf,
    config: HookConfig,
    lock: ReentrantMutex<()>,
    hooks: JsonStateStore<HookState>,
    commands: JsonStateStore<CommandRecord>,
    clock: SharedClock,
    metrics: Arc<PerformanceMetrics>,
}

pub struct HookStateEngine {
    inner: Arc<EngineInner>,
    worker: Mutex<Option<CacheSweeper>>,
    cleaned_up: AtomicBool,
}

pub struct EngineBuilder {
    working_dir: PathBuf,
    config: Option<HookConfig>,
    clock: Option<SharedClock>,
    metrics: Option<Arc<PerformanceMetrics>>,
}

impl EngineBuilder {
    pub fn config(mut self, config: HookConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn metrics(mut self, metrics: Arc<PerformanceMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Resolves the state directory, opens both stores and starts the
    /// background worker when caching and a sweep interval are configured.
    pub fn build(self) -> Result<Arc<HookStateEngine>> {
        let config = self.config.unwrap_or_else(HookConfig::from_env);
        config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let metrics = self.metrics.unwrap_or_else(PerformanceMetrics::global);
        let state_dir = config.resolve_state_dir(&self.working_dir)?;
        tracing::debug!(state_dir = %state_dir.display(), "Using state directory");

        let hooks = JsonStateStore::new(
            "hook",
            state_dir.join(HOOK_STATE_FILE),
            &config,
            Arc::clone(&clock),
            Arc::clone(&metrics),
        );
        let commands = JsonStateStore::new(
            "command",
            state_dir.join(COMMAND_STATE_FILE),
            &config,
            Arc::clone(&clock),
            Arc::clone(&metrics),
        );

        let inner = Arc::new(EngineInner {
            working_dir: self.working_dir,
            state_dir,
            config,
            lock: ReentrantMutex::new(()),
            hooks,
            commands,
            clock,
            metrics,
        });

        let worker = if inner.config.worker_enabled() {
            let sweep_target = Arc::clone(&inner);
            Some(CacheSweeper::spawn(
                "hook-state-cache-sweeper",
                inner.config.cache_cleanup_interval(),
                move || sweep_target.sweep_expired_cache(),
            )?)
        } else {
            None
        };

        let engine = Arc::new(HookStateEngine {
            inner,
            worker: Mutex::new(worker),
            cleaned_up: AtomicBool::new(false),
        });
        registry::track_live_engine(&engine);
        Ok(engine)
    }
}

impl HookStateEngine {
    pub fn builder(working_dir: impl Into<PathBuf>) -> EngineBuilder {
        EngineBuilder {
            working_dir: working_dir.into(),
            config: None,
            clock: None,
            metrics: None,
        }
    }

    pub fn new(working_dir: impl Into<PathBuf>, config: HookConfig) -> Result<Arc<Self>> {
        Self::builder(working_dir).config(config).build()
    }

    pub fn working_dir(&self) -> &Path {
        &self.inner.working_dir
    }

    pub fn state_dir(&self) -> &Path {
        &self.inner.state_dir
    }

    pub fn config(&self) -> &HookConfig {
        &self.inner.config
    }

    pub fn hook_state_path(&self) -> &Path {
        self.inner.hooks.path()
    }

    pub fn command_state_path(&self) -> &Path {
        self.inner.commands.path()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Tracking
    // ─────────────────────────────────────────────────────────────────────

    /// Decides whether this hook invocation runs or is a duplicate, and
    /// records it when it runs.
    pub fn track_hook_execution(&self, hook_name: &str, phase: Option<&str>) -> ExecutionResult {
        let inner = &self.inner;
        let started = Instant::now();
        let started_at = inner.clock.now();

        let Some(_guard) = inner.lock.try_lock_for(inner.config.lock_timeout()) else {
            let mut result = inner.lock_timeout_result("hook tracking", started_at, started);
            result.hook_name = Some(hook_name.to_string());
            result.phase = phase.map(str::to_string);
            return result;
        };

        let outcome = guarded(|| inner.track_hook_locked(hook_name, phase));
        let mut result = match outcome {
            Ok(result) => result,
            Err(err) => {
                let mut result = inner.failure_result(
                    "hook tracking",
                    err,
                    started_at,
                    "Execution tracking failed but continuing execution",
                );
                result.hook_name = Some(hook_name.to_string());
                result.phase = phase.map(str::to_string);
                result
            }
        };

        result.execution_time_ms = elapsed_ms(started);
        inner
            .metrics
            .record_execution(result.execution_time_ms, result.error.is_none(), result.duplicate);
        if inner.config.log_state_changes {
            tracing::info!(
                hook = %hook_name,
                phase = ?phase,
                executed = result.executed,
                duplicate = result.duplicate,
                "Hook execution tracked"
            );
        }
        result
    }

    /// Flags repeated namespaced commands inside the command window.
    pub fn deduplicate_command(&self, command: &str) -> ExecutionResult {
        let inner = &self.inner;
        let started = Instant::now();
        let started_at = inner.clock.now();

        let Some(_guard) = inner.lock.try_lock_for(inner.config.lock_timeout()) else {
            let mut result = inner.lock_timeout_result("command deduplication", started_at, started);
            result.command = Some(command.to_string());
            return result;
        };

        let mut result = match guarded(|| inner.deduplicate_command_locked(command)) {
            Ok(result) => result,
            Err(err) => {
                let mut result = inner.failure_result(
                    "command deduplication",
                    err,
                    started_at,
                    "Command deduplication failed but continuing execution",
                );
                result.command = Some(command.to_string());
                result
            }
        };

        result.execution_time_ms = elapsed_ms(started);
        inner
            .metrics
            .record_execution(result.execution_time_ms, result.error.is_none(), result.duplicate);
        if inner.config.log_state_changes {
            tracing::info!(
                command = %command,
                reason = ?result.reason,
                duplicate = result.duplicate,
                "Command deduplication"
            );
        }
        result
    }

    /// Clears the running flag. Failures are logged and counted before
    /// being returned; callers are free to ignore them.
    pub fn mark_command_complete(&self, command: Option<&str>) -> Result<()> {
        let inner = &self.inner;
        let _guard = inner.acquire("command completion")?;

        let result = guarded(|| {
            let mut state = inner.commands.load().value;
            state.is_running = false;
            state.last_timestamp = Some(inner.clock.now_epoch());
            if let Some(command) = command.filter(|c| !c.is_empty()) {
                state.last_command = Some(command.to_string());
            }
            inner.persist(&inner.commands, &state)
        });

        match &result {
            Ok(()) if inner.config.log_state_changes => {
                tracing::info!(command = command.unwrap_or("unknown"), "Command marked as complete");
            }
            Ok(()) => {}
            Err(err) => {
                tracing::error!(error = %err, "Failed to mark command as complete");
            }
        }
        result
    }

    /// Drops history and records older than `max_age_hours` (the configured
    /// maximum when `None`). `Some(0)` keeps only what happened at this very
    /// instant. No-op when persistence is disabled.
    pub fn cleanup_old_states(&self, max_age_hours: Option<u64>) -> Result<()> {
        let inner = &self.inner;
        if !inner.config.enable_state_persistence {
            return Ok(());
        }

        let _guard = inner.acquire("state cleanup")?;
        let max_age_hours = max_age_hours.unwrap_or(inner.config.max_state_file_age_hours);
        let result = guarded(|| inner.cleanup_old_states_locked(max_age_hours as f64 * 3600.0));
        if let Err(err) = &result {
            tracing::error!(error = %err, "Failed to clean up old states");
        }
        result
    }

    // ─────────────────────────────────────────────────────────────────────
    // Read-only accessors (no instance lock; may be up to one TTL stale, and
    // never write the cache the locked paths rely on)
    // ─────────────────────────────────────────────────────────────────────

    pub fn get_hook_execution_count(&self, hook_name: &str) -> u64 {
        self.inner.hooks.peek().value.count_for(hook_name)
    }

    pub fn get_command_execution_count(&self) -> u64 {
        self.inner.commands.peek().value.execution_count
    }

    pub fn get_performance_summary(&self) -> MetricsSummary {
        self.inner.metrics.summary()
    }

    pub fn reset_performance_metrics(&self) {
        self.inner.metrics.reset();
        if self.inner.config.log_state_changes {
            tracing::info!("Performance metrics reset");
        }
    }

    /// Writes the current metrics snapshot next to the state files.
    pub fn save_performance_summary(&self) -> Result<PathBuf> {
        let path = self.inner.state_dir.join(PERFORMANCE_METRICS_FILE);
        fs::create_dir_all(&self.inner.state_dir)
            .map_err(|e| HookStateError::io("create state directory", e))?;
        let content = serde_json::to_string_pretty(&self.get_performance_summary())
            .map_err(|e| HookStateError::json("serialize performance summary", e))?;
        fs::write(&path, content).map_err(|e| {
            self.inner.metrics.record_io_error();
            HookStateError::io("write performance summary", e)
        })?;
        Ok(path)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Stops the background worker and clears the caches. Idempotent: only
    /// the first call does any work.
    pub fn cleanup(&self, timeout: Duration) -> Result<()> {
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let result = match self.worker.lock().take() {
            Some(worker) => worker.shutdown(timeout),
            None => Ok(()),
        };

        self.inner.hooks.clear_cache();
        self.inner.commands.clear_cache();

        if self.inner.config.log_state_changes {
            tracing::debug!(working_dir = %self.inner.working_dir.display(), "Engine cleanup completed");
        }
        result
    }

    pub fn stop(&self) -> Result<()> {
        self.cleanup(DEFAULT_CLEANUP_TIMEOUT)
    }

    pub fn is_stopped(&self) -> bool {
        self.cleaned_up.load(Ordering::SeqCst)
    }

    pub fn has_worker(&self) -> bool {
        self.worker.lock().is_some()
    }

    #[cfg(test)]
    fn hold_lock_in_background(self: &Arc<Self>, hold: Duration) -> std::thread::JoinHandle<()> {
        let engine = Arc::clone(self);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let handle = std::thread::spawn(move || {
            let _guard = engine.inner.lock.lock();
            let _ = ready_tx.send(());
            std::thread::sleep(hold);
        });
        let _ = ready_rx.recv();
        handle
    }
}

impl Drop for HookStateEngine {
    fn drop(&mut self) {
        if !self.is_stopped() {
            if let Err(err) = self.cleanup(DROP_CLEANUP_TIMEOUT) {
                tracing::debug!(error = %err, "Cleanup during drop did not complete");
            }
        }
    }
}

impl EngineInner {
    fn acquire(&self, operation: &'static str) -> Result<parking_lot::ReentrantMutexGuard<'_, ()>> {
        let timeout = self.config.lock_timeout();
        self.lock.try_lock_for(timeout).ok_or_else(|| {
            tracing::warn!(operation, "Failed to acquire state lock");
            self.metrics.record_concurrent_access_error();
            HookStateError::LockTimeout { operation, timeout }
        })
    }

    fn track_hook_locked(&self, hook_name: &str, phase: Option<&str>) -> Result<ExecutionResult> {
        if hook_name.trim().is_empty() {
            return Err(HookStateError::InvalidInput {
                field: "hook_name",
                reason: "must not be empty".to_string(),
            });
        }

        let loaded = self.hooks.load();
        let mut state = loaded.value;
        let now_at = self.clock.now();
        let now = to_epoch(now_at);
        let window = self.config.hook_dedupe_window_secs;
        let is_session_start = hook_name == self.config.session_start_hook && phase.is_some();

        let record = state.entry(hook_name);
        let first_run = record.count == 0;
        let within_window = record.seconds_since_last(now) < window;
        let same_phase = record.last_phase.as_deref() == phase;

        let (duplicate, reason) = if is_session_start {
            if same_phase && within_window {
                (true, format!("same phase within {window}s window"))
            } else if !same_phase && !first_run {
                (false, "phase changed".to_string())
            } else {
                (false, execution_reason(first_run))
            }
        } else if within_window {
            (true, format!("within {window}s deduplication window"))
        } else {
            (false, execution_reason(first_run))
        };

        let mut result = ExecutionResult::allowed(now_at);
        result.executed = !duplicate;
        result.duplicate = duplicate;
        result.hook_name = Some(hook_name.to_string());
        result.phase = phase.map(str::to_string);
        result.reason = Some(reason);
        result.cache_hit = loaded.cache_hit;
        result.state_operations_count = 1;

        if !duplicate {
            record.count += 1;
            record.last_execution = now;
            record.last_phase = phase.map(str::to_string);
            record.executions.push(HookExecution {
                timestamp: now,
                phase: phase.map(str::to_string),
                execution_id: result.execution_id.clone(),
            });
            record.prune_history(
                now - self.config.max_state_age_secs(),
                self.config.max_history_entries,
            );
            result.execution_count = record.count;

            result.state_operations_count = 2;
            if self.persist(&self.hooks, &state).is_err() {
                result.warning = Some("Failed to save state but continuing execution".to_string());
            }
        } else {
            result.execution_count = record.count;
        }

        Ok(result)
    }

    fn deduplicate_command_locked(&self, command: &str) -> Result<ExecutionResult> {
        let loaded = self.commands.load();
        let mut state = loaded.value;
        let now_at = self.clock.now();
        let now = to_epoch(now_at);

        let mut result = ExecutionResult::allowed(now_at);
        result.command = Some(command.to_string());
        result.cache_hit = loaded.cache_hit;
        result.state_operations_count = 1;

        if command.is_empty() || !command.starts_with(&self.config.command_namespace) {
            result.reason = Some(NON_NAMESPACED_REASON.to_string());
            result.execution_count = state.execution_count;
            result.duplicate_count = state.duplicate_count;
            return Ok(result);
        }

        let window = self.config.command_dedupe_window_secs;
        let duplicate = state.is_repeat_within(command, now, window);
        if duplicate {
            state.duplicate_count += 1;
            state.is_running = true;
            state.duplicate_timestamp = Some(now);
            result.duplicate = true;
            result.reason = Some(format!("within {window}s deduplication window"));
        } else {
            state.last_command = Some(command.to_string());
            state.last_timestamp = Some(now);
            state.is_running = true;
            state.execution_count += 1;
            result.reason = Some("normal execution".to_string());
        }
        result.execution_count = state.execution_count;
        result.duplicate_count = state.duplicate_count;

        result.state_operations_count = 2;
        if self.persist(&self.commands, &state).is_err() {
            result.warning = Some(if duplicate {
                "Failed to save duplicate state".to_string()
            } else {
                "Failed to save command state".to_string()
            });
        }
        Ok(result)
    }

    fn cleanup_old_states_locked(&self, max_age_secs: f64) -> Result<()> {
        let now = self.clock.now_epoch();
        let cutoff = now - max_age_secs;

        let mut hooks = self.hooks.load().value;
        let mut pruned_entries = 0;
        for record in hooks.hooks.values_mut() {
            pruned_entries += record.prune_history(cutoff, self.config.max_history_entries);
        }
        let before = hooks.hooks.len();
        hooks.hooks.retain(|name, record| {
            let keep = record.last_execution >= cutoff;
            if !keep && self.config.log_state_changes {
                tracing::debug!(hook = %name, "Removed old hook state");
            }
            keep
        });
        let removed_hooks = before - hooks.hooks.len();
        let hooks_saved = self.persist(&self.hooks, &hooks);

        let mut commands = self.commands.load().value;
        let command_reset = commands.last_timestamp.unwrap_or(0.0) < cutoff;
        if command_reset {
            commands = CommandRecord::default();
        }
        let commands_saved = self.persist(&self.commands, &commands);

        if self.config.log_state_changes {
            tracing::debug!(
                removed_hooks,
                pruned_entries,
                command_reset,
                "Cleaned up old state entries"
            );
        }
        hooks_saved.and(commands_saved)
    }

    /// Saves through the store, counting real failures. Disabled persistence
    /// is not a failure.
    fn persist<T>(&self, store: &JsonStateStore<T>, value: &T) -> Result<()>
    where
        T: Serialize + DeserializeOwned + Default + Clone,
    {
        match store.try_save(value) {
            Ok(()) | Err(HookStateError::PersistenceDisabled) => Ok(()),
            Err(err) => {
                tracing::error!(path = %store.path().display(), error = %err, "Failed to save state");
                self.metrics.record_failure(err.kind());
                Err(err)
            }
        }
    }

    fn sweep_expired_cache(&self) {
        let Some(_guard) = self.lock.try_lock_for(self.config.lock_timeout()) else {
            tracing::debug!("Skipping cache sweep, state lock busy");
            return;
        };
        let now = self.clock.now_epoch();
        let hooks = self.hooks.evict_expired(now);
        let commands = self.commands.evict_expired(now);
        if (hooks || commands) && self.config.log_state_changes {
            tracing::debug!(hooks, commands, "Cleaned expired state cache");
        }
    }

    fn lock_timeout_result(
        &self,
        operation: &'static str,
        started_at: DateTime<Utc>,
        started: Instant,
    ) -> ExecutionResult {
        let err = HookStateError::LockTimeout {
            operation,
            timeout: self.config.lock_timeout(),
        };
        tracing::warn!(operation, "Failed to acquire state lock, allowing execution");
        self.metrics.record_concurrent_access_error();

        let mut result = ExecutionResult::degraded(
            started_at,
            err.to_string(),
            "Deduplication skipped; continuing execution",
        );
        result.execution_time_ms = elapsed_ms(started);
        self.metrics
            .record_execution(result.execution_time_ms, false, false);
        result
    }

    fn failure_result(
        &self,
        operation: &'static str,
        err: HookStateError,
        started_at: DateTime<Utc>,
        warning: &str,
    ) -> ExecutionResult {
        tracing::error!(operation, error = %err, "State tracking failed, allowing execution");
        self.metrics.record_other_error();
        ExecutionResult::degraded(started_at, err.to_string(), warning)
    }
}

/// Runs `f`, turning a panic into [`HookStateError::Unexpected`].
fn guarded<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(HookStateError::Unexpected(panic_message(payload.as_ref()))),
    }
}

fn execution_reason(first_run: bool) -> String {
    if first_run {
        "first execution".to_string()
    } else {
        "outside deduplication window".to_string()
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        temp: TempDir,
        clock: Arc<ManualClock>,
        metrics: Arc<PerformanceMetrics>,
        engine: Arc<HookStateEngine>,
    }

    fn test_config() -> HookConfig {
        HookConfig {
            hook_dedupe_window_secs: 5.0,
            command_dedupe_window_secs: 3.0,
            cache_cleanup_interval_secs: 0.0,
            lock_timeout_secs: 0.2,
            ..HookConfig::default()
        }
    }

    fn fixture_with(config: HookConfig) -> Fixture {
        let temp = tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let metrics = PerformanceMetrics::new();
        let engine = HookStateEngine::builder(temp.path())
            .config(config)
            .clock(clock.clone())
            .metrics(metrics.clone())
            .build()
            .unwrap();
        Fixture {
            temp,
            clock,
            metrics,
            engine,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(test_config())
    }

    #[test]
    fn test_session_start_same_phase_scenario() {
        let f = fixture();

        let first = f.engine.track_hook_execution("SessionStart", Some("compact"));
        assert!(first.executed && !first.duplicate);
        assert_eq!(first.execution_count, 1);

        f.clock.advance_secs(2.0);
        let second = f.engine.track_hook_execution("SessionStart", Some("compact"));
        assert!(second.duplicate && !second.executed);
        assert_eq!(second.execution_count, 1);
        assert_eq!(f.engine.get_hook_execution_count("SessionStart"), 1);

        f.clock.advance_secs(4.0);
        let third = f.engine.track_hook_execution("SessionStart", Some("compact"));
        assert!(third.executed && !third.duplicate);
        assert_eq!(third.execution_count, 2);
    }

    #[test]
    fn test_session_start_phase_change_is_never_duplicate() {
        let f = fixture();
        f.engine.track_hook_execution("SessionStart", Some("clear"));

        let next = f.engine.track_hook_execution("SessionStart", Some("compact"));
        assert!(next.executed && !next.duplicate);
        assert_eq!(next.reason.as_deref(), Some("phase changed"));
        assert_eq!(next.execution_count, 2);

        let back = f.engine.track_hook_execution("SessionStart", Some("clear"));
        assert!(!back.duplicate);
    }

    #[test]
    fn test_other_hooks_ignore_phase() {
        let f = fixture();
        f.engine.track_hook_execution("PostToolUse", Some("a"));
        let next = f.engine.track_hook_execution("PostToolUse", Some("b"));
        assert!(next.duplicate);
        assert_eq!(next.state_operations_count, 1);
    }

    #[test]
    fn test_session_start_without_phase_uses_plain_window() {
        let f = fixture();
        f.engine.track_hook_execution("SessionStart", None);
        assert!(f.engine.track_hook_execution("SessionStart", None).duplicate);
    }

    #[test]
    fn test_hooks_are_tracked_independently() {
        let f = fixture();
        assert!(!f.engine.track_hook_execution("PreToolUse", None).duplicate);
        assert!(!f.engine.track_hook_execution("PostToolUse", None).duplicate);
    }

    #[test]
    fn test_executed_hook_is_persisted_with_history() {
        let f = fixture();
        let result = f.engine.track_hook_execution("SessionStart", Some("clear"));

        let raw = fs::read_to_string(f.engine.hook_state_path()).unwrap();
        let state: HookState = serde_json::from_str(&raw).unwrap();
        let record = state.get("SessionStart").unwrap();
        assert_eq!(record.count, 1);
        assert_eq!(record.last_phase.as_deref(), Some("clear"));
        assert_eq!(record.executions.len(), 1);
        assert_eq!(record.executions[0].execution_id, result.execution_id);
    }

    #[test]
    fn test_duplicate_hook_does_not_write() {
        let f = fixture();
        f.engine.track_hook_execution("Stop", None);
        let writes = f.metrics.summary().state_writes;

        f.clock.advance_secs(1.0);
        f.engine.track_hook_execution("Stop", None);
        assert_eq!(f.metrics.summary().state_writes, writes);
    }

    #[test]
    fn test_history_is_pruned_by_age() {
        let f = fixture_with(HookConfig {
            max_state_file_age_hours: 1,
            ..test_config()
        });
        f.engine.track_hook_execution("Stop", None);
        f.clock.advance_secs(2.0 * 3600.0);
        f.engine.track_hook_execution("Stop", None);

        let state: HookState =
            serde_json::from_str(&fs::read_to_string(f.engine.hook_state_path()).unwrap()).unwrap();
        let record = state.get("Stop").unwrap();
        assert_eq!(record.count, 2);
        assert_eq!(record.executions.len(), 1);
    }

    #[test]
    fn test_empty_hook_name_degrades_to_allowed() {
        let f = fixture();
        let result = f.engine.track_hook_execution("  ", None);
        assert!(result.executed && !result.duplicate);
        assert!(result.error.is_some());
        assert_eq!(f.metrics.summary().other_errors, 1);
    }

    #[test]
    fn test_command_scenario() {
        let f = fixture();

        let first = f.engine.deduplicate_command("/alfred:2-run");
        assert!(first.executed && !first.duplicate);
        assert_eq!(first.execution_count, 1);

        f.clock.advance_secs(1.0);
        let second = f.engine.deduplicate_command("/alfred:2-run");
        assert!(second.executed && second.duplicate);
        assert_eq!(second.duplicate_count, 1);

        f.clock.advance_secs(4.0);
        let third = f.engine.deduplicate_command("/alfred:2-run");
        assert!(third.executed && !third.duplicate);
        assert_eq!(third.execution_count, 2);
        assert_eq!(f.engine.get_command_execution_count(), 2);
    }

    #[test]
    fn test_duplicate_command_records_timestamp_and_running() {
        let f = fixture();
        f.engine.deduplicate_command("/alfred:1-plan");
        f.engine.deduplicate_command("/alfred:1-plan");

        let state: CommandRecord = serde_json::from_str(
            &fs::read_to_string(f.engine.command_state_path()).unwrap(),
        )
        .unwrap();
        assert!(state.is_running);
        assert_eq!(state.duplicate_count, 1);
        let flagged_at = state.duplicate_timestamp.unwrap();
        assert!((flagged_at - f.clock.now_epoch()).abs() < 1e-3);
    }

    #[test]
    fn test_different_command_is_not_duplicate() {
        let f = fixture();
        f.engine.deduplicate_command("/alfred:1-plan");
        assert!(!f.engine.deduplicate_command("/alfred:2-run").duplicate);
    }

    #[test]
    fn test_non_namespaced_commands_never_write() {
        let f = fixture();
        for command in ["", "ls -la", "/other:thing", "alfred:2-run"] {
            let result = f.engine.deduplicate_command(command);
            assert!(result.executed && !result.duplicate, "{command}");
            assert_eq!(result.reason.as_deref(), Some(NON_NAMESPACED_REASON));
            assert_eq!(result.state_operations_count, 1);
        }
        assert_eq!(f.metrics.summary().state_writes, 0);
        assert!(!f.engine.command_state_path().exists());
    }

    #[test]
    fn test_mark_command_complete_clears_running() {
        let f = fixture();
        f.engine.deduplicate_command("/alfred:3-sync");
        f.clock.advance_secs(1.0);
        f.engine.mark_command_complete(Some("/alfred:3-sync")).unwrap();

        let state: CommandRecord = serde_json::from_str(
            &fs::read_to_string(f.engine.command_state_path()).unwrap(),
        )
        .unwrap();
        assert!(!state.is_running);
        let completed_at = state.last_timestamp.unwrap();
        assert!((completed_at - f.clock.now_epoch()).abs() < 1e-3);
        assert_eq!(state.last_command.as_deref(), Some("/alfred:3-sync"));
    }

    #[test]
    fn test_cleanup_with_zero_age_removes_everything_not_now() {
        let f = fixture();
        f.engine.track_hook_execution("Stop", None);
        f.engine.deduplicate_command("/alfred:2-run");
        f.clock.advance_secs(1.0);
        f.engine.track_hook_execution("SessionStart", Some("clear"));

        f.engine.cleanup_old_states(Some(0)).unwrap();

        assert_eq!(f.engine.get_hook_execution_count("Stop"), 0);
        assert_eq!(f.engine.get_hook_execution_count("SessionStart"), 1);
        assert_eq!(f.engine.get_command_execution_count(), 0);

        let state: HookState =
            serde_json::from_str(&fs::read_to_string(f.engine.hook_state_path()).unwrap()).unwrap();
        assert!(state.get("Stop").is_none());
    }

    #[test]
    fn test_cleanup_with_default_age_keeps_recent_state() {
        let f = fixture();
        f.engine.track_hook_execution("Stop", None);
        f.engine.deduplicate_command("/alfred:2-run");
        f.engine.cleanup_old_states(None).unwrap();

        assert_eq!(f.engine.get_hook_execution_count("Stop"), 1);
        assert_eq!(f.engine.get_command_execution_count(), 1);
    }

    #[test]
    fn test_cleanup_is_noop_without_persistence() {
        let f = fixture_with(HookConfig {
            enable_state_persistence: false,
            ..test_config()
        });
        f.engine.track_hook_execution("Stop", None);
        f.clock.advance_secs(1.0);
        f.engine.cleanup_old_states(Some(0)).unwrap();
        assert_eq!(f.engine.get_hook_execution_count("Stop"), 1);
    }

    #[test]
    fn test_dedup_works_in_memory_without_persistence() {
        let f = fixture_with(HookConfig {
            enable_state_persistence: false,
            ..test_config()
        });
        f.engine.track_hook_execution("Stop", None);
        let second = f.engine.track_hook_execution("Stop", None);
        assert!(second.duplicate);
        assert!(second.warning.is_none());
        assert!(!f.engine.hook_state_path().exists());
    }

    #[test]
    fn test_lock_timeout_still_allows_execution() {
        let f = fixture();
        let holder = f.engine.hold_lock_in_background(Duration::from_secs(2));

        let started = Instant::now();
        let result = f.engine.track_hook_execution("SessionStart", Some("clear"));
        assert!(started.elapsed() < Duration::from_millis(1500));
        assert!(result.executed && !result.duplicate);
        assert!(result.error.as_deref().unwrap().contains("hook tracking"));

        let command = f.engine.deduplicate_command("/alfred:2-run");
        assert!(command.executed && !command.duplicate);
        assert!(command.error.is_some());

        assert!(matches!(
            f.engine.mark_command_complete(None),
            Err(HookStateError::LockTimeout { .. })
        ));
        assert_eq!(f.metrics.summary().concurrent_access_errors, 3);
        holder.join().unwrap();
    }

    #[test]
    fn test_lock_is_reentrant_on_the_same_thread() {
        let f = fixture();
        let _outer = f.engine.inner.lock.lock();
        let result = f.engine.track_hook_execution("Stop", None);
        assert!(result.error.is_none());
    }

    #[test]
    fn test_save_failure_becomes_a_warning() {
        let f = fixture();
        f.engine.track_hook_execution("Stop", None);
        // Replace the state dir with a file so the next save can't create its temp file.
        fs::remove_dir_all(f.engine.state_dir()).unwrap();
        fs::write(f.engine.state_dir(), "blocked").unwrap();

        f.clock.advance_secs(10.0);
        let result = f.engine.track_hook_execution("Stop", None);
        assert!(result.executed);
        assert!(result.warning.is_some());
        assert!(f.metrics.summary().io_errors >= 1);
    }

    #[test]
    fn test_cache_hit_reported_on_warm_cache() {
        let f = fixture();
        let cold = f.engine.track_hook_execution("Stop", None);
        assert!(!cold.cache_hit);
        let warm = f.engine.track_hook_execution("PreToolUse", None);
        assert!(warm.cache_hit);
    }

    #[test]
    fn test_cleanup_is_idempotent_and_clears_caches() {
        let f = fixture_with(HookConfig {
            cache_cleanup_interval_secs: 60.0,
            ..test_config()
        });
        assert!(f.engine.has_worker());
        f.engine.track_hook_execution("Stop", None);

        f.engine.cleanup(Duration::from_secs(5)).unwrap();
        assert!(f.engine.is_stopped());
        assert!(!f.engine.has_worker());
        assert!(!f.engine.inner.hooks.is_cached());
        f.engine.cleanup(Duration::from_secs(5)).unwrap();

        // Tracking still works after teardown, straight from disk.
        assert_eq!(f.engine.get_hook_execution_count("Stop"), 1);
    }

    #[test]
    fn test_worker_evicts_expired_cache() {
        let f = fixture_with(HookConfig {
            cache_cleanup_interval_secs: 0.01,
            ..test_config()
        });
        f.engine.track_hook_execution("Stop", None);
        assert!(f.engine.inner.hooks.is_cached());

        f.clock.advance_secs(60.0);
        let deadline = Instant::now() + Duration::from_secs(5);
        while f.engine.inner.hooks.is_cached() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!f.engine.inner.hooks.is_cached());
        f.engine.stop().unwrap();
    }

    #[test]
    fn test_accessors_leave_the_cache_untouched() {
        let f = fixture();
        f.engine.track_hook_execution("Stop", None);
        f.engine.deduplicate_command("/alfred:2-run");
        f.engine.inner.hooks.clear_cache();
        f.engine.inner.commands.clear_cache();

        assert_eq!(f.engine.get_hook_execution_count("Stop"), 1);
        assert_eq!(f.engine.get_command_execution_count(), 1);
        assert!(!f.engine.inner.hooks.is_cached());
        assert!(!f.engine.inner.commands.is_cached());
    }

    #[test]
    fn test_performance_summary_is_written_to_state_dir() {
        let f = fixture();
        f.engine.track_hook_execution("Stop", None);
        let path = f.engine.save_performance_summary().unwrap();
        assert_eq!(path, f.temp.path().join(".moai/state/performance_metrics.json"));

        let summary: MetricsSummary =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(summary.executions_total, 1);
    }

    #[test]
    fn test_reset_performance_metrics_zeroes_counters() {
        let f = fixture();
        f.engine.track_hook_execution("Stop", None);
        f.engine.reset_performance_metrics();
        assert_eq!(f.engine.get_performance_summary().executions_total, 0);
    }

    #[test]
    fn test_invalid_config_fails_construction() {
        let temp = tempdir().unwrap();
        let result = HookStateEngine::new(
            temp.path(),
            HookConfig {
                lock_timeout_secs: f64::NAN,
                ..HookConfig::default()
            },
        );
        assert!(matches!(result, Err(HookStateError::ConfigInvalid { .. })));
    }

    #[test]
    fn test_oversized_durations_are_rejected_at_build() {
        let temp = tempdir().unwrap();
        for config in [
            HookConfig {
                lock_timeout_secs: 1e20,
                ..test_config()
            },
            HookConfig {
                cache_cleanup_interval_secs: 1e20,
                ..test_config()
            },
        ] {
            let built = panic::catch_unwind(AssertUnwindSafe(|| HookStateEngine::new(temp.path(), config)));
            let result = built.expect("building must not panic");
            assert!(matches!(result, Err(HookStateError::ConfigInvalid { .. })));
        }
    }

    #[test]
    fn test_max_lock_timeout_tracks_without_panicking() {
        let f = fixture_with(HookConfig {
            lock_timeout_secs: crate::config::MAX_DURATION_SECS,
            ..test_config()
        });
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            f.engine.track_hook_execution("Stop", None)
        }))
        .expect("tracking must not panic");
        assert!(result.executed && result.error.is_none());
    }
}
