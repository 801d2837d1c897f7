//! Engine configuration: defaults, environment overrides, JSON file loading
//! and state directory resolution.
//!
//! A [`HookConfig`] is resolved once when an engine is constructed and never
//! mutated afterwards.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs_err as fs;
use serde::{Deserialize, Serialize};

use crate::error::{HookStateError, Result};

const ENV_PREFIX: &str = "HOOK_STATE_";
const STATE_SUBDIR: &str = ".moai/state";
const FALLBACK_SUBDIR: &str = "hook-state";
const MAX_INDENT: usize = 16;
/// Upper bound for every duration setting: one day.
pub const MAX_DURATION_SECS: f64 = 86_400.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookConfig {
    /// Minimum seconds between two executions of the same hook.
    pub hook_dedupe_window_secs: f64,
    /// Minimum seconds between two identical namespaced commands.
    pub command_dedupe_window_secs: f64,
    pub state_cache_ttl_secs: f64,
    pub lock_timeout_secs: f64,
    /// Interval of the background cache sweep. Zero disables the worker.
    pub cache_cleanup_interval_secs: f64,
    pub enable_caching: bool,
    pub enable_state_persistence: bool,
    pub backup_on_write: bool,
    pub max_state_file_age_hours: u64,
    pub max_history_entries: usize,
    pub state_file_encoding: String,
    /// Spaces per indent level in state files. Zero writes compact JSON.
    pub state_file_indent: usize,
    pub enable_verbose_logging: bool,
    pub debug_mode: bool,
    pub log_state_changes: bool,
    /// The hook whose phases are tracked independently.
    pub session_start_hook: String,
    /// Only commands starting with this prefix are deduplicated.
    pub command_namespace: String,
    /// Explicit state directory. When unset it is derived from the working dir.
    pub state_dir: Option<PathBuf>,
}

impl Default for HookConfig {
    fn default() -> Self {
        HookConfig {
            hook_dedupe_window_secs: 5.0,
            command_dedupe_window_secs: 3.0,
            state_cache_ttl_secs: 5.0,
            lock_timeout_secs: 5.0,
            cache_cleanup_interval_secs: 300.0,
            enable_caching: true,
            enable_state_persistence: true,
            backup_on_write: false,
            max_state_file_age_hours: 24,
            max_history_entries: 100,
            state_file_encoding: "utf-8".to_string(),
            state_file_indent: 2,
            enable_verbose_logging: false,
            debug_mode: false,
            log_state_changes: false,
            session_start_hook: "SessionStart".to_string(),
            command_namespace: "/alfred:".to_string(),
            state_dir: None,
        }
    }
}

impl HookConfig {
    /// Defaults overridden by any `HOOK_STATE_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = HookConfig::default();
        config.apply_env(|key| env::var(format!("{ENV_PREFIX}{key}")).ok());
        config
    }

    /// Loads a JSON config file, returning defaults if it doesn't exist.
    ///
    /// Missing keys take their default value.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(HookConfig::default())
            }
            Err(err) => return Err(HookStateError::io("read config", err)),
        };

        if content.trim().is_empty() {
            return Ok(HookConfig::default());
        }

        let config: HookConfig =
            serde_json::from_str(&content).map_err(|e| HookStateError::ConfigMalformed {
                path: path.to_path_buf(),
                details: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| HookStateError::io("create config dir", e))?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| HookStateError::json("serialize config", e))?;
        fs::write(path, content).map_err(|e| HookStateError::io("write config", e))
    }

    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("hook_dedupe_window_secs", self.hook_dedupe_window_secs),
            ("command_dedupe_window_secs", self.command_dedupe_window_secs),
            ("state_cache_ttl_secs", self.state_cache_ttl_secs),
            ("lock_timeout_secs", self.lock_timeout_secs),
            ("cache_cleanup_interval_secs", self.cache_cleanup_interval_secs),
        ];
        for (field, value) in durations {
            if !value.is_finite() || value < 0.0 {
                return Err(HookStateError::ConfigInvalid {
                    field,
                    reason: format!("expected a non-negative number of seconds, got {value}"),
                });
            }
            if value > MAX_DURATION_SECS {
                return Err(HookStateError::ConfigInvalid {
                    field,
                    reason: format!("must be at most {MAX_DURATION_SECS} seconds, got {value}"),
                });
            }
        }

        let encoding = self.state_file_encoding.to_ascii_lowercase().replace('_', "-");
        if encoding != "utf-8" && encoding != "utf8" {
            return Err(HookStateError::ConfigInvalid {
                field: "state_file_encoding",
                reason: format!("only UTF-8 is supported, got {}", self.state_file_encoding),
            });
        }

        if self.state_file_indent > MAX_INDENT {
            return Err(HookStateError::ConfigInvalid {
                field: "state_file_indent",
                reason: format!("must be at most {MAX_INDENT}"),
            });
        }

        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        bounded_duration(self.lock_timeout_secs)
    }

    pub fn cache_cleanup_interval(&self) -> Duration {
        bounded_duration(self.cache_cleanup_interval_secs)
    }

    pub fn max_state_age_secs(&self) -> f64 {
        self.max_state_file_age_hours as f64 * 3600.0
    }

    pub fn worker_enabled(&self) -> bool {
        self.enable_caching && self.cache_cleanup_interval_secs > 0.0
    }

    /// Picks the directory holding the state files for `working_dir`.
    ///
    /// Order: explicit `state_dir`, `<working_dir>/.moai/state`, a per-project
    /// directory under the user cache dir, then the OS temp dir. The first
    /// candidate that can be created wins.
    pub fn resolve_state_dir(&self, working_dir: &Path) -> Result<PathBuf> {
        let mut candidates = Vec::new();
        if let Some(dir) = &self.state_dir {
            candidates.push(dir.clone());
        }
        candidates.push(working_dir.join(STATE_SUBDIR));

        let project_hash = format!("{:x}", md5::compute(working_dir.to_string_lossy().as_bytes()));
        if let Some(cache) = dirs::cache_dir() {
            candidates.push(cache.join(FALLBACK_SUBDIR).join(&project_hash));
        }
        candidates.push(env::temp_dir().join(FALLBACK_SUBDIR).join(&project_hash));

        let mut last_err = None;
        for candidate in candidates {
            match fs::create_dir_all(&candidate) {
                Ok(()) => return Ok(candidate),
                Err(err) => {
                    tracing::debug!(
                        path = %candidate.display(),
                        error = %err,
                        "State directory candidate unavailable"
                    );
                    last_err = Some(err);
                }
            }
        }

        Err(HookStateError::io(
            "create state directory",
            last_err.unwrap_or_else(|| std::io::Error::other("no state directory candidates")),
        ))
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn secs(lookup: &dyn Fn(&str) -> Option<String>, key: &str, target: &mut f64) {
            if let Some(raw) = lookup(key) {
                match raw.trim().parse::<f64>() {
                    Ok(value) => *target = value,
                    Err(_) => tracing::warn!(key, value = %raw, "Ignoring unparsable config value"),
                }
            }
        }
        fn flag(lookup: &dyn Fn(&str) -> Option<String>, key: &str, target: &mut bool) {
            if let Some(raw) = lookup(key) {
                match parse_flag(&raw) {
                    Some(value) => *target = value,
                    None => tracing::warn!(key, value = %raw, "Ignoring unparsable config flag"),
                }
            }
        }
        fn count<T: std::str::FromStr>(
            lookup: &dyn Fn(&str) -> Option<String>,
            key: &str,
            target: &mut T,
        ) {
            if let Some(raw) = lookup(key) {
                match raw.trim().parse::<T>() {
                    Ok(value) => *target = value,
                    Err(_) => tracing::warn!(key, value = %raw, "Ignoring unparsable config value"),
                }
            }
        }

        let lookup: &dyn Fn(&str) -> Option<String> = &lookup;
        secs(lookup, "HOOK_DEDUPE_WINDOW", &mut self.hook_dedupe_window_secs);
        secs(lookup, "COMMAND_DEDUPE_WINDOW", &mut self.command_dedupe_window_secs);
        secs(lookup, "CACHE_TTL", &mut self.state_cache_ttl_secs);
        secs(lookup, "LOCK_TIMEOUT", &mut self.lock_timeout_secs);
        secs(lookup, "CACHE_CLEANUP_INTERVAL", &mut self.cache_cleanup_interval_secs);
        flag(lookup, "ENABLE_CACHING", &mut self.enable_caching);
        flag(lookup, "PERSISTENCE", &mut self.enable_state_persistence);
        flag(lookup, "BACKUP_ON_WRITE", &mut self.backup_on_write);
        count(lookup, "MAX_AGE_HOURS", &mut self.max_state_file_age_hours);
        count(lookup, "MAX_HISTORY", &mut self.max_history_entries);
        count(lookup, "INDENT", &mut self.state_file_indent);
        flag(lookup, "VERBOSE", &mut self.enable_verbose_logging);
        flag(lookup, "DEBUG", &mut self.debug_mode);
        flag(lookup, "LOG_STATE_CHANGES", &mut self.log_state_changes);

        if let Some(encoding) = lookup("ENCODING") {
            self.state_file_encoding = encoding;
        }
        if let Some(namespace) = lookup("COMMAND_NAMESPACE") {
            self.command_namespace = namespace;
        }
        if let Some(dir) = lookup("DIR").filter(|d| !d.trim().is_empty()) {
            self.state_dir = Some(PathBuf::from(dir));
        }
    }
}

/// Seconds to a [`Duration`] clamped to `[0, MAX_DURATION_SECS]`. NaN maps
/// to zero. Never panics, even for configs that skipped validation.
fn bounded_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.clamp(0.0, MAX_DURATION_SECS)).unwrap_or(Duration::ZERO)
}

pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "true" | "TRUE" | "True" | "yes" | "YES" | "on" => Some(true),
        "0" | "false" | "FALSE" | "False" | "no" | "NO" | "off" => Some(false),
        _ => None,
    }
}
