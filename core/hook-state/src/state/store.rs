//! File-backed JSON records with an in-memory TTL cache.
//!
//! # Defensive Design
//!
//! [`JsonStateStore::load`] never fails. A missing, empty, unreadable or
//! corrupt file yields the record's default value and is counted in the
//! metrics. [`JsonStateStore::save`] reports failure as `false`.
//! The `try_*` variants expose the underlying [`HookStateError`].
//!
//! # Atomic Writes
//!
//! Uses temp file + rename so a crash mid-write never leaves a truncated
//! state file behind.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs_err as fs;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::clock::SharedClock;
use crate::config::HookConfig;
use crate::error::{HookStateError, Result};
use crate::metrics::PerformanceMetrics;

struct CacheEntry<T> {
    value: T,
    cached_at: f64,
}

/// Outcome of [`JsonStateStore::load`].
#[derive(Debug, Clone)]
pub struct Loaded<T> {
    pub value: T,
    /// True when the value came from the in-memory cache without touching disk.
    pub cache_hit: bool,
}

/// Store settings lifted from [`HookConfig`].
#[derive(Debug, Clone)]
struct StoreSettings {
    cache_ttl_secs: f64,
    caching: bool,
    persistence: bool,
    backup_on_write: bool,
    indent: usize,
    log_state_changes: bool,
}

impl From<&HookConfig> for StoreSettings {
    fn from(config: &HookConfig) -> Self {
        StoreSettings {
            cache_ttl_secs: config.state_cache_ttl_secs,
            caching: config.enable_caching,
            persistence: config.enable_state_persistence,
            backup_on_write: config.backup_on_write,
            indent: config.state_file_indent,
            log_state_changes: config.log_state_changes,
        }
    }
}

pub struct JsonStateStore<T> {
    label: &'static str,
    path: PathBuf,
    settings: StoreSettings,
    clock: SharedClock,
    metrics: Arc<PerformanceMetrics>,
    cache: Mutex<Option<CacheEntry<T>>>,
}

impl<T> JsonStateStore<T>
where
    T: Serialize + DeserializeOwned + Default + Clone,
{
    pub fn new(
        label: &'static str,
        path: PathBuf,
        config: &HookConfig,
        clock: SharedClock,
        metrics: Arc<PerformanceMetrics>,
    ) -> Self {
        JsonStateStore {
            label,
            path,
            settings: StoreSettings::from(config),
            clock,
            metrics,
            cache: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> PathBuf {
        self.path.with_extension("json.backup")
    }

    pub fn load(&self) -> Loaded<T> {
        self.fetch(true)
    }

    /// Like [`load`](Self::load), but a disk read never populates the
    /// cache. For readers that don't hold the engine lock and so must not
    /// overwrite a newer cached value with what they read.
    pub fn peek(&self) -> Loaded<T> {
        self.fetch(false)
    }

    fn fetch(&self, populate_cache: bool) -> Loaded<T> {
        let now = self.clock.now_epoch();

        if self.settings.caching {
            let cache = self.cache.lock();
            if let Some(entry) = cache.as_ref() {
                if now - entry.cached_at < self.settings.cache_ttl_secs {
                    if self.settings.log_state_changes {
                        tracing::debug!(store = self.label, "State cache hit");
                    }
                    self.metrics.record_cache_hit();
                    return Loaded {
                        value: entry.value.clone(),
                        cache_hit: true,
                    };
                }
            }
        }

        let value = match self.try_load() {
            Ok(Some(value)) => {
                self.metrics.record_state_read();
                self.metrics.record_cache_hit();
                if self.settings.log_state_changes {
                    tracing::debug!(store = self.label, path = %self.path.display(), "Loaded state");
                }
                value
            }
            Ok(None) => {
                self.metrics.record_cache_miss();
                T::default()
            }
            Err(err) => {
                tracing::warn!(store = self.label, error = %err, "Failed to load state, using defaults");
                self.metrics.record_io_error();
                self.metrics.record_cache_miss();
                T::default()
            }
        };

        if populate_cache {
            self.remember(value.clone(), now);
        }
        Loaded {
            value,
            cache_hit: false,
        }
    }

    /// Reads the backing file, bypassing the cache. `Ok(None)` for a missing
    /// or empty file.
    pub fn try_load(&self) -> Result<Option<T>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(HookStateError::io(format!("read {} state", self.label), err)),
        };

        if content.trim().is_empty() {
            return Ok(None);
        }

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| HookStateError::json(format!("parse {} state", self.label), e))
    }

    pub fn save(&self, value: &T) -> bool {
        match self.try_save(value) {
            Ok(()) => true,
            Err(HookStateError::PersistenceDisabled) => false,
            Err(err) => {
                tracing::error!(store = self.label, error = %err, "Failed to save state");
                self.metrics.record_io_error();
                false
            }
        }
    }

    /// Writes `value` atomically. With persistence disabled the value is
    /// only cached and [`HookStateError::PersistenceDisabled`] is returned.
    pub fn try_save(&self, value: &T) -> Result<()> {
        if !self.settings.persistence {
            self.remember(value.clone(), self.clock.now_epoch());
            return Err(HookStateError::PersistenceDisabled);
        }

        let parent_dir = self.path.parent().ok_or_else(|| {
            HookStateError::Unexpected(format!("{} has no parent directory", self.path.display()))
        })?;
        fs::create_dir_all(parent_dir)
            .map_err(|e| HookStateError::io("create state directory", e))?;

        if self.settings.backup_on_write && self.path.exists() {
            if let Err(err) = fs::copy(&self.path, self.backup_path()) {
                tracing::warn!(store = self.label, error = %err, "State backup failed, continuing with save");
            }
        }

        let content = to_json(value, self.settings.indent)
            .map_err(|e| HookStateError::json(format!("serialize {} state", self.label), e))?;

        let mut temp_file = NamedTempFile::new_in(parent_dir)
            .map_err(|e| HookStateError::io("create temp state file", e))?;
        temp_file
            .write_all(&content)
            .map_err(|e| HookStateError::io("write temp state file", e))?;
        temp_file
            .flush()
            .map_err(|e| HookStateError::io("flush temp state file", e))?;
        temp_file
            .persist(&self.path)
            .map_err(|e| HookStateError::io(format!("replace {} state file", self.label), e.error))?;

        self.remember(value.clone(), self.clock.now_epoch());
        self.metrics.record_state_write();
        if self.settings.log_state_changes {
            tracing::debug!(store = self.label, path = %self.path.display(), "Saved state");
        }
        Ok(())
    }

    /// Drops the cached value if it is at least one TTL old. Returns true
    /// when something was evicted.
    pub fn evict_expired(&self, now: f64) -> bool {
        let mut cache = self.cache.lock();
        let expired = cache
            .as_ref()
            .is_some_and(|entry| now - entry.cached_at >= self.settings.cache_ttl_secs);
        if expired {
            *cache = None;
            tracing::debug!(store = self.label, "Evicted expired state cache");
        }
        expired
    }

    pub fn clear_cache(&self) {
        *self.cache.lock() = None;
    }

    pub fn is_cached(&self) -> bool {
        self.cache.lock().is_some()
    }

    fn remember(&self, value: T, at: f64) {
        if self.settings.caching {
            *self.cache.lock() = Some(CacheEntry {
                value,
                cached_at: at,
            });
        }
    }
}

fn to_json<T: Serialize>(value: &T, indent: usize) -> serde_json::Result<Vec<u8>> {
    if indent == 0 {
        return serde_json::to_vec(value);
    }
    let indent = vec![b' '; indent];
    let formatter = serde_json::ser::PrettyFormatter::with_indent(&indent);
    let mut buf = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut serializer)?;
    Ok(buf)
}
