//! Process-wide performance counters for state tracking.
//!
//! Counters are lock-free atomics so the read-only accessors on the engine
//! never contend with tracking calls. [`PerformanceMetrics::summary`] takes a
//! point-in-time copy; individual counters may be a few increments apart.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::FailureKind;

static GLOBAL_METRICS: Lazy<Arc<PerformanceMetrics>> =
    Lazy::new(|| Arc::new(PerformanceMetrics::default()));

#[derive(Debug, Default)]
pub struct PerformanceMetrics {
    state_reads: AtomicU64,
    state_writes: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    io_errors: AtomicU64,
    concurrent_access_errors: AtomicU64,
    other_errors: AtomicU64,
    executions_total: AtomicU64,
    duplicates_total: AtomicU64,
    failures_total: AtomicU64,
    // Microseconds, so timing survives integer accumulation.
    execution_time_total_us: AtomicU64,
    execution_time_max_us: AtomicU64,
}

/// Immutable snapshot of [`PerformanceMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub state_reads: u64,
    pub state_writes: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub io_errors: u64,
    pub concurrent_access_errors: u64,
    pub other_errors: u64,
    pub executions_total: u64,
    pub duplicates_total: u64,
    pub failures_total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_hit_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_execution_ms: Option<f64>,
    pub max_execution_ms: f64,
}

impl MetricsSummary {
    pub fn total_errors(&self) -> u64 {
        self.io_errors
            .saturating_add(self.concurrent_access_errors)
            .saturating_add(self.other_errors)
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl PerformanceMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The collector shared by every engine that wasn't given its own.
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL_METRICS)
    }

    pub fn record_state_read(&self) {
        bump(&self.state_reads);
    }

    pub fn record_state_write(&self) {
        bump(&self.state_writes);
    }

    pub fn record_cache_hit(&self) {
        bump(&self.cache_hits);
    }

    pub fn record_cache_miss(&self) {
        bump(&self.cache_misses);
    }

    pub fn record_io_error(&self) {
        bump(&self.io_errors);
    }

    pub fn record_concurrent_access_error(&self) {
        bump(&self.concurrent_access_errors);
    }

    pub fn record_other_error(&self) {
        bump(&self.other_errors);
    }

    pub fn record_failure(&self, kind: FailureKind) {
        match kind {
            FailureKind::ConcurrentAccess => self.record_concurrent_access_error(),
            FailureKind::Persistence => self.record_io_error(),
            FailureKind::Other => self.record_other_error(),
        }
    }

    /// Records the outcome and duration of one tracking decision.
    pub fn record_execution(&self, elapsed_ms: f64, success: bool, duplicate: bool) {
        bump(&self.executions_total);
        if duplicate {
            bump(&self.duplicates_total);
        }
        if !success {
            bump(&self.failures_total);
        }

        let micros = if elapsed_ms.is_finite() && elapsed_ms > 0.0 {
            (elapsed_ms * 1000.0) as u64
        } else {
            0
        };
        self.execution_time_total_us
            .fetch_add(micros, Ordering::Relaxed);
        self.execution_time_max_us
            .fetch_max(micros, Ordering::Relaxed);
    }

    pub fn summary(&self) -> MetricsSummary {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        let cache_hits = load(&self.cache_hits);
        let cache_misses = load(&self.cache_misses);
        let lookups = cache_hits.saturating_add(cache_misses);
        let executions_total = load(&self.executions_total);
        let total_us = load(&self.execution_time_total_us);

        MetricsSummary {
            state_reads: load(&self.state_reads),
            state_writes: load(&self.state_writes),
            cache_hits,
            cache_misses,
            io_errors: load(&self.io_errors),
            concurrent_access_errors: load(&self.concurrent_access_errors),
            other_errors: load(&self.other_errors),
            executions_total,
            duplicates_total: load(&self.duplicates_total),
            failures_total: load(&self.failures_total),
            cache_hit_rate: (lookups > 0).then(|| cache_hits as f64 / lookups as f64),
            avg_execution_ms: (executions_total > 0)
                .then(|| total_us as f64 / executions_total as f64 / 1000.0),
            max_execution_ms: load(&self.execution_time_max_us) as f64 / 1000.0,
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.state_reads,
            &self.state_writes,
            &self.cache_hits,
            &self.cache_misses,
            &self.io_errors,
            &self.concurrent_access_errors,
            &self.other_errors,
            &self.executions_total,
            &self.duplicates_total,
            &self.failures_total,
            &self.execution_time_total_us,
            &self.execution_time_max_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
