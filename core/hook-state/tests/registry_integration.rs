//! Integration tests for engine sharing, teardown and the free-function API.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use hook_state::{EngineRegistry, HookConfig, PerformanceMetrics};
use tempfile::tempdir;

fn quiet_config() -> HookConfig {
    HookConfig {
        cache_cleanup_interval_secs: 0.0,
        ..HookConfig::default()
    }
}

#[test]
fn test_concurrent_get_yields_one_engine() {
    let temp = tempdir().unwrap();
    let registry = Arc::new(EngineRegistry::with_metrics(PerformanceMetrics::new()));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            let dir = temp.path().to_path_buf();
            thread::spawn(move || {
                barrier.wait();
                registry.get(&dir, Some(quiet_config())).unwrap()
            })
        })
        .collect();

    let engines: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(engines.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_concurrent_tracking_executes_exactly_once() {
    let temp = tempdir().unwrap();
    let registry = EngineRegistry::with_metrics(PerformanceMetrics::new());
    let engine = registry.get(temp.path(), Some(quiet_config())).unwrap();
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                engine.track_hook_execution("PostToolUse", None)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(results.iter().filter(|r| !r.duplicate).count(), 1);
    assert!(results.iter().all(|r| r.error.is_none()));
    assert_eq!(engine.get_hook_execution_count("PostToolUse"), 1);
}

#[test]
fn test_second_registry_sees_persisted_state() {
    let temp = tempdir().unwrap();
    let first = EngineRegistry::with_metrics(PerformanceMetrics::new());
    let second = EngineRegistry::with_metrics(PerformanceMetrics::new());

    let a = first.get(temp.path(), Some(quiet_config())).unwrap();
    let b = second.get(temp.path(), Some(quiet_config())).unwrap();
    assert!(!Arc::ptr_eq(&a, &b));

    assert!(!a.track_hook_execution("Stop", None).duplicate);
    let echoed = b.track_hook_execution("Stop", None);
    assert!(echoed.duplicate);
    assert_eq!(echoed.execution_count, 1);
}

#[test]
fn test_state_survives_engine_teardown() {
    let temp = tempdir().unwrap();
    let registry = EngineRegistry::with_metrics(PerformanceMetrics::new());

    let engine = registry.get(temp.path(), Some(quiet_config())).unwrap();
    engine.deduplicate_command("/alfred:1-plan");
    engine.track_hook_execution("SessionStart", Some("clear"));
    assert_eq!(registry.cleanup_all(Duration::from_secs(5)), 1);

    let reopened = registry.get(temp.path(), Some(quiet_config())).unwrap();
    assert!(!Arc::ptr_eq(&engine, &reopened));
    assert_eq!(reopened.get_hook_execution_count("SessionStart"), 1);
    assert_eq!(reopened.get_command_execution_count(), 1);
}

#[test]
fn test_corrupt_state_file_is_treated_as_empty() {
    let temp = tempdir().unwrap();
    let registry = EngineRegistry::with_metrics(PerformanceMetrics::new());
    let engine = registry.get(temp.path(), Some(quiet_config())).unwrap();
    std::fs::write(engine.hook_state_path(), "{ not json").unwrap();

    let result = engine.track_hook_execution("Stop", None);
    assert!(result.executed && !result.duplicate);
    assert_eq!(result.reason.as_deref(), Some("first execution"));
    assert!(registry.metrics().summary().io_errors >= 1);
}

#[test]
fn test_explicit_state_dir_is_used() {
    let project = tempdir().unwrap();
    let state = tempdir().unwrap();
    let registry = EngineRegistry::with_metrics(PerformanceMetrics::new());
    let engine = registry
        .get(
            project.path(),
            Some(HookConfig {
                state_dir: Some(state.path().join("custom")),
                ..quiet_config()
            }),
        )
        .unwrap();

    engine.track_hook_execution("Stop", None);
    assert!(state
        .path()
        .join("custom/hook_execution_state.json")
        .exists());
    assert!(!project.path().join(".moai").exists());
}

#[test]
fn test_free_functions_share_global_engine() {
    let temp = tempdir().unwrap();

    let first = hook_state::track_hook_execution("Notification", temp.path(), None);
    let second = hook_state::track_hook_execution("Notification", temp.path(), None);
    assert!(!first.duplicate);
    assert!(second.duplicate);

    let command = hook_state::deduplicate_command("/alfred:3-sync", temp.path());
    assert!(command.executed);
    hook_state::mark_command_complete(Some("/alfred:3-sync"), temp.path()).unwrap();
    hook_state::cleanup_old_states(temp.path(), None).unwrap();

    assert!(EngineRegistry::global().contains(temp.path()));
    assert!(hook_state::get_performance_summary().executions_total >= 3);
    EngineRegistry::global().remove(temp.path());
}
