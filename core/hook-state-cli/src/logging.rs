//! Subscriber setup for the `hookstate` binary.
//!
//! Hooks run with their stdout captured, so everything goes to stderr. When
//! `HOOK_STATE_LOG_DIR` is set a daily-rolling file copy is kept as well.

use std::env;
use std::path::PathBuf;

use hook_state::config::parse_flag;
use hook_state::HookConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const LOG_FILTER_ENV: &str = "HOOK_STATE_LOG";
const LOG_DIR_ENV: &str = "HOOK_STATE_LOG_DIR";
const LOG_FILE_PREFIX: &str = "hookstate.log";

/// Installs the global subscriber. Keep the returned guard alive until exit
/// or buffered file output is lost.
pub fn init(config: &HookConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_env(LOG_FILTER_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_level(config)));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let (file_layer, guard) = match log_dir() {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    guard
}

fn default_level(config: &HookConfig) -> &'static str {
    let debug_env = env::var("HOOK_STATE_DEBUG")
        .ok()
        .and_then(|value| parse_flag(&value))
        .unwrap_or(false);

    if config.debug_mode || debug_env {
        "debug"
    } else if config.enable_verbose_logging {
        "info"
    } else {
        "warn"
    }
}

fn log_dir() -> Option<PathBuf> {
    env::var_os(LOG_DIR_ENV)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}
