//! hookstate: command-line front end for hook execution deduplication.
//!
//! Meant to be called from hook scripts. Each invocation prints one JSON
//! document on stdout; the caller checks `executed` before doing its work.
//!
//! ## Subcommands
//!
//! - `track`: Record a hook firing, or report it as a duplicate
//! - `dedupe`: Check a namespaced slash command against the command window
//! - `complete`: Mark the running command as finished
//! - `cleanup`: Drop state older than the configured age
//! - `count`: Show execution counts
//! - `stats`: Show (and optionally save) performance metrics

mod logging;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use chrono::Utc;
use clap::{Parser, Subcommand};
use hook_state::{
    EngineRegistry, ExecutionResult, HookConfig, HookStateEngine, HookStateError,
    DEFAULT_CLEANUP_TIMEOUT,
};
use serde::Serialize;
use serde_json::json;

#[derive(Parser)]
#[command(name = "hookstate")]
#[command(about = "Hook execution deduplication and state tracking")]
#[command(version)]
struct Cli {
    /// Project directory whose state is tracked (defaults to the current directory)
    #[arg(long, global = true, value_name = "DIR")]
    cwd: Option<PathBuf>,

    /// JSON config file (defaults to HOOK_STATE_* environment variables)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Track a hook execution
    Track {
        #[arg(value_name = "HOOK")]
        hook: String,

        /// Hook phase (e.g. "compact" or "clear" for SessionStart)
        #[arg(long)]
        phase: Option<String>,
    },

    /// Check a slash command for duplicate execution
    Dedupe {
        #[arg(value_name = "COMMAND")]
        command: String,
    },

    /// Mark the current command as complete
    Complete {
        #[arg(value_name = "COMMAND")]
        command: Option<String>,
    },

    /// Remove state older than the given age
    Cleanup {
        #[arg(long, value_name = "N")]
        max_age_hours: Option<u64>,
    },

    /// Show the execution count for a hook
    Count {
        #[arg(value_name = "HOOK")]
        hook: String,
    },

    /// Show performance metrics
    Stats {
        /// Also write them to performance_metrics.json in the state directory
        #[arg(long)]
        save: bool,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    State(#[from] HookStateError),

    #[error("Failed to render output: {0}")]
    Output(#[from] serde_json::Error),
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let (config, config_error) = load_config(cli.config.as_deref());
    let _logging_guard = logging::init(&config);
    if let Some(err) = config_error {
        tracing::warn!(error = %err, "Config file unusable, using environment defaults");
    }
    hook_state::install_exit_hook();

    let working_dir = cli
        .cwd
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));

    let code = match run(cli.command, &working_dir, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "hookstate failed");
            ExitCode::FAILURE
        }
    };

    EngineRegistry::global().cleanup_all(DEFAULT_CLEANUP_TIMEOUT);
    code
}

fn load_config(path: Option<&Path>) -> (HookConfig, Option<HookStateError>) {
    let Some(path) = path else {
        return (HookConfig::from_env(), None);
    };
    match HookConfig::load(path).and_then(|config| config.validate().map(|()| config)) {
        Ok(config) => (config, None),
        Err(err) => (HookConfig::from_env(), Some(err)),
    }
}

fn run(command: Commands, working_dir: &Path, config: HookConfig) -> Result<(), CliError> {
    let engine = EngineRegistry::global().get(working_dir, Some(config));

    match command {
        Commands::Track { hook, phase } => {
            let result = match engine {
                Ok(engine) => engine.track_hook_execution(&hook, phase.as_deref()),
                Err(err) => {
                    let mut result = unavailable(err);
                    result.hook_name = Some(hook);
                    result.phase = phase;
                    result
                }
            };
            print_json(&result)
        }
        Commands::Dedupe { command } => {
            let result = match engine {
                Ok(engine) => engine.deduplicate_command(&command),
                Err(err) => {
                    let mut result = unavailable(err);
                    result.command = Some(command);
                    result
                }
            };
            print_json(&result)
        }
        Commands::Complete { command } => {
            engine?.mark_command_complete(command.as_deref())?;
            print_json(&json!({ "completed": true, "command": command }))
        }
        Commands::Cleanup { max_age_hours } => {
            let engine = engine?;
            engine.cleanup_old_states(max_age_hours)?;
            let max_age_hours = max_age_hours.unwrap_or(engine.config().max_state_file_age_hours);
            print_json(&json!({ "cleaned": true, "max_age_hours": max_age_hours }))
        }
        Commands::Count { hook } => {
            let engine = engine?;
            print_json(&json!({
                "hook": hook,
                "count": engine.get_hook_execution_count(&hook),
                "command_count": engine.get_command_execution_count(),
            }))
        }
        Commands::Stats { save } => {
            let engine = engine?;
            stats(&engine, save)
        }
    }
}

fn stats(engine: &HookStateEngine, save: bool) -> Result<(), CliError> {
    let mut output = serde_json::to_value(engine.get_performance_summary())?;
    if save {
        let path = engine.save_performance_summary()?;
        output["saved_to"] = json!(path.display().to_string());
    }
    output["state_dir"] = json!(engine.state_dir().display().to_string());
    print_json(&output)
}

/// A hook must never be blocked because its state couldn't be opened.
fn unavailable(err: HookStateError) -> ExecutionResult {
    tracing::error!(error = %err, "State engine unavailable, allowing execution");
    ExecutionResult::degraded(
        Utc::now(),
        err.to_string(),
        "State tracking unavailable; continuing execution",
    )
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
