//! Tracing configuration and log routing.
//!
//! Pipeline runs are long and mostly unattended, so every command logs twice: a compact
//! human-oriented stream on stdout and an append-only file that survives the terminal. The file
//! defaults to `logs/decision-atlas.log` and can be moved with `DECISION_ATLAS_LOG_FILE`.
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_LOG_DIR: &str = "logs";
const DEFAULT_LOG_FILE: &str = "decision-atlas.log";

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Configure tracing subscribers for stdout and file logging.
///
/// `RUST_LOG` wins when set; otherwise the filter is `debug` for verbose runs and `info` for
/// everything else.
pub fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let stdout_layer = fmt::layer().with_target(false).compact();

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer);

    match open_log_writer(&resolve_log_path()) {
        Some(writer) => {
            let file_layer = fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_ansi(false);
            registry.with(file_layer).init();
        }
        None => registry.init(),
    }
}

fn resolve_log_path() -> PathBuf {
    std::env::var("DECISION_ATLAS_LOG_FILE")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| Path::new(DEFAULT_LOG_DIR).join(DEFAULT_LOG_FILE))
}

/// Open `path` for appending behind a non‑blocking writer.
///
/// Returns `None` when the parent directory cannot be created or the file cannot be opened;
/// stdout logging keeps working in that case.
fn open_log_writer(path: &Path) -> Option<NonBlocking> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty())
        && let Err(err) = std::fs::create_dir_all(parent)
    {
        eprintln!("Failed to create log directory {}: {err}", parent.display());
        return None;
    }

    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
    {
        Ok(file) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(file);
            let _ = LOG_GUARD.set(guard);
            Some(non_blocking)
        }
        Err(err) => {
            eprintln!("Failed to open log file {}: {err}", path.display());
            None
        }
    }
}
