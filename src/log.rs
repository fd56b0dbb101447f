//! Structured logging for debugging briareus.
//!
//! Log levels:
//! - ERROR: Critical failures that prevent a run from completing
//! - WARN: Unexpected conditions that are recoverable (timeouts, sink errors)
//! - INFO: Run and sub-task lifecycle transitions
//! - DEBUG: Dispatch decisions, config and snapshot traces
//! - TRACE: Very detailed traces
//!
//! Debug mode can be enabled with `--debug` flag or `BRIAREUS_DEBUG=1` env var.
//! `BRIAREUS_LOG` takes a full filter directive and overrides both.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Initialize logging to ~/.briareus/briareus.log with an explicit debug
/// mode setting.
///
/// The log file is truncated on startup. Without a home directory the
/// output goes to stderr. Calling this twice keeps the first subscriber.
pub fn init_with_debug(debug: bool) {
    let env_debug = debug_from_env(std::env::var("BRIAREUS_DEBUG").ok().as_deref());
    let debug_enabled = debug || env_debug;
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let directive = filter_directive(debug_enabled, std::env::var("BRIAREUS_LOG").ok().as_deref());
    let filter = EnvFilter::try_new(&directive)
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(debug_enabled, None)));

    let result = match open_log_file() {
        Some(file) => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(file)),
            )
            .try_init(),
        None => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init(),
    };
    let _ = result;
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

pub fn log_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".briareus").join("briareus.log"))
}

fn open_log_file() -> Option<File> {
    let path = log_path()?;
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).ok()?;
    }
    // Truncate file on startup
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .ok()
}

fn debug_from_env(value: Option<&str>) -> bool {
    value
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn filter_directive(debug: bool, override_directive: Option<&str>) -> String {
    match override_directive.map(str::trim) {
        Some(directive) if !directive.is_empty() => directive.to_string(),
        _ if debug => "briareus=debug".to_string(),
        _ => "briareus=info".to_string(),
    }
}
