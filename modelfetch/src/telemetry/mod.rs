//! Logging setup for library consumers and the CLI.
//!
//! Thin wrapper over `tracing-subscriber`: an env-filtered console layer,
//! with optional daily-rotated file output for long-running hosts.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::LocalTime;
use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "modelfetch=info";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Initialize console logging.
///
/// Respects `RUST_LOG`; defaults to info-level output for this crate.
/// Safe to call once per process; later calls are ignored.
pub fn init() {
    let timer = LocalTime::new(time::macros::format_description!(
        "[hour]:[minute]:[second].[subsecond digits:3]"
    ));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_timer(timer)
        .with_target(false)
        .try_init();
}

/// Initialize logging to a daily-rotated file under `log_dir`.
///
/// Returns the appender guard; drop it only at shutdown, or buffered lines
/// are lost.
pub fn init_with_file(log_dir: &Path) -> WorkerGuard {
    let appender = tracing_appender::rolling::daily(log_dir, "modelfetch.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(writer)
        .with_ansi(false)
        .try_init();
    guard
}
