//! Structured logging for Strata.
//!
//! Installs a `tracing` subscriber with human-readable console output and, in
//! debug builds, a JSON log file for post-mortem analysis of commit timing and
//! deferred task failures. The level comes from `RUST_LOG` first, then the
//! config's `debug.log_level`.

use std::path::{Path, PathBuf};

use strata_config::Config;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Directive used when neither `RUST_LOG` nor the config names a level.
pub const DEFAULT_DIRECTIVE: &str = "info";

/// Name of the JSON log file written in debug builds.
pub const LOG_FILE: &str = "strata.log";

/// Initialize the global tracing subscriber.
///
/// * `log_dir` - directory for the JSON log file (debug builds only)
/// * `debug_build` - whether to write the JSON log file at all
/// * `config` - source of the fallback log level
///
/// Calling this twice leaves the first subscriber in place.
///
/// ```no_run
/// use strata_config::Config;
/// use strata_log::init_logging;
///
/// let config = Config::default();
/// init_logging(Some(std::path::Path::new("./logs")), true, Some(&config));
/// ```
pub fn init_logging(log_dir: Option<&Path>, debug_build: bool, config: Option<&Config>) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(config)));

    // Thread names matter here: commit tails run on the named context threads.
    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    if debug_build
        && let Some(log_dir) = log_dir
        && std::fs::create_dir_all(log_dir).is_ok()
        && let Ok(log_file) = std::fs::File::create(log_file_path(log_dir))
    {
        let file_layer = fmt::layer()
            .with_writer(log_file)
            .with_ansi(false)
            .with_target(true)
            .with_thread_names(true)
            .with_timer(fmt::time::uptime())
            .json();

        if subscriber.with(file_layer).try_init().is_err() {
            tracing::debug!("tracing subscriber already installed");
        }
        return;
    }

    if subscriber.try_init().is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

/// Filter directive derived from the config, falling back to [`DEFAULT_DIRECTIVE`].
pub fn filter_directive(config: Option<&Config>) -> String {
    config
        .map(|config| config.debug.log_level.trim())
        .filter(|level| !level.is_empty())
        .unwrap_or(DEFAULT_DIRECTIVE)
        .to_string()
}

/// Path of the JSON log file inside `log_dir`.
pub fn log_file_path(log_dir: &Path) -> PathBuf {
    log_dir.join(LOG_FILE)
}

/// `EnvFilter` with the default directive.
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_DIRECTIVE)
}
