//! Logging setup for hosts embedding voxlod.
//!
//! Library crates only emit `tracing` events. A host that has no subscriber
//! of its own calls [`init_logging`] once at startup to get console output,
//! plus a JSON log file in debug builds.

use std::path::Path;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use voxlod_config::Config;

/// Filter used when neither `RUST_LOG` nor the config sets one.
pub const DEFAULT_FILTER: &str = "info,wgpu=warn,naga=warn";

/// File name of the JSON log written in debug builds.
pub const LOG_FILE_NAME: &str = "voxlod.log";

/// Resolve the filter directive string.
///
/// Precedence: `config.debug.log_level` (when non-empty), then
/// [`DEFAULT_FILTER`]. `RUST_LOG` still wins at install time.
pub fn filter_directives(config: Option<&Config>) -> String {
    match config {
        Some(config) if !config.debug.log_level.is_empty() => {
            let level = config.debug.log_level.as_str();
            // A bare level still keeps the GPU stack quiet.
            if level.contains('=') || level.contains(',') {
                level.to_string()
            } else {
                format!("{level},wgpu=warn,naga=warn")
            }
        }
        _ => DEFAULT_FILTER.to_string(),
    }
}

/// Install the global tracing subscriber.
///
/// * `log_dir` - directory for the JSON log file (debug builds only)
/// * `debug_build` - enables the file layer
/// * `config` - optional config supplying the log level
///
/// Returns `false` if a global subscriber was already installed.
///
/// ```no_run
/// use voxlod_config::Config;
///
/// let config = Config::default();
/// voxlod_log::init_logging(Some(std::path::Path::new("./logs")), true, Some(&config));
/// ```
pub fn init_logging(log_dir: Option<&Path>, debug_build: bool, config: Option<&Config>) -> bool {
    let directives = filter_directives(config);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directives));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true) // mesh workers are named lod-mesh-N
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    if debug_build
        && let Some(log_dir) = log_dir
        && std::fs::create_dir_all(log_dir).is_ok()
        && let Ok(log_file) = std::fs::File::create(log_dir.join(LOG_FILE_NAME))
    {
        let file_layer = fmt::layer()
            .with_writer(log_file)
            .with_ansi(false)
            .with_target(true)
            .with_timer(fmt::time::uptime())
            .json();

        let installed = subscriber.with(file_layer).try_init().is_ok();
        if installed {
            tracing::debug!(%directives, dir = %log_dir.display(), "logging to file");
        }
        return installed;
    }

    let installed = subscriber.try_init().is_ok();
    if installed {
        tracing::debug!(%directives, "logging initialized");
    }
    installed
}

/// An `EnvFilter` built from [`DEFAULT_FILTER`].
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_FILTER)
}
