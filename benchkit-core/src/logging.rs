//! Tracing subscriber setup.
//!
//! Human readable lines go to stderr, filtered by `BENCHKIT_LOG` (falling back to the
//! given default directive). When a log directory is given, a JSON layer additionally
//! writes daily rolling files at debug level.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Keeps the non-blocking file writer alive. Drop it last.
#[must_use = "dropping the guard stops the JSON file writer"]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber. Calling it again is a no-op.
pub fn init(default_filter: &str, json_log_dir: Option<&Path>) -> LoggingGuard {
    let filter =
        EnvFilter::try_from_env("BENCHKIT_LOG").unwrap_or_else(|_| EnvFilter::new(default_filter));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_filter(filter);

    let (json_layer, guard) = match json_log_dir {
        Some(dir) => {
            let _ = std::fs::create_dir_all(dir);
            let appender = tracing_appender::rolling::daily(dir, "benchkit.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(EnvFilter::new("debug"));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .try_init();

    LoggingGuard { _file: guard }
}
