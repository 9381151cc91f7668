// crates/core/src/logging.rs
//! Tracing subscriber wiring for the daemon shell.
//!
//! The capture core only emits `tracing` events; this is the one place
//! that turns the `logging` config section into installed layers.

use crate::config::LoggingConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber from the logging config.
///
/// Returns the file writer's guard when a log file is configured; the
/// caller must hold it for the daemon's lifetime or buffered lines are
/// lost on exit. Size/backup rotation is left to the host's log rotation.
pub fn init(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_new(&config.level)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let console_layer = config
        .console
        .then(|| fmt::layer().with_target(true));

    let (file_layer, guard) = match &config.file_path {
        Some(path) => {
            let appender = tracing_appender::rolling::never(
                path.parent().unwrap_or_else(|| std::path::Path::new(".")),
                path.file_name().unwrap_or_else(|| "hindsight.log".as_ref()),
            );
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    guard
}
