//! # iterlog-logging
//!
//! The log bus agents write to, plus tracing setup for the binaries.
//!
//! ## Key Types
//!
//! - [`Logger`] - Append-only, listener-subscribable event bus
//! - [`LogEntry`] - One event: source agent, timestamp, level, free-form details
//! - [`LogFormat`] - Console echo format (Pretty, JSON, Compact, Quiet)

mod events;

pub use events::{ListenerId, LogEntry, LogFormat, LogLevel, Logger, DEFAULT_CAPACITY};

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing for the application.
///
/// `RUST_LOG` takes precedence over `level`. When `log_dir` is set, a daily
/// rolling JSON file is written there as well; keep the returned guard alive
/// for as long as the file should receive output.
pub fn init_tracing(level: &str, format: LogFormat, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "iterlog.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    // The file layer sits directly on the registry so both console stacks share its type.
    let result = match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(file_layer)
            .with(filter)
            .with(fmt::layer().json().with_target(false).with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Pretty | LogFormat::Compact | LogFormat::Quiet => tracing_subscriber::registry()
            .with(file_layer)
            .with(filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init(),
    };

    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }

    guard
}
