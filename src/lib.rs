//! dirwatch - Watch a directory tree for create, modify and delete events
//!
//! [`DirWatcher`] registers a root directory and its existing subdirectories
//! with the platform notification service, pumps events on a background
//! thread, and fans them out to [`DirListener`]s. Platform access goes through
//! the traits in [`traits`] so the core can be tested without the OS.

pub mod config;
pub mod listeners;
pub mod mocks;
pub mod production;
pub mod pump;
pub mod traits;
pub mod watcher;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub use config::{LogConfig, ServiceConfig};
pub use traits::{DirListener, WatchEvent, WatchEventKind};
pub use watcher::{DirWatcher, DirWatcherError, WatcherState};

/// Install the global tracing subscriber: stdout, plus a daily rolling file
/// when `log_dir` is configured.
///
/// The returned guard flushes the file writer; keep it alive until exit.
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::try_new(&config.filter)?;

    match &config.log_dir {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir)?;
            let file_appender = rolling::daily(log_dir, "dirwatch.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer()) // stdout
                .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false)) // file
                .try_init()?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .try_init()?;
            Ok(None)
        }
    }
}
