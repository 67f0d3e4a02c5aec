//! Tracing setup: `EnvFilter` + `fmt` layer on stdout, with an optional
//! non-blocking rolling-file appender when `FUN_LOG_DIR` is set. The
//! critical path never performs synchronous file I/O; an explicit drain is
//! required before the summary line and process exit.

use std::env;
use std::path::PathBuf;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Holds the non-blocking worker guard; dropping (or explicit `drain`)
/// flushes buffered log records.
pub struct LoggingHandle {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

impl LoggingHandle {
    /// Flush any buffered records. Safe to call more than once.
    pub fn drain(self) {
        drop(self);
    }
}

pub fn init() -> LoggingHandle {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "fun=info".into());

    let stdout_layer = tracing_subscriber::fmt::layer();

    match env::var("FUN_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(PathBuf::from(dir), "fun.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false);

            tracing_subscriber::registry()
                .with(filter)
                .with(stdout_layer)
                .with(file_layer)
                .init();

            LoggingHandle { _file_guard: Some(guard) }
        }
        _ => {
            tracing_subscriber::registry().with(filter).with(stdout_layer).init();
            LoggingHandle { _file_guard: None }
        }
    }
}

/// Load `.env` from the current directory and its parents: a cwd search,
/// then a manifest-dir fallback for `cargo run --manifest-path` invocations
/// from elsewhere.
pub fn load_env() {
    let _ = dotenv::dotenv();

    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    for candidate in [manifest_dir.join(".env"), manifest_dir.join("../.env")] {
        if candidate.exists() {
            let _ = dotenv::from_path(&candidate);
        }
    }
}
