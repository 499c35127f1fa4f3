//! Structured Logger
//!
//! Wraps `tracing` with a console layer and, when a log directory is
//! configured, an NDJSON file rotated daily. `RUST_LOG` overrides `level`.

use std::path::Path;

use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Prefix of the rotated log files, e.g. `havoc.log.2026-10-19`.
pub const LOG_FILE_NAME: &str = "havoc.log";

/// Initialize the global logger. Calling it again is a no-op.
///
/// If the log directory cannot be created, logging continues on the console
/// alone and a warning says why.
pub fn init_logger(log_dir: Option<&Path>, level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (appender, file_error) = match log_dir.map(file_appender) {
        Some(Ok(appender)) => (Some(appender), None),
        Some(Err(e)) => (None, Some(e)),
        None => (None, None),
    };
    let file_layer =
        appender.map(|appender| fmt::layer().json().with_writer(appender).with_ansi(false));

    // Console goes to stderr; stdout belongs to command output.
    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(true);

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    if let (Some(dir), Some(e)) = (log_dir, file_error) {
        tracing::warn!(dir = %dir.display(), error = %e, "Cannot write log files, logging to console only");
    }
}

fn file_appender(dir: &Path) -> Result<RollingFileAppender, InitError> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_NAME)
        .build(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_creates_log_dir_and_is_reentrant() {
        let dir = std::env::temp_dir().join(format!("havoc-logging-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);

        init_logger(Some(dir.as_path()), "debug");
        tracing::info!(test = true, "Logger initialized");
        assert!(dir.exists());

        // A second subscriber is refused without panicking.
        init_logger(None, "info");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_unwritable_log_dir_falls_back_to_console() {
        let blocker = std::env::temp_dir().join(format!("havoc-log-blocker-{}", std::process::id()));
        std::fs::write(&blocker, b"not a directory").unwrap();
        let dir = blocker.join("logs");

        assert!(file_appender(&dir).is_err());
        init_logger(Some(dir.as_path()), "info");
        tracing::info!("Still logging");

        std::fs::remove_file(&blocker).unwrap();
    }
}
