// 📜 Logging - tracing subscriber setup
// Console output plus an optional daily-rolling JSON-lines file

use anyhow::{Context as AnyhowContext, Result};
use std::path::Path;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_FILE_PREFIX: &str = "receipt-ledger.log";

/// Where log lines go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleOutput {
    Stderr,
    /// The terminal belongs to a full-screen UI
    Off,
}

/// Initialize the global subscriber.
///
/// `RUST_LOG` wins over `level`. Calling this twice is harmless: the second
/// call leaves the first subscriber in place.
pub fn init_logging(level: &str, log_dir: Option<&Path>, console: ConsoleOutput) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let console_layer = (console == ConsoleOutput::Stderr).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
    });

    // NDJSON to `<dir>/receipt-ledger.log.YYYY-MM-DD`
    let file_layer = match log_dir {
        Some(dir) => {
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(LOG_FILE_PREFIX)
                .build(dir)
                .with_context(|| format!("Failed to open log directory: {}", dir.display()))?;
            Some(fmt::layer().json().with_writer(appender).with_ansi(false))
        }
        None => None,
    };

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_writes_file() {
        let dir = tempfile::tempdir().unwrap();

        init_logging("info", Some(dir.path()), ConsoleOutput::Off).unwrap();
        init_logging("debug", None, ConsoleOutput::Stderr).unwrap();
        tracing::info!(test = true, "logging initialized");

        // Rolling appender creates its file eagerly
        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(!files.is_empty());
    }
}
