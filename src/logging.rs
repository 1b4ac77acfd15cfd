use anyhow::{Context, Result};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

/// Keeps the non-blocking file writer alive; pending lines are flushed on drop.
pub struct LoggingGuard {
    _file: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Log to stderr, plus a daily-rotated file when `app.log_file` is set.
///
/// `--debug` forces the `debug` level; otherwise `RUST_LOG` wins over `app.log_level`.
pub fn init(config: &Config, debug: bool) -> Result<LoggingGuard> {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.app.log_level))
    };

    let (file_layer, guard) = match config.log_path() {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| config.app.data_dir.clone());
            let file_name = path
                .file_name()
                .context("app.log_file must name a file")?
                .to_os_string();
            std::fs::create_dir_all(&dir).with_context(|| format!("creating log directory {}", dir.display()))?;

            let appender = RollingFileAppender::new(Rotation::DAILY, &dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_line_number(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .context("initializing tracing subscriber")?;

    if let Some(path) = config.log_path() {
        tracing::debug!(log_file = %path.display(), "file logging enabled");
    }

    Ok(LoggingGuard { _file: guard })
}
