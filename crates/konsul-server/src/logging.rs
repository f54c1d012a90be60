//! File-based logging with daily rotation: a `RollingFileAppender` plus
//! `tracing_appender::non_blocking`, with an `EnvFilter` layered under a
//! `tracing_subscriber::Registry`. Konsul has no standalone log-dir setting
//! of its own (see spec §6's configuration table), so the log directory is
//! derived from `data_dir/logs` by default, overridable with `KONSUL_LOG_DIR`.

use std::path::PathBuf;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt};

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_dir: PathBuf,
    pub console_output: bool,
    pub console_level: Level,
    pub file_logging: bool,
    pub file_level: Level,
}

impl LoggingConfig {
    /// Derives logging config from the resolved application config and the
    /// `KONSUL_LOG_DIR`/`KONSUL_LOG_LEVEL` env overrides.
    pub fn from_app_config(data_dir: &str) -> Self {
        let log_dir = std::env::var("KONSUL_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(data_dir).join("logs"));

        let level = std::env::var("KONSUL_LOG_LEVEL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(Level::INFO);

        Self {
            log_dir,
            console_output: true,
            console_level: level,
            file_logging: true,
            file_level: level,
        }
    }
}

/// Keeps the non-blocking file writer alive; drop it only at process exit.
pub struct LoggingGuard {
    _guards: Vec<WorkerGuard>,
}

/// Initializes the global `tracing` subscriber: console plus a daily
/// rotating `konsul.log`, filtered by `RUST_LOG` if set, falling back to
/// `config.console_level`.
pub fn init(config: &LoggingConfig) -> anyhow::Result<LoggingGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.console_level.to_string()));

    let mut guards = Vec::new();

    if config.file_logging {
        std::fs::create_dir_all(&config.log_dir)?;
        let appender = RollingFileAppender::new(Rotation::DAILY, &config.log_dir, "konsul.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        guards.push(guard);

        let file_layer = fmt::layer()
            .with_writer(non_blocking)
            .with_target(true)
            .with_thread_names(true)
            .with_ansi(false);

        if config.console_output {
            let console_layer = fmt::layer().with_target(true).with_thread_names(true);
            Registry::default().with(env_filter).with(console_layer).with(file_layer).try_init()?;
        } else {
            Registry::default().with(env_filter).with(file_layer).try_init()?;
        }
    } else {
        let console_layer = fmt::layer().with_target(true).with_thread_names(true);
        Registry::default().with(env_filter).with(console_layer).try_init()?;
    }

    Ok(LoggingGuard { _guards: guards })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_log_dir_under_data_dir_by_default() {
        unsafe {
            std::env::remove_var("KONSUL_LOG_DIR");
        }
        let cfg = LoggingConfig::from_app_config("./data");
        assert_eq!(cfg.log_dir, PathBuf::from("./data").join("logs"));
        assert!(cfg.file_logging);
        assert!(cfg.console_output);
    }
}
