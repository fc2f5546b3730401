use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// Where the process-wide log stream ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSink {
    Stderr,
    File(PathBuf),
}

/// Install the single subscriber for this process.
///
/// `RUST_LOG` wins over the configured level. If the log file cannot be
/// opened the stream stays on stderr.
pub fn init(config: &Config) -> LogSink {
    let (filter, bad_level) = filter_for(&config.log_level);

    let mut open_error = None;
    let sink = match &config.log_path {
        Some(path) => match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .try_init();
                LogSink::File(path.clone())
            }
            Err(e) => {
                open_error = Some(e);
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(std::io::stderr)
                    .try_init();
                LogSink::Stderr
            }
        },
        None => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init();
            LogSink::Stderr
        }
    };

    if let Some(e) = open_error {
        tracing::warn!(error = %e, "failed to open log file, logging to stderr");
    }
    if bad_level {
        tracing::warn!(level = %config.log_level, "unknown log level, using info");
    }

    sink
}

/// Filter from `RUST_LOG`, else from `level`; the flag is set when `level` was unusable
fn filter_for(level: &str) -> (EnvFilter, bool) {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return (filter, false);
    }
    match EnvFilter::try_new(level) {
        Ok(filter) => (filter, false),
        Err(_) => (EnvFilter::new("info"), true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_for_levels() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        assert!(!filter_for("debug").1);
        assert!(!filter_for("sheetsync=trace,warn").1);
        assert!(filter_for("sheetsync=loud").1);
    }
}
