use std::env;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FILE_ENV: &str = "OMNISHARP_CLIENT_LOG_FILE";
pub const LOG_UNIQUE_ENV: &str = "OMNISHARP_CLIENT_LOG_UNIQUE";
pub const LOG_JSON_ENV: &str = "OMNISHARP_CLIENT_LOG_JSON";

/// Configuration for the logging system
#[derive(Debug, Clone, PartialEq)]
pub struct LogConfig {
    /// Filter directive (e.g. "debug", "omnisharp_client::dispatch=trace")
    pub level: String,
    /// Log file; stderr when `None`
    pub file_path: Option<PathBuf>,
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            json_format: false,
        }
    }
}

impl LogConfig {
    /// Read `RUST_LOG` and the `OMNISHARP_CLIENT_LOG_*` variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let level = lookup("RUST_LOG").unwrap_or_else(|| "info".to_string());
        let unique = lookup(LOG_UNIQUE_ENV).as_deref() == Some("true");

        let file_path = lookup(LOG_FILE_ENV).map(PathBuf::from).map(|path| {
            if unique {
                with_pid_suffix(&path, std::process::id())
            } else {
                path
            }
        });

        Self {
            level,
            file_path,
            json_format: lookup(LOG_JSON_ENV).as_deref() == Some("true"),
        }
    }

    /// Command-line values win over the environment
    pub fn with_overrides(mut self, level: Option<String>, file_path: Option<PathBuf>) -> Self {
        if let Some(level) = level {
            self.level = level;
        }
        if let Some(file_path) = file_path {
            self.file_path = Some(file_path);
        }
        self
    }
}

/// `client.log` -> `client.<pid>.log`
fn with_pid_suffix(path: &Path, pid: u32) -> PathBuf {
    let Some(stem) = path.file_stem() else {
        return path.to_path_buf();
    };

    let name = match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) => format!("{}.{}.{}", stem.to_string_lossy(), pid, ext),
        None => format!("{}.{}", stem.to_string_lossy(), pid),
    };
    path.with_file_name(name)
}

/// Install the global subscriber
pub fn init_logging(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_new(&config.level).or_else(|_| EnvFilter::try_new("info"))?;
    let subscriber = tracing_subscriber::registry().with(env_filter);

    match (&config.file_path, config.json_format) {
        (Some(file_path), true) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;
            subscriber
                .with(fmt::layer().json().with_writer(file).with_ansi(false))
                .init();
        }
        (Some(file_path), false) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;
            subscriber
                .with(
                    fmt::layer()
                        .with_writer(file)
                        .with_ansi(false)
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_line_number(true),
                )
                .init();
        }
        (None, true) => {
            subscriber
                .with(fmt::layer().json().with_writer(io::stderr).with_ansi(false))
                .init();
        }
        (None, false) => {
            subscriber
                .with(
                    fmt::layer()
                        .with_writer(io::stderr)
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_line_number(true),
                )
                .init();
        }
    }

    Ok(())
}

/// One structured event per protocol message
///
/// `direction` is "send" or "recv"; `command` is the endpoint or event name.
#[macro_export]
macro_rules! log_server_message {
    ($level:expr, $direction:expr, $command:expr, $data:expr) => {
        tracing::event!(
            $level,
            direction = $direction,
            command = $command,
            data = ?$data,
            pid = std::process::id(),
            "Server message"
        );
    };
}

#[macro_export]
macro_rules! log_timing {
    ($level:expr, $operation:expr, $duration:expr) => {
        tracing::event!(
            $level,
            operation = $operation,
            duration_ms = $duration.as_millis(),
            pid = std::process::id(),
            "Performance timing"
        );
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_environment() {
        assert_eq!(LogConfig::from_lookup(lookup(&[])), LogConfig::default());
    }

    #[test]
    fn test_environment_values() {
        let config = LogConfig::from_lookup(lookup(&[
            ("RUST_LOG", "debug"),
            (LOG_FILE_ENV, "/tmp/client.log"),
            (LOG_JSON_ENV, "true"),
        ]));

        assert_eq!(config.level, "debug");
        assert_eq!(config.file_path, Some(PathBuf::from("/tmp/client.log")));
        assert!(config.json_format);
    }

    #[test]
    fn test_unique_file_name() {
        let config = LogConfig::from_lookup(lookup(&[
            (LOG_FILE_ENV, "/tmp/client.log"),
            (LOG_UNIQUE_ENV, "true"),
        ]));
        let expected = format!("/tmp/client.{}.log", std::process::id());
        assert_eq!(config.file_path, Some(PathBuf::from(expected)));

        assert_eq!(
            with_pid_suffix(Path::new("/var/log/client"), 42),
            PathBuf::from("/var/log/client.42")
        );
    }

    #[test]
    fn test_overrides_take_precedence() {
        let config = LogConfig::from_lookup(lookup(&[("RUST_LOG", "warn")]))
            .with_overrides(Some("trace".into()), Some(PathBuf::from("/tmp/x.log")));
        assert_eq!(config.level, "trace");
        assert_eq!(config.file_path, Some(PathBuf::from("/tmp/x.log")));

        let untouched = LogConfig::default().with_overrides(None, None);
        assert_eq!(untouched, LogConfig::default());
    }
}
