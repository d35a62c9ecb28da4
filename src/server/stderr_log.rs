//! Server stderr routing
//!
//! Every stderr line is traced; when a server log file is configured the
//! lines are also appended there between session banners.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info, warn};

pub struct StderrLog {
    file: Option<Mutex<File>>,
}

impl StderrLog {
    /// Open `path` for appending; tracing-only when `None` or unopenable
    pub fn open(path: Option<&Path>) -> Self {
        let file = path.and_then(|path| {
            match OpenOptions::new().create(true).append(true).open(path) {
                Ok(mut file) => {
                    let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
                    let _ = writeln!(file, "\n=== SERVER SESSION STARTED: {timestamp} ===");
                    info!("Server stderr will be written to: {}", path.display());
                    Some(Mutex::new(file))
                }
                Err(e) => {
                    warn!(
                        "Failed to open server log file {}: {}. Stderr is traced only.",
                        path.display(),
                        e
                    );
                    None
                }
            }
        });

        Self { file }
    }

    pub fn record(&self, line: &str) {
        if is_failure_line(line) {
            warn!("server stderr: {}", line);
        } else {
            debug!("server stderr: {}", line);
        }

        if let Some(file) = &self.file {
            let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
            if let Ok(mut file) = file.lock() {
                if let Err(e) = writeln!(file, "[{timestamp}] {line}") {
                    warn!("Failed to write server log file: {}", e);
                }
            }
        }
    }
}

impl Drop for StderrLog {
    fn drop(&mut self) {
        if let Some(file) = &self.file {
            let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
            if let Ok(mut file) = file.lock() {
                let _ = writeln!(file, "=== SERVER SESSION ENDED: {timestamp} ===\n");
            }
        }
    }
}

fn is_failure_line(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    lower.contains("error") || lower.contains("fail")
}
