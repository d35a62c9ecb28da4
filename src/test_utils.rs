//! Test utilities and global setup

/// Test logging utilities
#[cfg(all(test, feature = "test-logging"))]
pub mod logging {
    use std::sync::Once;
    use tracing_subscriber::{EnvFilter, fmt};

    static INIT: Once = Once::new();

    /// Initialize test logging once per test binary
    ///
    /// ```bash
    /// RUST_LOG=omnisharp_client::dispatch=trace cargo test --features test-logging
    /// ```
    pub fn init() {
        INIT.call_once(|| {
            let env_filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("debug,tokio=info"));

            fmt()
                .with_env_filter(env_filter)
                .with_test_writer()
                .with_target(true)
                .with_thread_ids(true)
                .compact()
                .try_init()
                .ok();
        });
    }
}

/// Install test logging for every test in the invoking module
#[cfg(all(test, feature = "test-logging"))]
#[macro_export]
macro_rules! setup_test_logging {
    () => {
        #[ctor::ctor]
        fn init_test_logging() {
            $crate::test_utils::logging::init();
        }
    };
}

/// Scripted fake servers for lifecycle tests
#[cfg(test)]
pub mod fake_server {
    use crate::server::launch::LaunchTarget;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    /// `started` event line as the server prints it
    pub const STARTED_EVENT: &str = r#"{"Type":"event","Event":"started","Body":null}"#;

    /// A shell script standing in for the server executable
    ///
    /// Run through `sh <script>` rather than executed directly, so a
    /// freshly written file never hits ETXTBSY.
    pub struct FakeServer {
        dir: TempDir,
        pub script: PathBuf,
    }

    impl FakeServer {
        pub fn new(body: &str) -> Self {
            let dir = TempDir::new().unwrap();
            let script = dir.path().join("run.sh");
            std::fs::write(&script, format!("{body}\n")).unwrap();
            Self { dir, script }
        }

        /// Launch command for this script, working in its temp directory
        pub fn target(&self) -> LaunchTarget {
            LaunchTarget {
                program: PathBuf::from("sh"),
                args: vec![self.script.display().to_string()],
                working_dir: self.dir.path().to_path_buf(),
            }
        }

        pub fn dir(&self) -> &Path {
            self.dir.path()
        }

        /// Announces readiness, then answers every request line with an
        /// empty successful response until stdin closes
        pub fn echoing() -> Self {
            Self::new(&format!(
                r#"echo '{STARTED_EVENT}'
while IFS= read -r line; do
  seq=$(printf '%s' "$line" | sed -n 's/.*"Seq":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"Type":"request"'*) printf '{{"Type":"response","Request_seq":%s,"Command":"","Success":true,"Body":{{}}}}\n' "$seq" ;;
  esac
done"#
            ))
        }

        /// Announces readiness and stays silent
        pub fn idle() -> Self {
            Self::new(&format!("echo '{STARTED_EVENT}'\nexec sleep 30"))
        }

        /// Never announces readiness
        pub fn mute() -> Self {
            Self::new("exec sleep 30")
        }
    }
}
