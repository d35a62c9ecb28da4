//! Whether validation should run right now
//!
//! Pure state inspection: server readiness, package restores in flight and
//! the size of the loaded workspace.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::server::ServerSupervisor;

/// Readiness of the server behind the advisor
pub trait ServerReadiness: Send + Sync {
    fn is_running(&self) -> bool;
}

impl ServerReadiness for ServerSupervisor {
    fn is_running(&self) -> bool {
        ServerSupervisor::is_running(self)
    }
}

#[derive(Debug, Default)]
struct AdvisorState {
    /// +1 per restore start, -1 per restore end
    restore_count: i64,
    project_file_counts: HashMap<PathBuf, usize>,
}

pub struct AdvisorPolicy {
    server: Arc<dyn ServerReadiness>,
    /// Workspace-wide analysis ceiling; `<= 0` disables the check
    max_file_count: i64,
    state: Mutex<AdvisorState>,
}

impl AdvisorPolicy {
    pub fn new(server: Arc<dyn ServerReadiness>, max_file_count: i64) -> Self {
        Self {
            server,
            max_file_count,
            state: Mutex::new(AdvisorState::default()),
        }
    }

    /// Single documents may be validated
    pub fn should_validate_files(&self) -> bool {
        self.server.is_running() && !self.is_restoring_packages()
    }

    /// The whole workspace may be validated
    pub fn should_validate_all(&self) -> bool {
        self.should_validate_files() && !self.is_over_file_limit()
    }

    pub fn is_restoring_packages(&self) -> bool {
        // Intentional .unwrap() - poisoned mutex indicates serious bug
        self.state.lock().unwrap().restore_count > 0
    }

    pub fn is_over_file_limit(&self) -> bool {
        if self.max_file_count <= 0 {
            return false;
        }
        self.total_file_count() as i64 > self.max_file_count
    }

    pub fn total_file_count(&self) -> usize {
        self.state.lock().unwrap().project_file_counts.values().sum()
    }

    /// Record the source-file count of an added or changed project
    pub fn set_project_file_count(&self, project: PathBuf, files: usize) {
        debug!("Advisor: {} has {} source files", project.display(), files);
        self.state
            .lock()
            .unwrap()
            .project_file_counts
            .insert(project, files);
    }

    pub fn remove_project(&self, project: &Path) {
        self.state.lock().unwrap().project_file_counts.remove(project);
    }

    pub fn restore_begin(&self) {
        let mut state = self.state.lock().unwrap();
        state.restore_count += 1;
        debug!("Advisor: package restore started ({} in flight)", state.restore_count);
    }

    pub fn restore_end(&self) {
        let mut state = self.state.lock().unwrap();
        state.restore_count -= 1;
        debug!("Advisor: package restore finished ({} in flight)", state.restore_count);
    }

    /// Forget everything learned from the previous connection
    pub fn reset(&self) {
        *self.state.lock().unwrap() = AdvisorState::default();
    }
}

impl std::fmt::Debug for AdvisorPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("AdvisorPolicy")
            .field("max_file_count", &self.max_file_count)
            .field("restore_count", &state.restore_count)
            .field("projects", &state.project_file_counts.len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::ServerReadiness;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Readiness flag flipped by tests
    #[derive(Debug, Default)]
    pub struct Readiness(AtomicBool);

    impl Readiness {
        pub fn running() -> Self {
            Self(AtomicBool::new(true))
        }

        pub fn set(&self, running: bool) {
            self.0.store(running, Ordering::SeqCst);
        }
    }

    impl ServerReadiness for Readiness {
        fn is_running(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::Readiness;
    use super::*;

    fn advisor(limit: i64) -> (Arc<Readiness>, AdvisorPolicy) {
        let readiness = Arc::new(Readiness::running());
        let policy = AdvisorPolicy::new(readiness.clone(), limit);
        (readiness, policy)
    }

    #[test]
    fn test_requires_running_server() {
        let (readiness, policy) = advisor(1000);
        assert!(policy.should_validate_files());
        assert!(policy.should_validate_all());

        readiness.set(false);
        assert!(!policy.should_validate_files());
        assert!(!policy.should_validate_all());
    }

    #[test]
    fn test_restore_blocks_until_balanced() {
        let (_, policy) = advisor(1000);
        policy.restore_begin();
        policy.restore_begin();
        assert!(!policy.should_validate_files());

        policy.restore_end();
        assert!(!policy.should_validate_files());
        policy.restore_end();
        assert!(policy.should_validate_files());
    }

    #[test]
    fn test_negative_counter_does_not_block() {
        let (_, policy) = advisor(1000);
        policy.restore_end();
        assert!(policy.should_validate_files());
    }

    #[test]
    fn test_workspace_size_fallback() {
        let (_, policy) = advisor(100);
        policy.set_project_file_count(PathBuf::from("/w/App.csproj"), 100);
        policy.set_project_file_count(PathBuf::from("/w/Lib.csproj"), 50);

        assert_eq!(policy.total_file_count(), 150);
        assert!(policy.should_validate_files());
        assert!(!policy.should_validate_all());

        policy.set_project_file_count(PathBuf::from("/w/App.csproj"), 0);
        assert_eq!(policy.total_file_count(), 50);
        assert!(policy.should_validate_all());

        policy.remove_project(Path::new("/w/Lib.csproj"));
        assert_eq!(policy.total_file_count(), 0);
    }

    #[test]
    fn test_non_positive_limit_disables_ceiling() {
        for limit in [0, -1] {
            let (_, policy) = advisor(limit);
            policy.set_project_file_count(PathBuf::from("/w/Huge.csproj"), 1_000_000);
            assert!(policy.should_validate_all());
        }
    }

    #[test]
    fn test_reset_clears_counters() {
        let (_, policy) = advisor(10);
        policy.restore_begin();
        policy.set_project_file_count(PathBuf::from("/w/App.csproj"), 20);

        policy.reset();
        assert!(policy.should_validate_all());
        assert_eq!(policy.total_file_count(), 0);
    }
}
