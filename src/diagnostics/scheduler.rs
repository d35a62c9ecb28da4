//! Deciding when to run code checks
//!
//! Two independent debounce queues feed one validator. The document queue
//! validates the most recently touched document. The workspace queue runs a
//! workspace-wide check when the advisor allows it, falls back to the open
//! documents when only per-file checks are allowed, and skips otherwise.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::config::ClientOptions;
use crate::diagnostics::advisor::AdvisorPolicy;
use crate::diagnostics::convert;
use crate::diagnostics::debounce::{DebounceHandler, DebounceQueue};
use crate::diagnostics::store::DiagnosticStore;
use crate::dispatch::DispatchError;
use crate::protocol::requests::{CodeCheckRequest, QuickFix};
use crate::server::ServerSupervisor;

pub const CSHARP_LANGUAGE_ID: &str = "csharp";

/// Code checks against the server
#[async_trait]
pub trait DiagnosticSource: Send + Sync {
    /// Quick fixes for `file`, or the whole workspace when `None`
    async fn code_check(
        &self,
        file: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<Vec<QuickFix>, DispatchError>;
}

#[async_trait]
impl DiagnosticSource for ServerSupervisor {
    async fn code_check(
        &self,
        file: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<Vec<QuickFix>, DispatchError> {
        let request = match file {
            Some(path) => CodeCheckRequest::file(path.display().to_string()),
            None => CodeCheckRequest::workspace(),
        };
        Ok(self.call(&request, cancel).await?.quick_fixes)
    }
}

/// What caused a workspace pass to be requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceTrigger {
    ProjectChanged,
    PackageRestore,
    AnalysisFinished,
    DocumentChanged,
    Requested,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkItem {
    ValidateDocument(Url),
    ValidateWorkspace(WorkspaceTrigger),
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub document_debounce: Duration,
    pub workspace_debounce: Duration,
    /// The server reports analysis completion itself
    pub analyzers_enabled: bool,
    pub suppress_hidden: bool,
}

impl SchedulerConfig {
    pub fn from_options(options: &ClientOptions) -> Self {
        Self {
            document_debounce: options.document_debounce(),
            workspace_debounce: options.workspace_debounce(),
            analyzers_enabled: options.enable_roslyn_analyzers,
            suppress_hidden: options.suppress_hidden_diagnostics,
        }
    }
}

/// Only C# documents on disk are validated
pub fn is_validated_document(uri: &Url, language_id: &str) -> bool {
    language_id == CSHARP_LANGUAGE_ID && uri.scheme() == "file"
}

// ============================================================================
// Validator
// ============================================================================

struct Validator {
    source: Arc<dyn DiagnosticSource>,
    advisor: Arc<AdvisorPolicy>,
    store: Arc<DiagnosticStore>,
    open_documents: Arc<Mutex<BTreeSet<Url>>>,
    suppress_hidden: bool,
    cancel: CancellationToken,
}

impl Validator {
    async fn validate_document(&self, uri: &Url) {
        if !self.advisor.should_validate_files() {
            debug!("Skipping validation of {}: server busy or not running", uri);
            return;
        }
        let Ok(path) = uri.to_file_path() else {
            return;
        };

        match self.source.code_check(Some(&path), &self.cancel).await {
            Ok(quick_fixes) => {
                let diagnostics = convert::document_diagnostics(&quick_fixes, self.suppress_hidden);
                self.store.replace(uri.clone(), diagnostics);
            }
            Err(e) => debug!("Code check for {} failed: {}", uri, e),
        }
    }

    async fn validate_workspace(&self, trigger: WorkspaceTrigger) {
        if self.advisor.should_validate_all() {
            info!("Validating workspace ({:?})", trigger);
            match self.source.code_check(None, &self.cancel).await {
                Ok(quick_fixes) => {
                    let result = convert::group_by_file(&quick_fixes, self.suppress_hidden);
                    self.store.replace_all(result);
                }
                Err(e) => debug!("Workspace code check failed: {}", e),
            }
        } else if self.advisor.should_validate_files() {
            // Intentional .unwrap() - poisoned mutex indicates serious bug
            let open: Vec<Url> = self.open_documents.lock().unwrap().iter().cloned().collect();
            debug!(
                "Workspace too large for analysis; validating {} open documents",
                open.len()
            );
            for uri in open {
                self.validate_document(&uri).await;
            }
        } else {
            debug!("Skipping workspace validation ({:?})", trigger);
        }
    }
}

#[async_trait]
impl DebounceHandler<WorkItem> for Validator {
    async fn handle(&self, item: WorkItem) {
        match item {
            WorkItem::ValidateDocument(uri) => self.validate_document(&uri).await,
            WorkItem::ValidateWorkspace(trigger) => self.validate_workspace(trigger).await,
        }
    }
}

// ============================================================================
// Scheduler
// ============================================================================

pub struct DiagnosticsScheduler {
    config: SchedulerConfig,
    advisor: Arc<AdvisorPolicy>,
    store: Arc<DiagnosticStore>,
    open_documents: Arc<Mutex<BTreeSet<Url>>>,
    documents: DebounceQueue<WorkItem>,
    workspace: DebounceQueue<WorkItem>,
    cancel: CancellationToken,
}

impl DiagnosticsScheduler {
    pub fn new(
        config: SchedulerConfig,
        source: Arc<dyn DiagnosticSource>,
        advisor: Arc<AdvisorPolicy>,
        store: Arc<DiagnosticStore>,
    ) -> Self {
        let open_documents = Arc::new(Mutex::new(BTreeSet::new()));
        let cancel = CancellationToken::new();
        let validator = Arc::new(Validator {
            source,
            advisor: Arc::clone(&advisor),
            store: Arc::clone(&store),
            open_documents: Arc::clone(&open_documents),
            suppress_hidden: config.suppress_hidden,
            cancel: cancel.clone(),
        });

        Self {
            documents: DebounceQueue::new(config.document_debounce, validator.clone()),
            workspace: DebounceQueue::new(config.workspace_debounce, validator),
            config,
            advisor,
            store,
            open_documents,
            cancel,
        }
    }

    pub fn advisor(&self) -> &AdvisorPolicy {
        &self.advisor
    }

    pub fn store(&self) -> &DiagnosticStore {
        &self.store
    }

    pub fn is_open(&self, uri: &Url) -> bool {
        self.open_documents.lock().unwrap().contains(uri)
    }

    /// Track and validate a newly opened document
    ///
    /// Returns false for documents that are not validated.
    pub fn document_opened(&self, uri: &Url, language_id: &str) -> bool {
        if !is_validated_document(uri, language_id) {
            return false;
        }
        self.open_documents.lock().unwrap().insert(uri.clone());
        self.document_touched(uri);
        true
    }

    pub fn document_changed(&self, uri: &Url) {
        if self.is_open(uri) {
            self.document_touched(uri);
        }
    }

    pub fn active_document_changed(&self, uri: &Url) {
        if self.is_open(uri) {
            self.document_touched(uri);
        }
    }

    /// Stop tracking `uri`; its diagnostics stay only in workspace mode
    pub fn document_closed(&self, uri: &Url) {
        self.open_documents.lock().unwrap().remove(uri);
        if self.store.contains(uri) && !self.advisor.should_validate_all() {
            self.store.clear(uri);
        }
    }

    pub fn project_added(&self, project: PathBuf, file_count: usize) {
        self.advisor.set_project_file_count(project, file_count);
        self.request_workspace(WorkspaceTrigger::ProjectChanged);
    }

    pub fn project_changed(&self, project: PathBuf, file_count: usize) {
        self.advisor.set_project_file_count(project, file_count);
        self.request_workspace(WorkspaceTrigger::ProjectChanged);
    }

    pub fn project_removed(&self, project: &Path) {
        self.advisor.remove_project(project);
        self.request_workspace(WorkspaceTrigger::ProjectChanged);
    }

    pub fn restore_begin(&self) {
        self.advisor.restore_begin();
    }

    /// One workspace pass follows the end of a restore
    pub fn restore_end(&self) {
        self.advisor.restore_end();
        self.request_workspace(WorkspaceTrigger::PackageRestore);
    }

    /// Background analysis reported completion
    pub fn analysis_finished(&self) {
        self.request_workspace(WorkspaceTrigger::AnalysisFinished);
    }

    pub fn request_workspace(&self, trigger: WorkspaceTrigger) {
        self.workspace.submit(WorkItem::ValidateWorkspace(trigger));
    }

    /// A new server connection starts from a clean advisor
    pub fn connection_reset(&self) {
        self.advisor.reset();
    }

    /// Run pending validations now and wait for them
    pub async fn flush(&self) {
        self.documents.flush().await;
        self.workspace.flush().await;
    }

    /// Drop pending work and abort in-flight checks
    pub fn shutdown(&self) {
        self.documents.cancel();
        self.workspace.cancel();
        self.cancel.cancel();
    }

    fn document_touched(&self, uri: &Url) {
        self.documents.submit(WorkItem::ValidateDocument(uri.clone()));
        if !self.config.analyzers_enabled {
            self.request_workspace(WorkspaceTrigger::DocumentChanged);
        }
    }
}

impl Drop for DiagnosticsScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
