//! Client session
//!
//! Wires provisioning, the server supervisor, buffer synchronization and
//! the diagnostics scheduler together. Editor notifications come in through
//! the `document_*` methods; server events are routed by a pump task that
//! lives from the first launch until [`ClientSession::shutdown`].

use lsp_types::Diagnostic;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::config::{ClientOptions, ConfigError};
use crate::diagnostics::scheduler::is_validated_document;
use crate::diagnostics::{
    AdvisorPolicy, DiagnosticStore, DiagnosticUpdate, DiagnosticsScheduler, SchedulerConfig,
    WorkspaceTrigger,
};
use crate::dispatch::Subscription;
use crate::install::{InstallError, Provisioned, Provisioner};
use crate::protocol::requests::{
    FileCloseRequest, FileOpenRequest, ServerRequest, UpdateBufferRequest,
};
use crate::protocol::{
    BackgroundDiagnosticStatus, EventKind, LogMessage, ProjectInformation, ServerEvent,
    UnresolvedDependencies,
};
use crate::server::{LaunchTarget, ServerError, ServerState, ServerSupervisor, SupervisorConfig};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Install error: {0}")]
    Install(#[from] InstallError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

/// Events the session reacts to
const ROUTED_EVENTS: [EventKind; 9] = [
    EventKind::ProjectAdded,
    EventKind::ProjectChanged,
    EventKind::ProjectRemoved,
    EventKind::PackageRestoreStarted,
    EventKind::PackageRestoreFinished,
    EventKind::BackgroundDiagnosticStatus,
    EventKind::UnresolvedDependencies,
    EventKind::Log,
    EventKind::Error,
];

pub struct ClientSession {
    options: ClientOptions,
    supervisor: ServerSupervisor,
    scheduler: Arc<DiagnosticsScheduler>,
    /// Last full text the editor sent per tracked document
    buffers: Mutex<HashMap<Url, String>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl ClientSession {
    /// Build a session; published diagnostic changes arrive on the receiver
    pub fn new(options: ClientOptions) -> (Self, mpsc::UnboundedReceiver<DiagnosticUpdate>) {
        let supervisor = ServerSupervisor::new(SupervisorConfig::from_options(&options));
        let (store, updates) = DiagnosticStore::new();
        let advisor = Arc::new(AdvisorPolicy::new(
            Arc::new(supervisor.clone()),
            options.max_project_file_count_for_diagnostic_analysis,
        ));
        let scheduler = Arc::new(DiagnosticsScheduler::new(
            SchedulerConfig::from_options(&options),
            Arc::new(supervisor.clone()),
            advisor,
            Arc::new(store),
        ));

        let session = Self {
            options,
            supervisor,
            scheduler,
            buffers: Mutex::new(HashMap::new()),
            pump: Mutex::new(None),
            cancel: CancellationToken::new(),
        };
        (session, updates)
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn supervisor(&self) -> &ServerSupervisor {
        &self.supervisor
    }

    pub fn scheduler(&self) -> &DiagnosticsScheduler {
        &self.scheduler
    }

    /// Provision the configured server and launch it for `workspace`
    ///
    /// Returns once the process is spawned; readiness is observable through
    /// the supervisor.
    pub async fn start(&self, workspace: &Path) -> Result<Provisioned, SessionError> {
        let provisioner = Provisioner::from_options(&self.options);
        let provisioned = provisioner.provision(&self.options.path, false).await?;

        let target =
            LaunchTarget::for_workspace(&provisioned.server.launch, workspace, &self.options)?;
        self.launch(target).await?;

        Ok(provisioned)
    }

    /// Launch an already resolved command line
    pub async fn launch(&self, target: LaunchTarget) -> Result<u32, SessionError> {
        self.ensure_pump();
        let pid = self.supervisor.start(target).await?;
        info!("Session: server launched with pid {}", pid);
        Ok(pid)
    }

    /// Restart with the previous command line
    pub async fn restart(&self) -> Result<u32, SessionError> {
        self.ensure_pump();
        Ok(self.supervisor.restart(None).await?)
    }

    // ========================================================================
    // Editor notifications
    // ========================================================================

    /// Register an opened document; returns false when it is not tracked
    pub async fn document_opened(&self, uri: &Url, language_id: &str, text: String) -> bool {
        if !is_validated_document(uri, language_id) {
            return false;
        }
        let Some(file_name) = file_name_of(uri) else {
            return false;
        };

        // Intentional .unwrap() - poisoned mutex indicates serious bug
        self.buffers.lock().unwrap().insert(uri.clone(), text);
        self.sync(&FileOpenRequest { file_name }).await;
        self.scheduler.document_opened(uri, language_id)
    }

    /// Push the full new text of a tracked document
    pub async fn document_changed(&self, uri: &Url, text: String) {
        let Some(file_name) = self.tracked_file_name(uri) else {
            return;
        };

        self.buffers
            .lock()
            .unwrap()
            .insert(uri.clone(), text.clone());
        self.sync(&UpdateBufferRequest {
            file_name,
            buffer: text,
            from_disk: false,
        })
        .await;
        self.scheduler.document_changed(uri);
    }

    /// Re-send the editor's text when the user switches to `uri`
    pub async fn active_document_changed(&self, uri: &Url) {
        let Some(file_name) = self.tracked_file_name(uri) else {
            return;
        };
        let Some(buffer) = self.buffers.lock().unwrap().get(uri).cloned() else {
            return;
        };

        self.sync(&UpdateBufferRequest {
            file_name,
            buffer,
            from_disk: false,
        })
        .await;
        self.scheduler.active_document_changed(uri);
    }

    pub async fn document_closed(&self, uri: &Url) {
        let tracked = self.buffers.lock().unwrap().remove(uri).is_some();
        if tracked && let Some(file_name) = file_name_of(uri) {
            self.sync(&FileCloseRequest { file_name }).await;
        }
        self.scheduler.document_closed(uri);
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    /// Queue a workspace pass on explicit request
    pub fn validate_workspace(&self) {
        self.scheduler.request_workspace(WorkspaceTrigger::Requested);
    }

    /// Run pending validations now and wait for them
    pub async fn flush(&self) {
        self.scheduler.flush().await;
    }

    pub fn diagnostics(&self) -> HashMap<Url, Vec<Diagnostic>> {
        self.scheduler.store().snapshot()
    }

    /// Stop routing, drop pending validations and stop the server
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.cancel.cancel();
        self.scheduler.shutdown();

        let pump = self.pump.lock().unwrap().take();
        if let Some(pump) = pump
            && let Err(e) = pump.await
        {
            warn!("Session: event pump ended abnormally: {}", e);
        }

        self.supervisor.stop().await?;
        info!("Session: shut down");
        Ok(())
    }

    fn tracked_file_name(&self, uri: &Url) -> Option<String> {
        if !self.buffers.lock().unwrap().contains_key(uri) {
            return None;
        }
        file_name_of(uri)
    }

    /// Buffer synchronization is best effort
    async fn sync<Q: ServerRequest>(&self, request: &Q) {
        if let Err(e) = self.supervisor.call(request, &self.cancel).await {
            debug!("Session: {} failed: {}", Q::COMMAND, e);
        }
    }

    fn ensure_pump(&self) {
        let mut pump = self.pump.lock().unwrap();
        if pump.is_some() || self.cancel.is_cancelled() {
            return;
        }

        let router = EventRouter {
            supervisor: self.supervisor.clone(),
            scheduler: Arc::clone(&self.scheduler),
            connection: self.supervisor.generation(),
        };
        *pump = Some(tokio::spawn(router.run(
            self.supervisor.events().subscribe_all(ROUTED_EVENTS),
            self.supervisor.subscribe_state(),
            self.cancel.clone(),
        )));
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("state", &self.supervisor.state())
            .field("open_buffers", &self.buffers.lock().unwrap().len())
            .finish()
    }
}

fn file_name_of(uri: &Url) -> Option<String> {
    match uri.to_file_path() {
        Ok(path) => Some(path.display().to_string()),
        Err(()) => {
            debug!("Session: ignoring non-file document {}", uri);
            None
        }
    }
}

// ============================================================================
// Event routing
// ============================================================================

/// Feeds server events into the scheduler
struct EventRouter {
    supervisor: ServerSupervisor,
    scheduler: Arc<DiagnosticsScheduler>,
    /// Generation whose advisor state is current
    connection: u64,
}

impl EventRouter {
    async fn run(
        mut self,
        mut events: Subscription,
        mut states: watch::Receiver<ServerState>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *states.borrow_and_update();
                    self.state_changed(state);
                }
                event = events.recv() => match event {
                    Some(event) => self.route(event),
                    None => break,
                },
            }
        }
        debug!("Session: event pump stopped");
    }

    /// A new connection starts from a clean advisor
    fn state_changed(&mut self, state: ServerState) {
        let generation = self.supervisor.generation();
        if generation != self.connection && state.has_connection() {
            debug!(
                "Session: connection {} ({}); resetting advisor",
                generation, state
            );
            self.connection = generation;
            self.scheduler.connection_reset();
        }
    }

    fn route(&self, event: ServerEvent) {
        let current = self.supervisor.generation();
        if event.connection != 0 && event.connection != current {
            debug!(
                "Session: dropping {} from connection {} (current {})",
                event.kind, event.connection, current
            );
            return;
        }

        trace!("Session: routing {}", event.kind);
        match event.kind {
            EventKind::ProjectAdded | EventKind::ProjectChanged => {
                let Some((project, files)) = project_of(&event) else {
                    return;
                };
                if event.kind == EventKind::ProjectAdded {
                    self.scheduler.project_added(project, files);
                } else {
                    self.scheduler.project_changed(project, files);
                }
            }
            EventKind::ProjectRemoved => {
                let info = event.body_as::<ProjectInformation>().unwrap_or_default();
                if let Some(project) = info.ms_build_project {
                    self.scheduler.project_removed(&project.path);
                }
            }
            EventKind::PackageRestoreStarted => self.scheduler.restore_begin(),
            EventKind::PackageRestoreFinished => self.scheduler.restore_end(),
            EventKind::BackgroundDiagnosticStatus => {
                match event.body_as::<BackgroundDiagnosticStatus>() {
                    Ok(status) if status.is_finished() => self.scheduler.analysis_finished(),
                    Ok(_) => {}
                    Err(e) => debug!("Session: malformed analysis status: {}", e),
                }
            }
            EventKind::UnresolvedDependencies => {
                let body = event.body_as::<UnresolvedDependencies>().unwrap_or_default();
                warn!(
                    "Unresolved dependencies in {} ({}); run a package restore",
                    body.file_name,
                    body.unresolved_dependencies.len()
                );
            }
            EventKind::Log => {
                let log = event.body_as::<LogMessage>().unwrap_or_default();
                debug!("[server] {} {}: {}", log.log_level, log.name, log.message);
            }
            EventKind::Error => error!("Server error event: {}", event.body),
            _ => {}
        }
    }
}

fn project_of(event: &ServerEvent) -> Option<(std::path::PathBuf, usize)> {
    match event.body_as::<ProjectInformation>() {
        Ok(info) => info.file_count(),
        Err(e) => {
            debug!("Session: malformed {} body: {}", event.kind, e);
            None
        }
    }
}
