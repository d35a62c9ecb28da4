//! Server process supervision
//!
//! [`ServerSupervisor`] owns at most one running server at a time. Each
//! spawn gets a new generation number; exit notifications and readiness
//! signals from an older generation are ignored, so a restart can never be
//! confused by the previous process dying late.

use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ClientOptions;
use crate::dispatch::{ConnectionStatus, DispatchError, EventBus, RequestDispatcher};
use crate::io::{
    ProcessError, ProcessExitEvent, ProcessExitHandler, ServerProcess, StderrMonitor, StopMode,
};
use crate::protocol::requests::ServerRequest;
use crate::server::error::ServerError;
use crate::server::launch::LaunchTarget;
use crate::server::state::ServerState;
use crate::server::stderr_log::StderrLog;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Time allowed between spawn and the server signalling readiness
    pub startup_timeout: Duration,
    /// Grace period between SIGTERM and SIGKILL
    pub shutdown_timeout: Duration,
    pub request_timeout: Option<Duration>,
    pub server_log_file: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::from_options(&ClientOptions::default())
    }
}

impl SupervisorConfig {
    pub fn from_options(options: &ClientOptions) -> Self {
        Self {
            startup_timeout: options.startup_timeout(),
            shutdown_timeout: options.shutdown_timeout(),
            request_timeout: options.request_timeout(),
            server_log_file: options.server_log_file.clone(),
        }
    }
}

// ============================================================================
// Internal state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CrashCause {
    /// Process gone; the code arrives with the exit notification
    Exited { code: Option<i32> },
    StartupTimeout,
    /// Connection closed after readiness while the process lingered
    ConnectionLost,
}

/// One running server instance
struct ServerHandle {
    generation: u64,
    pid: u32,
    process: ServerProcess,
    dispatcher: Arc<RequestDispatcher>,
    target: LaunchTarget,
    watcher: JoinHandle<()>,
}

struct Inner {
    config: SupervisorConfig,
    state: watch::Sender<ServerState>,
    events: EventBus,
    /// Serializes start/stop/restart
    lifecycle: tokio::sync::Mutex<()>,
    handle: Mutex<Option<ServerHandle>>,
    last_target: Mutex<Option<LaunchTarget>>,
    generation: AtomicU64,
    crash_cause: Mutex<Option<CrashCause>>,
}

impl Inner {
    fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Apply `next` if the lifecycle allows it
    fn transition(&self, next: ServerState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            if !state.can_transition_to(next) {
                debug!("Supervisor: refusing transition {} -> {}", state, next);
                return false;
            }
            info!("Server state: {} -> {}", state, next);
            *state = next;
            true
        })
    }

    /// Bumped before `Starting` is published, so state watchers always see
    /// the generation of the connection being started
    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn mark_ready(&self, generation: u64) {
        if !self.is_current(generation) {
            return;
        }
        if self.state() == ServerState::Starting {
            self.transition(ServerState::Started);
        }
    }

    /// Move a live connection of `generation` to `Crashed`
    fn mark_crashed(&self, generation: u64, cause: CrashCause) {
        if !self.is_current(generation) {
            return;
        }

        let crashed = self.state.send_if_modified(|state| {
            if !state.has_connection() {
                return false;
            }
            // Intentional .unwrap() - poisoned mutex indicates serious bug
            *self.crash_cause.lock().unwrap() = Some(cause);
            warn!("Server state: {} -> crashed ({:?})", state, cause);
            *state = ServerState::Crashed;
            true
        });

        if crashed {
            if let Some(handle) = self.handle.lock().unwrap().as_ref() {
                if handle.generation == generation {
                    handle.dispatcher.close(DispatchError::ServerDisconnected);
                }
            }
        }
    }

    fn record_exit(&self, generation: u64, code: Option<i32>) {
        if !self.is_current(generation) {
            return;
        }

        // a crash seen first through the closed stdout gets its exit code here
        if self.state() == ServerState::Crashed {
            let mut cause = self.crash_cause.lock().unwrap();
            if let Some(CrashCause::Exited { code: known }) = cause.as_mut() {
                if known.is_none() {
                    *known = code;
                }
            }
        }

        self.mark_crashed(generation, CrashCause::Exited { code });
    }

    fn startup_timed_out(&self, generation: u64) {
        if !self.is_current(generation) || self.state() != ServerState::Starting {
            return;
        }

        error!(
            "Server did not become ready within {:?}",
            self.config.startup_timeout
        );
        self.mark_crashed(generation, CrashCause::StartupTimeout);

        if let Some(handle) = self.handle.lock().unwrap().as_mut() {
            if handle.generation == generation {
                handle.process.kill_sync();
            }
        }
    }

    fn crash_error(&self) -> ServerError {
        match *self.crash_cause.lock().unwrap() {
            Some(CrashCause::Exited { code }) => ServerError::ExitedBeforeReady { code },
            Some(CrashCause::StartupTimeout) => {
                ServerError::StartupTimeout(self.config.startup_timeout)
            }
            Some(CrashCause::ConnectionLost) | None => ServerError::ConnectionLost,
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(handle) = self.handle.get_mut() {
            if let Some(handle) = handle.as_mut() {
                handle.watcher.abort();
                handle.process.kill_sync();
            }
        }
    }
}

/// Forwards process exits of one generation to the supervisor
struct ExitWatcher {
    inner: Weak<Inner>,
    generation: u64,
}

#[async_trait]
impl ProcessExitHandler for ExitWatcher {
    async fn on_process_exit(&self, event: ProcessExitEvent) {
        if let Some(inner) = self.inner.upgrade() {
            inner.record_exit(self.generation, event.code);
        }
    }
}

async fn settled(status: &mut watch::Receiver<ConnectionStatus>) -> ConnectionStatus {
    match status
        .wait_for(|s| *s != ConnectionStatus::Handshaking)
        .await
    {
        Ok(status) => *status,
        Err(_) => ConnectionStatus::Closed,
    }
}

/// Drive one connection through readiness, startup timeout and loss
async fn watch_connection(
    inner: Weak<Inner>,
    generation: u64,
    mut status: watch::Receiver<ConnectionStatus>,
    startup_timeout: Duration,
) {
    let first = tokio::time::timeout(startup_timeout, settled(&mut status)).await;

    match first {
        Err(_) => {
            if let Some(inner) = inner.upgrade() {
                inner.startup_timed_out(generation);
            }
            return;
        }
        Ok(ConnectionStatus::Closed) => {
            if let Some(inner) = inner.upgrade() {
                inner.mark_crashed(generation, CrashCause::Exited { code: None });
            }
            return;
        }
        Ok(_) => {
            if let Some(inner) = inner.upgrade() {
                inner.mark_ready(generation);
            }
        }
    }

    let _ = status.wait_for(|s| *s == ConnectionStatus::Closed).await;
    if let Some(inner) = inner.upgrade() {
        inner.mark_crashed(generation, CrashCause::ConnectionLost);
    }
}

// ============================================================================
// Supervisor
// ============================================================================

/// Lifecycle owner for the analysis server; clones share one server
#[derive(Clone)]
pub struct ServerSupervisor {
    inner: Arc<Inner>,
}

impl ServerSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let (state, _) = watch::channel(ServerState::Stopped);
        Self {
            inner: Arc::new(Inner {
                config,
                state,
                events: EventBus::new(),
                lifecycle: tokio::sync::Mutex::new(()),
                handle: Mutex::new(None),
                last_target: Mutex::new(None),
                generation: AtomicU64::new(0),
                crash_cause: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ServerState {
        self.inner.state()
    }

    /// True only once the server has signalled readiness
    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ServerState> {
        self.inner.state.subscribe()
    }

    /// Events of every connection this supervisor runs
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Incremented on every spawn
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.handle.lock().unwrap().as_ref().map(|h| h.pid)
    }

    pub fn launch_target(&self) -> Option<LaunchTarget> {
        self.inner.last_target.lock().unwrap().clone()
    }

    /// Spawn the server; readiness is reported asynchronously through the
    /// state channel (see [`Self::wait_until_started`])
    pub async fn start(&self, target: LaunchTarget) -> Result<u32, ServerError> {
        let _lifecycle = self.inner.lifecycle.lock().await;

        let current = self.state();
        if current != ServerState::Stopped {
            return Err(ServerError::invalid_state("start", current));
        }

        let generation = self.inner.next_generation();
        self.inner.transition(ServerState::Starting);
        self.spawn(generation, target).await
    }

    /// Tear down the current server and start again
    ///
    /// Uses `target` or, when `None`, the previous launch target.
    pub async fn restart(&self, target: Option<LaunchTarget>) -> Result<u32, ServerError> {
        let _lifecycle = self.inner.lifecycle.lock().await;

        let current = self.state();
        if current == ServerState::Stopped {
            return Err(ServerError::invalid_state("restart", current));
        }
        let target = target
            .or_else(|| self.launch_target())
            .ok_or(ServerError::NoLaunchTarget)?;

        info!("Restarting server");
        self.inner.transition(ServerState::Restarting);
        self.teardown().await;
        let generation = self.inner.next_generation();
        self.inner.transition(ServerState::Starting);
        self.spawn(generation, target).await
    }

    /// Stop the server from any state; idempotent
    pub async fn stop(&self) -> Result<(), ServerError> {
        let _lifecycle = self.inner.lifecycle.lock().await;

        if self.state() == ServerState::Stopped {
            return Ok(());
        }

        self.inner.transition(ServerState::Stopping);
        self.teardown().await;
        self.inner.transition(ServerState::Stopped);
        Ok(())
    }

    /// Wait for the current start attempt to settle
    pub async fn wait_until_started(&self) -> Result<(), ServerError> {
        let mut states = self.subscribe_state();
        let state = match states
            .wait_for(|s| {
                matches!(
                    s,
                    ServerState::Started | ServerState::Crashed | ServerState::Stopped
                )
            })
            .await
        {
            Ok(state) => *state,
            Err(_) => ServerState::Stopped,
        };

        match state {
            ServerState::Started => Ok(()),
            ServerState::Crashed => Err(self.inner.crash_error()),
            other => Err(ServerError::invalid_state("wait for startup", other)),
        }
    }

    /// Send a request on the current connection
    pub async fn request(
        &self,
        command: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, DispatchError> {
        let dispatcher = self.dispatcher().ok_or(DispatchError::ServerDisconnected)?;
        dispatcher.send(command, arguments, cancel).await
    }

    /// Typed request on the current connection
    pub async fn call<Q: ServerRequest>(
        &self,
        request: &Q,
        cancel: &CancellationToken,
    ) -> Result<Q::Response, DispatchError> {
        let dispatcher = self.dispatcher().ok_or(DispatchError::ServerDisconnected)?;
        dispatcher.call(request, cancel).await
    }

    fn dispatcher(&self) -> Option<Arc<RequestDispatcher>> {
        self.inner
            .handle
            .lock()
            .unwrap()
            .as_ref()
            .map(|h| Arc::clone(&h.dispatcher))
    }

    /// Spawn a process for `target`; the caller holds the lifecycle lock
    /// and has moved the state to `Starting`
    async fn spawn(&self, generation: u64, target: LaunchTarget) -> Result<u32, ServerError> {
        *self.inner.crash_cause.lock().unwrap() = None;
        *self.inner.last_target.lock().unwrap() = Some(target.clone());

        info!(
            "Launching server (generation {}): {}",
            generation,
            target.command_line()
        );

        let mut process = ServerProcess::new(
            target.program.clone(),
            target.args.clone(),
            Some(target.working_dir.clone()),
        );

        let stderr_log = StderrLog::open(self.inner.config.server_log_file.as_deref());
        process.on_stderr_line(move |line| stderr_log.record(&line));
        process.set_exit_handler(Arc::new(ExitWatcher {
            inner: Arc::downgrade(&self.inner),
            generation,
        }));

        let started = process.start().await;
        let pid = match started {
            Ok(pid) => pid,
            Err(e) => {
                error!("Failed to launch server: {}", e);
                self.inner.transition(ServerState::Stopped);
                return Err(e.into());
            }
        };

        let transport = match process.take_transport() {
            Ok(transport) => transport,
            Err(e) => {
                process.kill_sync();
                self.inner.transition(ServerState::Stopped);
                return Err(e.into());
            }
        };

        let dispatcher = Arc::new(RequestDispatcher::new(
            transport,
            self.inner.events.for_connection(generation),
            self.inner.config.request_timeout,
        ));
        let status = dispatcher.subscribe_status();

        *self.inner.handle.lock().unwrap() = Some(ServerHandle {
            generation,
            pid,
            process,
            dispatcher,
            target,
            watcher: tokio::spawn(watch_connection(
                Arc::downgrade(&self.inner),
                generation,
                status,
                self.inner.config.startup_timeout,
            )),
        });

        Ok(pid)
    }

    /// Close the connection and terminate the process, if any
    async fn teardown(&self) {
        let handle = self.inner.handle.lock().unwrap().take();
        let Some(mut handle) = handle else {
            return;
        };

        debug!(
            "Tearing down server generation {} ({})",
            handle.generation,
            handle.target.command_line()
        );
        handle.watcher.abort();
        handle.dispatcher.shutdown(DispatchError::Cancelled).await;

        match handle
            .process
            .stop(StopMode::Graceful(self.inner.config.shutdown_timeout))
            .await
        {
            Ok(()) | Err(ProcessError::NotStarted) => {}
            Err(e) => warn!("Failed to stop server PID {}: {}", handle.pid, e),
        }
    }
}

impl std::fmt::Debug for ServerSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSupervisor")
            .field("state", &self.state())
            .field("generation", &self.generation())
            .field("pid", &self.pid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fake_server::{FakeServer, STARTED_EVENT};
    use serde_json::json;

    #[cfg(feature = "test-logging")]
    #[ctor::ctor]
    fn init_test_logging() {
        crate::test_utils::logging::init();
    }

    fn supervisor() -> ServerSupervisor {
        ServerSupervisor::new(SupervisorConfig {
            startup_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(2),
            request_timeout: Some(Duration::from_secs(10)),
            server_log_file: None,
        })
    }

    #[tokio::test]
    async fn test_start_request_stop() {
        let server = FakeServer::echoing();
        let supervisor = supervisor();
        assert_eq!(supervisor.state(), ServerState::Stopped);

        supervisor.start(server.target()).await.unwrap();
        supervisor.wait_until_started().await.unwrap();
        assert!(supervisor.is_running());
        assert_eq!(supervisor.generation(), 1);

        let token = CancellationToken::new();
        let body = supervisor
            .request("/checkreadystatus", Value::Null, &token)
            .await
            .unwrap();
        assert_eq!(body, json!({}));

        supervisor.stop().await.unwrap();
        assert_eq!(supervisor.state(), ServerState::Stopped);
        assert!(supervisor.pid().is_none());

        // idempotent
        supervisor.stop().await.unwrap();
        assert_eq!(supervisor.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_start_requires_stopped() {
        let server = FakeServer::idle();
        let supervisor = supervisor();

        supervisor.start(server.target()).await.unwrap();
        let err = supervisor.start(server.target()).await.unwrap_err();
        assert!(matches!(err, ServerError::InvalidState { operation: "start", .. }));

        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_requires_running_server() {
        let supervisor = supervisor();
        assert!(matches!(
            supervisor.restart(None).await,
            Err(ServerError::InvalidState { operation: "restart", .. })
        ));
    }

    #[tokio::test]
    async fn test_request_without_server_is_disconnected() {
        let supervisor = supervisor();
        let token = CancellationToken::new();
        assert!(matches!(
            supervisor.request("/codecheck", Value::Null, &token).await,
            Err(DispatchError::ServerDisconnected)
        ));
    }

    #[tokio::test]
    async fn test_crash_while_started_fails_pending_requests() {
        let server = FakeServer::new(&format!(
            "echo '{STARTED_EVENT}'\nread line\nexit 3"
        ));
        let supervisor = supervisor();
        supervisor.start(server.target()).await.unwrap();
        supervisor.wait_until_started().await.unwrap();

        let token = CancellationToken::new();
        let result = supervisor.request("/codecheck", Value::Null, &token).await;
        assert!(matches!(result, Err(DispatchError::ServerDisconnected)));

        let mut states = supervisor.subscribe_state();
        states
            .wait_for(|s| *s == ServerState::Crashed)
            .await
            .unwrap();
        assert!(!supervisor.is_running());

        // crashed persists until stopped
        supervisor.stop().await.unwrap();
        assert_eq!(supervisor.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_exit_before_ready() {
        let server = FakeServer::new("exit 2");
        let supervisor = supervisor();

        supervisor.start(server.target()).await.unwrap();
        let err = supervisor.wait_until_started().await.unwrap_err();

        assert!(matches!(err, ServerError::ExitedBeforeReady { .. }));
        assert_eq!(supervisor.state(), ServerState::Crashed);
    }

    #[tokio::test]
    async fn test_startup_timeout_kills_process() {
        let server = FakeServer::mute();
        let supervisor = ServerSupervisor::new(SupervisorConfig {
            startup_timeout: Duration::from_millis(200),
            ..SupervisorConfig::default()
        });

        supervisor.start(server.target()).await.unwrap();
        let err = supervisor.wait_until_started().await.unwrap_err();

        assert!(matches!(err, ServerError::StartupTimeout(_)));
        assert_eq!(supervisor.state(), ServerState::Crashed);
        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_requests() {
        let server = FakeServer::idle();
        let supervisor = supervisor();
        supervisor.start(server.target()).await.unwrap();
        supervisor.wait_until_started().await.unwrap();

        let pending = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move {
                let token = CancellationToken::new();
                supervisor.request("/codecheck", Value::Null, &token).await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        supervisor.stop().await.unwrap();
        assert!(pending.await.unwrap().unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_restart_spawns_new_generation() {
        let server = FakeServer::idle();
        let supervisor = supervisor();
        let first_pid = supervisor.start(server.target()).await.unwrap();
        supervisor.wait_until_started().await.unwrap();

        let pending = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move {
                let token = CancellationToken::new();
                supervisor.request("/codecheck", Value::Null, &token).await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let second_pid = supervisor.restart(None).await.unwrap();
        assert!(pending.await.unwrap().unwrap_err().is_cancelled());
        assert_ne!(first_pid, second_pid);
        assert_eq!(supervisor.generation(), 2);

        supervisor.wait_until_started().await.unwrap();
        assert!(supervisor.is_running());
        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_events_survive_restart() {
        let server = FakeServer::idle();
        let supervisor = supervisor();
        let mut started = supervisor
            .events()
            .subscribe(crate::protocol::events::EventKind::Started);

        supervisor.start(server.target()).await.unwrap();
        assert!(started.recv().await.is_some());

        supervisor.restart(None).await.unwrap();
        assert!(started.recv().await.is_some());

        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_failure_returns_to_stopped() {
        let supervisor = supervisor();
        let target = LaunchTarget {
            program: PathBuf::from("/nonexistent/omnisharp/run"),
            args: vec![],
            working_dir: std::env::temp_dir(),
        };

        assert!(matches!(
            supervisor.start(target).await,
            Err(ServerError::Process(_))
        ));
        assert_eq!(supervisor.state(), ServerState::Stopped);
    }
}
