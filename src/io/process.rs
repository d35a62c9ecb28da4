//! Process management layer
//!
//! Spawns the analysis server, drains its stderr and reports its exit.
//! Talking to the server is the transport's job; this module only hands
//! the stdio pipes over.

use crate::io::transport::StdioTransport;
use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
#[allow(unused_imports)]
use tracing::{debug, error, info, trace, warn};

// ============================================================================
// Process State
// ============================================================================

/// How to stop a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// SIGTERM, then SIGKILL once the grace period runs out
    Graceful(Duration),
    /// SIGKILL immediately
    Force,
}

/// Process lifecycle states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running { pid: u32 },
    /// Exited on its own or was stopped; `code` is `None` when killed by a signal
    Exited { code: Option<i32> },
}

impl ProcessState {
    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessState::Running { pid } => Some(*pid),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running { .. })
    }
}

// ============================================================================
// Exit notification
// ============================================================================

/// Fired once when the child process exits, whatever the reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExitEvent {
    pub pid: u32,
    pub code: Option<i32>,
}

/// Receives [`ProcessExitEvent`]s from the wait task
#[async_trait]
pub trait ProcessExitHandler: Send + Sync {
    async fn on_process_exit(&self, event: ProcessExitEvent);
}

/// Line-oriented stderr observer
pub trait StderrMonitor: Send + Sync {
    /// Install a handler for stderr lines; replaces any previous one
    ///
    /// Must be installed before `start`. Without a handler the pipe is
    /// still drained so the server never blocks on a full stderr buffer.
    fn on_stderr_line<F>(&mut self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static;
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Process not started")]
    NotStarted,

    #[error("Process already started")]
    AlreadyStarted,

    #[error("{0} pipe not available")]
    PipeNotAvailable(&'static str),
}

// ============================================================================
// Server Process
// ============================================================================

/// One spawned server executable
pub struct ServerProcess {
    program: PathBuf,
    args: Vec<String>,
    working_directory: Option<PathBuf>,

    state: Arc<Mutex<ProcessState>>,
    exited_tx: watch::Sender<bool>,

    transport: Option<StdioTransport>,
    stderr_handler: Option<Box<dyn Fn(String) + Send + Sync>>,
    exit_handler: Option<Arc<dyn ProcessExitHandler>>,

    stderr_task: Option<JoinHandle<()>>,
    wait_task: Option<JoinHandle<()>>,
}

impl ServerProcess {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, working_dir: Option<PathBuf>) -> Self {
        let (exited_tx, _) = watch::channel(false);
        Self {
            program: program.into(),
            args,
            working_directory: working_dir,
            state: Arc::new(Mutex::new(ProcessState::NotStarted)),
            exited_tx,
            transport: None,
            stderr_handler: None,
            exit_handler: None,
            stderr_task: None,
            wait_task: None,
        }
    }

    /// Register the handler notified when the process exits
    pub fn set_exit_handler(&mut self, handler: Arc<dyn ProcessExitHandler>) {
        self.exit_handler = Some(handler);
    }

    pub fn state(&self) -> ProcessState {
        // Intentional .unwrap() - poisoned mutex indicates serious bug
        self.state.lock().unwrap().clone()
    }

    pub fn pid(&self) -> Option<u32> {
        self.state().pid()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    /// Spawn the process and its stderr/wait tasks
    pub async fn start(&mut self) -> Result<u32, ProcessError> {
        if self.state() != ProcessState::NotStarted {
            return Err(ProcessError::AlreadyStarted);
        }

        info!("Starting server: {} {:?}", self.program.display(), self.args);

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.working_directory {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: self.program.display().to_string(),
            source,
        })?;

        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("Failed to get process ID"))?;
        info!("Server started with PID {}", pid);
        *self.state.lock().unwrap() = ProcessState::Running { pid };

        let stdin = child.stdin.take().ok_or(ProcessError::PipeNotAvailable("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(ProcessError::PipeNotAvailable("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(ProcessError::PipeNotAvailable("stderr"))?;

        self.transport = Some(StdioTransport::new(stdin, stdout));
        self.spawn_stderr_monitor(stderr);
        self.spawn_wait_task(child, pid);

        Ok(pid)
    }

    /// Hand the stdio transport to the caller; available once per start
    pub fn take_transport(&mut self) -> Result<StdioTransport, ProcessError> {
        self.transport.take().ok_or(ProcessError::NotStarted)
    }

    /// Wait until the process has exited, up to `timeout`
    ///
    /// Returns whether the process is gone.
    pub async fn wait_for_exit(&self, timeout: Duration) -> bool {
        let mut exited = self.exited_tx.subscribe();
        if *exited.borrow_and_update() {
            return true;
        }
        tokio::time::timeout(timeout, exited.wait_for(|done| *done))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    /// Stop the process
    ///
    /// Graceful mode sends SIGTERM and escalates to SIGKILL when the
    /// process outlives the grace period.
    pub async fn stop(&mut self, mode: StopMode) -> Result<(), ProcessError> {
        let pid = self.pid().ok_or(ProcessError::NotStarted)?;

        self.transport.take();

        match mode {
            StopMode::Graceful(grace) => {
                info!("Gracefully stopping server PID {}", pid);
                send_signal(pid, Signal::Term);
                if !self.wait_for_exit(grace).await {
                    warn!(
                        "Server PID {} still running after {:?}, sending SIGKILL",
                        pid, grace
                    );
                    send_signal(pid, Signal::Kill);
                    self.wait_for_exit(grace).await;
                }
            }
            StopMode::Force => {
                info!("Force killing server PID {}", pid);
                send_signal(pid, Signal::Kill);
                self.wait_for_exit(Duration::from_secs(1)).await;
            }
        }

        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }

        let mut state = self.state.lock().unwrap();
        if state.is_running() {
            *state = ProcessState::Exited { code: None };
        }

        Ok(())
    }

    /// Synchronous SIGKILL for `Drop` implementations
    pub fn kill_sync(&mut self) {
        let Some(pid) = self.pid() else {
            return;
        };

        info!("Synchronously killing server PID {}", pid);
        send_signal(pid, Signal::Kill);

        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        *self.state.lock().unwrap() = ProcessState::Exited { code: None };
    }

    fn spawn_stderr_monitor(&mut self, stderr: ChildStderr) {
        let handler = self.stderr_handler.take();

        let task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim_end().to_string();
                        if line.is_empty() {
                            continue;
                        }
                        match &handler {
                            Some(handler) => handler(line),
                            None => trace!("server stderr: {}", line),
                        }
                    }
                    Ok(None) => {
                        trace!("ServerProcess: stderr EOF");
                        break;
                    }
                    Err(e) => {
                        error!("Failed to read server stderr: {}", e);
                        break;
                    }
                }
            }
        });

        self.stderr_task = Some(task);
    }

    fn spawn_wait_task(&mut self, mut child: Child, pid: u32) {
        let state = Arc::clone(&self.state);
        let exited_tx = self.exited_tx.clone();
        let exit_handler = self.exit_handler.clone();

        let task = tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => {
                    info!("Server PID {} exited with {}", pid, status);
                    status.code()
                }
                Err(e) => {
                    error!("Error waiting for server PID {}: {}", pid, e);
                    None
                }
            };

            if let Ok(mut process_state) = state.lock() {
                *process_state = ProcessState::Exited { code };
            }
            exited_tx.send_replace(true);

            if let Some(handler) = exit_handler {
                handler.on_process_exit(ProcessExitEvent { pid, code }).await;
            }
        });

        self.wait_task = Some(task);
    }
}

impl StderrMonitor for ServerProcess {
    fn on_stderr_line<F>(&mut self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.stderr_handler = Some(Box::new(handler));
    }
}

impl std::fmt::Debug for ServerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerProcess")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("working_directory", &self.working_directory)
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// Signals
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) {
    let signo = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: kill(2) has no memory-safety preconditions
    let rc = unsafe { libc::kill(pid as libc::pid_t, signo) };
    if rc == 0 {
        debug!("Sent {:?} to PID {}", signal, pid);
    } else {
        debug!(
            "Sending {:?} to PID {} failed: {}",
            signal,
            pid,
            io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn send_signal(pid: u32, signal: Signal) {
    // kill_on_drop covers the child once the wait task is dropped
    warn!(
        "Signal {:?} for PID {} not supported on this platform",
        signal, pid
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::transport::Transport;
    use tokio::sync::mpsc;

    struct ChannelExitHandler(mpsc::UnboundedSender<ProcessExitEvent>);

    #[async_trait]
    impl ProcessExitHandler for ChannelExitHandler {
        async fn on_process_exit(&self, event: ProcessExitEvent) {
            let _ = self.0.send(event);
        }
    }

    fn sh(script: &str) -> ServerProcess {
        ServerProcess::new("sh", vec!["-c".to_string(), script.to_string()], None)
    }

    #[tokio::test]
    async fn test_lifecycle_and_graceful_stop() {
        let mut process = sh("sleep 30");
        assert_eq!(process.state(), ProcessState::NotStarted);

        let pid = process.start().await.unwrap();
        assert_eq!(process.state(), ProcessState::Running { pid });

        process
            .stop(StopMode::Graceful(Duration::from_secs(2)))
            .await
            .unwrap();
        assert!(!process.is_running());
        assert!(process.wait_for_exit(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_graceful_stop_escalates_to_kill() {
        let mut process = sh("trap '' TERM; sleep 30");
        process.start().await.unwrap();
        // give the shell time to install the trap
        tokio::time::sleep(Duration::from_millis(100)).await;

        process
            .stop(StopMode::Graceful(Duration::from_millis(200)))
            .await
            .unwrap();
        assert!(process.wait_for_exit(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_exit_handler_receives_exit_code() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut process = sh("exit 3");
        process.set_exit_handler(Arc::new(ChannelExitHandler(tx)));

        let pid = process.start().await.unwrap();
        let event = rx.recv().await.unwrap();

        assert_eq!(event, ProcessExitEvent { pid, code: Some(3) });
        assert_eq!(process.state(), ProcessState::Exited { code: Some(3) });
    }

    #[tokio::test]
    async fn test_stderr_lines_forwarded() {
        let mut process = sh("echo 'first line' >&2; echo 'second' >&2; sleep 1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        process.on_stderr_line(move |line| {
            let _ = tx.send(line);
        });

        process.start().await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "first line");
        assert_eq!(rx.recv().await.unwrap(), "second");

        process.stop(StopMode::Force).await.unwrap();
    }

    #[tokio::test]
    async fn test_transport_taken_once() {
        let mut process = sh("printf 'hello\\n'");
        assert!(matches!(
            process.take_transport(),
            Err(ProcessError::NotStarted)
        ));

        process.start().await.unwrap();
        let mut transport = process.take_transport().unwrap();
        assert!(process.take_transport().is_err());

        assert_eq!(transport.receive().await.unwrap(), "hello\n");
    }

    #[tokio::test]
    async fn test_invalid_operations() {
        let mut process = sh("sleep 30");
        assert!(matches!(
            process.stop(StopMode::Force).await,
            Err(ProcessError::NotStarted)
        ));

        process.start().await.unwrap();
        assert!(matches!(
            process.start().await,
            Err(ProcessError::AlreadyStarted)
        ));

        process.kill_sync();
        assert!(!process.is_running());
    }

    #[tokio::test]
    async fn test_spawn_failure_names_program() {
        let mut process = ServerProcess::new("/nonexistent/omnisharp/run", vec![], None);
        let err = process.start().await.unwrap_err();
        assert!(err.to_string().contains("/nonexistent/omnisharp/run"));
    }
}
