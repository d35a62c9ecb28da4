//! Request/response correlation for one server connection
//!
//! A single I/O task owns the framed transport. Callers hand it encoded
//! envelopes through an unbounded channel, so every envelope goes out as
//! one line and writes never interleave. Inbound responses are matched to
//! pending requests purely by sequence number; events go to the
//! [`EventBus`].

use crate::dispatch::error::DispatchError;
use crate::dispatch::event_bus::EventBus;
use crate::io::transport::Transport;
use crate::protocol::envelope::{Envelope, ResponseEnvelope};
use crate::protocol::events::{EventKind, ServerEvent};
use crate::protocol::framing::LineFraming;
use crate::protocol::requests::ServerRequest;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, error, trace, warn};

/// Default per-request timeout; stdio servers expose no liveness signal
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Where the connection is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Connected, server has not signalled readiness yet
    Handshaking,
    /// `started` event or first successful response seen
    Ready,
    /// Transport gone or dispatcher closed; no further responses
    Closed,
}

type Responder = oneshot::Sender<Result<Value, DispatchError>>;

struct PendingRequest {
    command: String,
    responder: Responder,
}

#[derive(Default)]
struct PendingTable {
    closed: bool,
    entries: HashMap<u64, PendingRequest>,
}

struct Shared {
    pending: Mutex<PendingTable>,
    status: watch::Sender<ConnectionStatus>,
    events: EventBus,
}

impl Shared {
    fn take(&self, seq: u64) -> Option<PendingRequest> {
        // Intentional .unwrap() - poisoned mutex indicates serious bug
        self.pending.lock().unwrap().entries.remove(&seq)
    }

    /// Resolve every pending request with `reason` and refuse new ones
    fn fail_all(&self, reason: DispatchError) {
        let drained: Vec<(u64, PendingRequest)> = {
            let mut table = self.pending.lock().unwrap();
            table.closed = true;
            table.entries.drain().collect()
        };

        for (seq, request) in drained {
            debug!(
                "Dispatcher: resolving #{} {} with: {}",
                seq, request.command, reason
            );
            let _ = request.responder.send(Err(reason.clone()));
        }

        self.status.send_replace(ConnectionStatus::Closed);
    }

    fn mark_ready(&self) {
        self.status.send_if_modified(|status| {
            if *status == ConnectionStatus::Handshaking {
                *status = ConnectionStatus::Ready;
                true
            } else {
                false
            }
        });
    }

    fn handle_line(&self, line: &str) {
        let envelope = match Envelope::decode(line) {
            Ok(envelope) => envelope,
            Err(_) => {
                trace!("Dispatcher: skipping non-protocol output: {}", line);
                return;
            }
        };

        match envelope {
            Envelope::Response(response) => self.handle_response(response),
            Envelope::Event(event) => {
                crate::log_server_message!(Level::TRACE, "recv", event.event.as_str(), &event.body);

                let kind = EventKind::from_name(&event.event);
                if kind == EventKind::Started {
                    self.mark_ready();
                }
                self.events.publish(ServerEvent::new(kind, event.body));
            }
            other => {
                debug!("Dispatcher: ignoring unexpected {}", other.describe());
            }
        }
    }

    fn handle_response(&self, response: ResponseEnvelope) {
        crate::log_server_message!(
            Level::DEBUG,
            "recv",
            response.command.as_str(),
            response.request_seq
        );

        if response.success {
            self.mark_ready();
        }

        let Some(pending) = self.take(response.request_seq) else {
            debug!(
                "Dispatcher: dropping response #{} {} with no pending request",
                response.request_seq, response.command
            );
            return;
        };

        let outcome = if response.success {
            Ok(response.body)
        } else {
            Err(DispatchError::Server {
                command: pending.command,
                message: response
                    .message
                    .unwrap_or_else(|| "request failed".to_string()),
            })
        };

        if pending.responder.send(outcome).is_err() {
            trace!(
                "Dispatcher: caller for #{} went away before the response",
                response.request_seq
            );
        }
    }
}

/// Correlates requests with responses on one connection
pub struct RequestDispatcher {
    outbound: mpsc::UnboundedSender<String>,
    next_seq: AtomicU64,
    shared: Arc<Shared>,
    request_timeout: Option<Duration>,
    shutdown: CancellationToken,
    io_task: Mutex<Option<JoinHandle<()>>>,
}

impl RequestDispatcher {
    /// Take ownership of `transport` and start the connection's I/O task
    ///
    /// `request_timeout` of `None` lets requests wait indefinitely.
    pub fn new<T>(transport: T, events: EventBus, request_timeout: Option<Duration>) -> Self
    where
        T: Transport + 'static,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ConnectionStatus::Handshaking);
        let shared = Arc::new(Shared {
            pending: Mutex::new(PendingTable::default()),
            status,
            events,
        });
        let shutdown = CancellationToken::new();

        let io_task = tokio::spawn(Self::run_io(
            LineFraming::new(transport),
            outbound_rx,
            Arc::clone(&shared),
            shutdown.clone(),
        ));

        Self {
            outbound,
            next_seq: AtomicU64::new(1),
            shared,
            request_timeout,
            shutdown,
            io_task: Mutex::new(Some(io_task)),
        }
    }

    async fn run_io<T: Transport>(
        mut framing: LineFraming<T>,
        mut outbound: mpsc::UnboundedReceiver<String>,
        shared: Arc<Shared>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    trace!("Dispatcher: shutdown requested");
                    break;
                }
                message = outbound.recv() => {
                    let Some(message) = message else {
                        trace!("Dispatcher: all senders dropped");
                        break;
                    };
                    if let Err(e) = framing.send(&message).await {
                        error!("Dispatcher: failed to write to server: {}", e);
                        break;
                    }
                }
                received = framing.receive() => {
                    match received {
                        Ok(line) => shared.handle_line(&line),
                        Err(e) => {
                            debug!("Dispatcher: server stream ended: {}", e);
                            break;
                        }
                    }
                }
            }
        }

        let _ = framing.close().await;
        shared.fail_all(DispatchError::ServerDisconnected);
        trace!("Dispatcher: I/O task finished");
    }

    /// Send `command` and wait for its response body
    ///
    /// Resolves on the first of: the matching response, `cancel` firing,
    /// the connection closing, or the request timeout.
    pub async fn send(
        &self,
        command: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, DispatchError> {
        if cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let line = Envelope::request(seq, command, arguments)
            .encode()
            .map_err(|e| DispatchError::serialization(command, e))?;

        let (responder, response) = oneshot::channel();
        {
            let mut table = self.shared.pending.lock().unwrap();
            if table.closed {
                return Err(DispatchError::ServerDisconnected);
            }
            table.entries.insert(
                seq,
                PendingRequest {
                    command: command.to_string(),
                    responder,
                },
            );
        }

        crate::log_server_message!(Level::DEBUG, "send", command, seq);

        if self.outbound.send(line).is_err() {
            self.shared.take(seq);
            return Err(DispatchError::ServerDisconnected);
        }

        let timeout = async {
            match self.request_timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;

            outcome = response => {
                outcome.unwrap_or(Err(DispatchError::ServerDisconnected))
            }
            _ = cancel.cancelled() => {
                if self.shared.take(seq).is_some() {
                    debug!("Dispatcher: cancelling #{} {}", seq, command);
                    if let Ok(cancel_line) = Envelope::cancel(seq).encode() {
                        let _ = self.outbound.send(cancel_line);
                    }
                }
                Err(DispatchError::Cancelled)
            }
            _ = timeout => {
                self.shared.take(seq);
                let timeout_ms = self.request_timeout.map_or(0, |d| d.as_millis());
                warn!("Dispatcher: #{} {} timed out after {} ms", seq, command, timeout_ms);
                Err(DispatchError::Timeout {
                    command: command.to_string(),
                    timeout_ms,
                })
            }
        }
    }

    /// Serialize `payload`, send it and decode the response body
    pub async fn request<P, R>(
        &self,
        command: &str,
        payload: &P,
        cancel: &CancellationToken,
    ) -> Result<R, DispatchError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let arguments =
            serde_json::to_value(payload).map_err(|e| DispatchError::serialization(command, e))?;
        let body = self.send(command, arguments, cancel).await?;
        serde_json::from_value(body).map_err(|e| DispatchError::deserialization(command, e))
    }

    /// Typed request bound to its endpoint
    pub async fn call<Q: ServerRequest>(
        &self,
        request: &Q,
        cancel: &CancellationToken,
    ) -> Result<Q::Response, DispatchError> {
        self.request(Q::COMMAND, request, cancel).await
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().unwrap().entries.len()
    }

    /// Resolve every pending request with `reason` and stop the I/O task
    ///
    /// Idempotent. Later `send` calls fail with `ServerDisconnected`.
    pub fn close(&self, reason: DispatchError) {
        self.shared.fail_all(reason);
        self.shutdown.cancel();
    }

    /// Close and wait for the I/O task to release the transport
    pub async fn shutdown(&self, reason: DispatchError) {
        self.close(reason);
        let task = self.io_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for RequestDispatcher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for RequestDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDispatcher")
            .field("status", &self.status())
            .field("pending", &self.pending_count())
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::transport::{ChannelPeer, ChannelTransport};
    use crate::protocol::requests::{CodeCheckRequest, QuickFixResponse};
    use serde_json::json;

    fn dispatcher(timeout: Option<Duration>) -> (Arc<RequestDispatcher>, ChannelPeer) {
        let (transport, peer) = ChannelTransport::pair();
        (
            Arc::new(RequestDispatcher::new(transport, EventBus::new(), timeout)),
            peer,
        )
    }

    async fn next_envelope(peer: &mut ChannelPeer) -> Envelope {
        let line = peer.from_client.recv().await.expect("client sent nothing");
        Envelope::decode(line.trim_end()).expect("client sent invalid envelope")
    }

    async fn next_request_seq(peer: &mut ChannelPeer) -> u64 {
        match next_envelope(peer).await {
            Envelope::Request(r) => r.seq,
            other => panic!("expected request, got {other:?}"),
        }
    }

    fn respond(peer: &ChannelPeer, seq: u64, body: Value) {
        let line = json!({
            "Type": "response",
            "Request_seq": seq,
            "Command": "/test",
            "Success": true,
            "Body": body
        });
        peer.to_client.send(format!("{line}\n")).unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_correlated() {
        let (dispatcher, mut peer) = dispatcher(None);
        let token = CancellationToken::new();

        let mut handles = Vec::new();
        for i in 0..3 {
            let dispatcher = Arc::clone(&dispatcher);
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                dispatcher.send("/test", json!({ "i": i }), &token).await
            }));
        }

        let mut seqs = Vec::new();
        for _ in 0..3 {
            seqs.push(next_request_seq(&mut peer).await);
        }
        // answer in reverse order
        for seq in seqs.iter().rev() {
            respond(&peer, *seq, json!({ "seq": seq }));
        }

        let mut answered = Vec::new();
        for handle in handles {
            let body = handle.await.unwrap().unwrap();
            answered.push(body["seq"].as_u64().unwrap());
        }
        answered.sort();
        let mut expected = seqs.clone();
        expected.sort();
        assert_eq!(answered, expected);
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelling_one_request_leaves_others_alone() {
        let (dispatcher, mut peer) = dispatcher(None);
        let keep = CancellationToken::new();
        let drop_me = CancellationToken::new();

        let first = {
            let (d, t) = (Arc::clone(&dispatcher), keep.clone());
            tokio::spawn(async move { d.send("/a", Value::Null, &t).await })
        };
        let first_seq = next_request_seq(&mut peer).await;

        let second = {
            let (d, t) = (Arc::clone(&dispatcher), drop_me.clone());
            tokio::spawn(async move { d.send("/b", Value::Null, &t).await })
        };
        let second_seq = next_request_seq(&mut peer).await;

        drop_me.cancel();
        assert!(second.await.unwrap().unwrap_err().is_cancelled());

        match next_envelope(&mut peer).await {
            Envelope::Cancel(c) => assert_eq!(c.seq, second_seq),
            other => panic!("expected cancel, got {other:?}"),
        }

        // late answer for the cancelled request is dropped
        respond(&peer, second_seq, json!("late"));
        respond(&peer, first_seq, json!("first"));

        assert_eq!(first.await.unwrap().unwrap(), json!("first"));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_pre_cancelled_token_sends_nothing() {
        let (dispatcher, mut peer) = dispatcher(None);
        let token = CancellationToken::new();
        token.cancel();

        let result = dispatcher.send("/a", Value::Null, &token).await;
        assert!(matches!(result, Err(DispatchError::Cancelled)));
        assert!(peer.from_client.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_server_failure_maps_to_server_error() {
        let (dispatcher, mut peer) = dispatcher(None);
        let token = CancellationToken::new();

        let pending = {
            let d = Arc::clone(&dispatcher);
            tokio::spawn(async move { d.send("/codecheck", Value::Null, &token).await })
        };
        let seq = next_request_seq(&mut peer).await;
        let line = json!({
            "Type": "response", "Request_seq": seq, "Command": "/codecheck",
            "Success": false, "Message": "workspace not loaded"
        });
        peer.to_client.send(format!("{line}\n")).unwrap();

        match pending.await.unwrap() {
            Err(DispatchError::Server { command, message }) => {
                assert_eq!(command, "/codecheck");
                assert_eq!(message, "workspace not loaded");
            }
            other => panic!("expected server error, got {other:?}"),
        }
        // a failed response does not count as readiness
        assert_eq!(dispatcher.status(), ConnectionStatus::Handshaking);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_affects_only_that_request() {
        let (dispatcher, mut peer) = dispatcher(Some(Duration::from_millis(100)));
        let token = CancellationToken::new();

        let result = dispatcher.send("/slow", Value::Null, &token).await;
        assert!(matches!(result, Err(DispatchError::Timeout { ref command, .. }) if command == "/slow"));
        assert_eq!(dispatcher.pending_count(), 0);

        // connection still usable
        let next = {
            let d = Arc::clone(&dispatcher);
            tokio::spawn(async move { d.send("/fast", Value::Null, &token).await })
        };
        let _timed_out = next_request_seq(&mut peer).await;
        let seq = next_request_seq(&mut peer).await;
        respond(&peer, seq, json!(1));
        assert_eq!(next.await.unwrap().unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_requests() {
        let (dispatcher, mut peer) = dispatcher(None);
        let token = CancellationToken::new();

        let pending = {
            let (d, t) = (Arc::clone(&dispatcher), token.clone());
            tokio::spawn(async move { d.send("/a", Value::Null, &t).await })
        };
        next_request_seq(&mut peer).await;
        drop(peer);

        assert!(matches!(
            pending.await.unwrap(),
            Err(DispatchError::ServerDisconnected)
        ));

        let mut status = dispatcher.subscribe_status();
        status
            .wait_for(|s| *s == ConnectionStatus::Closed)
            .await
            .unwrap();
        assert!(matches!(
            dispatcher.send("/b", Value::Null, &token).await,
            Err(DispatchError::ServerDisconnected)
        ));
    }

    #[tokio::test]
    async fn test_close_resolves_pending_as_cancelled() {
        let (dispatcher, mut peer) = dispatcher(None);
        let token = CancellationToken::new();

        let pending = {
            let (d, t) = (Arc::clone(&dispatcher), token.clone());
            tokio::spawn(async move { d.send("/a", Value::Null, &t).await })
        };
        next_request_seq(&mut peer).await;

        dispatcher.shutdown(DispatchError::Cancelled).await;

        assert!(pending.await.unwrap().unwrap_err().is_cancelled());
        assert_eq!(dispatcher.status(), ConnectionStatus::Closed);
    }

    #[tokio::test]
    async fn test_events_published_and_readiness() {
        let (dispatcher, peer) = dispatcher(None);
        let mut projects = dispatcher.events().subscribe(EventKind::ProjectAdded);
        let mut status = dispatcher.subscribe_status();

        peer.to_client
            .send("OmniSharp server starting...\n".to_string())
            .unwrap();
        peer.to_client
            .send(
                concat!(
                    r#"{"Type":"event","Event":"ProjectAdded","Body":{"MsBuildProject":{"Path":"/w/a.csproj"}}}"#,
                    "\n",
                    r#"{"Type":"event","Event":"started","Body":null}"#,
                    "\n"
                )
                .to_string(),
            )
            .unwrap();

        let event = projects.recv().await.unwrap();
        assert_eq!(event.body["MsBuildProject"]["Path"], "/w/a.csproj");

        status
            .wait_for(|s| *s == ConnectionStatus::Ready)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_typed_call() {
        let (dispatcher, mut peer) = dispatcher(None);
        let token = CancellationToken::new();

        let pending = {
            let d = Arc::clone(&dispatcher);
            tokio::spawn(async move { d.call(&CodeCheckRequest::workspace(), &token).await })
        };

        let request = match next_envelope(&mut peer).await {
            Envelope::Request(r) => r,
            other => panic!("expected request, got {other:?}"),
        };
        assert_eq!(request.command, "/codecheck");
        assert_eq!(request.arguments, json!({"FileName": null}));

        respond(
            &peer,
            request.seq,
            json!({"QuickFixes": [{"FileName": "/w/a.cs", "Text": "oops"}]}),
        );

        let response: QuickFixResponse = pending.await.unwrap().unwrap();
        assert_eq!(response.quick_fixes.len(), 1);
        assert_eq!(dispatcher.status(), ConnectionStatus::Ready);
    }
}
