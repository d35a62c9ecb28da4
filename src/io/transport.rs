//! Transport layer - raw string exchange with the analysis server
//!
//! A transport moves opaque chunks of text in both directions. It knows
//! nothing about envelopes or framing; `protocol::framing` sits on top.

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{error, trace};

// ============================================================================
// Constants
// ============================================================================

/// Size of a single read from the server's stdout
const READ_CHUNK_SIZE: usize = 8192;

/// Core transport trait for bidirectional message exchange
///
/// `receive` must be cancel safe: the dispatcher polls it inside
/// `tokio::select!` and drops the future whenever an outbound write wins.
#[async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Send a chunk of text
    async fn send(&mut self, message: &str) -> Result<(), Self::Error>;

    /// Receive the next chunk of text
    async fn receive(&mut self) -> Result<String, Self::Error>;

    /// Close the transport
    async fn close(&mut self) -> Result<(), Self::Error>;

    /// Check if transport is still active
    fn is_connected(&self) -> bool;
}

/// Error type shared by the channel-backed transports
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport is disconnected")]
    Disconnected,
}

// ============================================================================
// UTF-8 accumulation
// ============================================================================

/// Holds raw bytes until they form complete UTF-8 sequences
///
/// Reads from a pipe can split a multi-byte character; the tail is kept
/// until the next read completes it.
#[derive(Debug, Default)]
struct Utf8Accumulator {
    pending: Vec<u8>,
}

impl Utf8Accumulator {
    fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Take the longest valid UTF-8 prefix, if any
    fn take_text(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }

        let valid_up_to = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(e) => e.valid_up_to(),
        };

        if valid_up_to == 0 {
            return None;
        }

        let bytes: Vec<u8> = self.pending.drain(..valid_up_to).collect();
        String::from_utf8(bytes).ok()
    }

    fn leftover(&self) -> usize {
        self.pending.len()
    }
}

// ============================================================================
// Stdio Transport
// ============================================================================

/// Transport over a child's stdin/stdout (or any async byte pipe)
///
/// Two background tasks own the pipe halves; the transport itself only
/// holds channel ends, so `send` never blocks on the pipe.
#[derive(Debug)]
pub struct StdioTransport {
    writer: Option<mpsc::UnboundedSender<String>>,
    reader: Option<mpsc::UnboundedReceiver<String>>,
    connected: bool,
}

impl StdioTransport {
    /// Create a transport from the write half (server stdin) and read half (server stdout)
    pub fn new<W, R>(stdin: W, stdout: R) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (reader_tx, reader_rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::write_loop(stdin, writer_rx));
        tokio::spawn(Self::read_loop(stdout, reader_tx));

        Self {
            writer: Some(writer_tx),
            reader: Some(reader_rx),
            connected: true,
        }
    }

    async fn write_loop<W>(mut stdin: W, mut outgoing: mpsc::UnboundedReceiver<String>)
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(chunk) = outgoing.recv().await {
            trace!("StdioTransport: writing {} bytes", chunk.len());

            if let Err(e) = stdin.write_all(chunk.as_bytes()).await {
                error!("Failed to write to server stdin: {}", e);
                break;
            }
            if let Err(e) = stdin.flush().await {
                error!("Failed to flush server stdin: {}", e);
                break;
            }
        }

        trace!("StdioTransport: writer finished");
    }

    async fn read_loop<R>(mut stdout: R, incoming: mpsc::UnboundedSender<String>)
    where
        R: AsyncRead + Unpin,
    {
        let mut accumulator = Utf8Accumulator::default();
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];

        loop {
            match stdout.read(&mut chunk).await {
                Ok(0) => {
                    trace!("StdioTransport: server stdout reached EOF");
                    if let Some(text) = accumulator.take_text() {
                        let _ = incoming.send(text);
                    }
                    if accumulator.leftover() > 0 {
                        error!(
                            "StdioTransport: {} incomplete UTF-8 bytes dropped at EOF",
                            accumulator.leftover()
                        );
                    }
                    break;
                }
                Ok(n) => {
                    accumulator.push(&chunk[..n]);
                    if let Some(text) = accumulator.take_text() {
                        if incoming.send(text).is_err() {
                            trace!("StdioTransport: receiver dropped, stopping reader");
                            return;
                        }
                    }
                }
                Err(e) => {
                    error!("Failed to read from server stdout: {}", e);
                    break;
                }
            }
        }

        trace!("StdioTransport: reader finished");
    }
}

#[async_trait]
impl Transport for StdioTransport {
    type Error = TransportError;

    async fn send(&mut self, message: &str) -> Result<(), Self::Error> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }

        self.writer
            .as_ref()
            .ok_or(TransportError::Disconnected)?
            .send(message.to_string())
            .map_err(|_| TransportError::Disconnected)
    }

    async fn receive(&mut self) -> Result<String, Self::Error> {
        let reader = self.reader.as_mut().ok_or(TransportError::Disconnected)?;

        match reader.recv().await {
            Some(text) => Ok(text),
            None => {
                self.connected = false;
                Err(TransportError::Disconnected)
            }
        }
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.connected = false;
        self.writer.take();
        self.reader.take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

// ============================================================================
// In-memory Channel Transport
// ============================================================================

/// In-process transport backed by two channels
///
/// Used to host a server inside the same process and to script a server
/// from tests through the matching [`ChannelPeer`].
#[derive(Debug)]
pub struct ChannelTransport {
    outgoing: Option<mpsc::UnboundedSender<String>>,
    incoming: mpsc::UnboundedReceiver<String>,
    connected: bool,
}

/// The server end of a [`ChannelTransport`]
#[derive(Debug)]
pub struct ChannelPeer {
    /// Text pushed here is received by the client
    pub to_client: mpsc::UnboundedSender<String>,
    /// Text the client sent
    pub from_client: mpsc::UnboundedReceiver<String>,
}

impl ChannelTransport {
    /// Create a connected transport/peer pair
    pub fn pair() -> (ChannelTransport, ChannelPeer) {
        let (client_tx, peer_rx) = mpsc::unbounded_channel();
        let (peer_tx, client_rx) = mpsc::unbounded_channel();

        (
            ChannelTransport {
                outgoing: Some(client_tx),
                incoming: client_rx,
                connected: true,
            },
            ChannelPeer {
                to_client: peer_tx,
                from_client: peer_rx,
            },
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    type Error = TransportError;

    async fn send(&mut self, message: &str) -> Result<(), Self::Error> {
        self.outgoing
            .as_ref()
            .ok_or(TransportError::Disconnected)?
            .send(message.to_string())
            .map_err(|_| TransportError::Disconnected)
    }

    async fn receive(&mut self) -> Result<String, Self::Error> {
        match self.incoming.recv().await {
            Some(text) => Ok(text),
            None => {
                self.connected = false;
                Err(TransportError::Disconnected)
            }
        }
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.connected = false;
        self.outgoing.take();
        self.incoming.close();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

// ============================================================================
// Mock Transport (for framing tests)
// ============================================================================

#[cfg(test)]
pub use mock::MockTransport;


// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    #[tokio::test]
    async fn test_stdio_transport_reads_child_output() {
        let mut child = Command::new("echo")
            .arg("{\"Type\":\"event\"}")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("Failed to spawn echo");

        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();
        let mut transport = StdioTransport::new(stdin, stdout);

        let output = transport.receive().await.unwrap();
        assert_eq!(output.trim(), "{\"Type\":\"event\"}");

        // EOF surfaces as a disconnect
        assert!(matches!(
            transport.receive().await,
            Err(TransportError::Disconnected)
        ));
        assert!(!transport.is_connected());

        let _ = child.wait().await;
    }

    #[tokio::test]
    async fn test_stdio_transport_round_trip_through_cat() {
        let mut child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("Failed to spawn cat");

        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();
        let mut transport = StdioTransport::new(stdin, stdout);

        transport.send("ping\n").await.unwrap();
        let echoed = transport.receive().await.unwrap();
        assert_eq!(echoed, "ping\n");

        transport.close().await.unwrap();
        assert!(transport.send("late\n").await.is_err());

        let _ = child.kill().await;
    }

    #[tokio::test]
    async fn test_channel_transport_pair() {
        let (mut transport, mut peer) = ChannelTransport::pair();

        transport.send("to server").await.unwrap();
        assert_eq!(peer.from_client.recv().await.unwrap(), "to server");

        peer.to_client.send("to client".to_string()).unwrap();
        assert_eq!(transport.receive().await.unwrap(), "to client");

        drop(peer);
        assert!(transport.receive().await.is_err());
        assert!(!transport.is_connected());
    }

    #[test]
    fn test_utf8_accumulator_split_character() {
        let mut acc = Utf8Accumulator::default();

        // "é" is 0xC3 0xA9
        acc.push(b"caf\xC3");
        assert_eq!(acc.take_text().as_deref(), Some("caf"));
        assert_eq!(acc.leftover(), 1);
        assert!(acc.take_text().is_none());

        acc.push(b"\xA9!");
        assert_eq!(acc.take_text().as_deref(), Some("é!"));
        assert_eq!(acc.leftover(), 0);
    }
}
