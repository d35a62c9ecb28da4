//! Line framing
//!
//! The server speaks one JSON document per line on stdout and reads one per
//! line on stdin:
//!
//! ```text
//! {"Type":"request","Seq":1,"Command":"/codecheck","Arguments":{}}\n
//! ```
//!
//! `LineFraming` turns the transport's arbitrary chunks into whole lines and
//! appends the terminator on the way out.

use crate::io::transport::Transport;
use async_trait::async_trait;
use std::collections::VecDeque;
use tracing::{trace, warn};

/// Longest line accepted before the buffer is discarded
const MAX_LINE_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FramingError<T: std::error::Error + Send + Sync + 'static> {
    #[error("Transport error: {0}")]
    Transport(T),

    #[error("Outgoing message contains a line break")]
    EmbeddedNewline,

    #[error("Line too large: {size} bytes (max: {max})")]
    LineTooLarge { size: usize, max: usize },
}

/// Newline-delimited framing over any [`Transport`]
pub struct LineFraming<T: Transport> {
    transport: T,
    buffer: String,
    lines: VecDeque<String>,
}

impl<T: Transport> LineFraming<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            buffer: String::new(),
            lines: VecDeque::new(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Move every complete line out of the buffer
    fn split_lines(&mut self) -> Result<(), FramingError<T::Error>> {
        while let Some(end) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=end).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if !line.trim().is_empty() {
                self.lines.push_back(line.to_string());
            }
        }

        if self.buffer.len() > MAX_LINE_SIZE {
            let size = self.buffer.len();
            self.buffer.clear();
            return Err(FramingError::LineTooLarge {
                size,
                max: MAX_LINE_SIZE,
            });
        }

        Ok(())
    }
}

#[async_trait]
impl<T: Transport> Transport for LineFraming<T> {
    type Error = FramingError<T::Error>;

    async fn send(&mut self, message: &str) -> Result<(), Self::Error> {
        if message.contains('\n') {
            return Err(FramingError::EmbeddedNewline);
        }

        trace!("LineFraming: sending {} bytes", message.len());

        let mut line = String::with_capacity(message.len() + 1);
        line.push_str(message);
        line.push('\n');

        self.transport
            .send(&line)
            .await
            .map_err(FramingError::Transport)
    }

    /// Cancel safe as long as the inner transport's `receive` is
    async fn receive(&mut self) -> Result<String, Self::Error> {
        loop {
            if let Some(line) = self.lines.pop_front() {
                return Ok(line);
            }

            match self.transport.receive().await {
                Ok(chunk) => {
                    self.buffer.push_str(&chunk);
                    self.split_lines()?;
                }
                Err(e) => {
                    // an unterminated last line still counts at EOF
                    let tail = std::mem::take(&mut self.buffer);
                    if !tail.trim().is_empty() {
                        warn!("LineFraming: delivering unterminated line at end of stream");
                        self.lines.push_back(tail.trim_end_matches('\r').to_string());
                        continue;
                    }
                    return Err(FramingError::Transport(e));
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.transport
            .close()
            .await
            .map_err(FramingError::Transport)
    }

    fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }
}
