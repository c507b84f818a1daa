//! Byte transports underneath a connection
//!
//! A transport moves whole frames: `send` writes one encoded message and
//! `receive` returns the next complete length-prefixed message. Receiving
//! is cancel-safe. Bytes that arrive before a deadline elapses stay in the
//! transport's buffer and become part of the next frame handed out, so the
//! stream never loses its framing because a caller gave up waiting.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::connection::timeout::Deadline;
use crate::error::{ProtocolError, Result};
use crate::wire::{DEFAULT_MAX_MESSAGE_SIZE, HEADER_LEN, frame_length};

pub mod tcp;

pub use tcp::{TcpTransport, connect};

/// Frame-oriented transport used by a connection.
#[async_trait]
pub trait Transport: Send {
    /// Write one complete message.
    async fn send(&mut self, bytes: &[u8]) -> Result<()>;

    /// Wait for the next complete frame, giving up when `deadline` passes.
    ///
    /// # Returns
    /// * `Ok(frame)` - One message, exactly as long as its length prefix says
    /// * `Err(Timeout)` - Deadline elapsed; partial bytes stay buffered
    /// * `Err(Io | Protocol)` - Transport is no longer usable
    async fn receive(&mut self, deadline: Deadline) -> Result<Vec<u8>>;

    /// Bytes received but not yet handed out as a frame.
    fn buffered(&self) -> usize;

    /// Human-readable peer description for logs.
    fn peer(&self) -> &str;
}

/// [`Transport`] over any async byte stream.
pub struct StreamTransport<S> {
    stream: S,
    read_buf: Vec<u8>,
    max_message_size: usize,
    peer: String,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap a connected stream.
    ///
    /// # Arguments
    /// * `stream` - Connected byte stream
    /// * `peer` - Peer description used in log lines
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        Self {
            stream,
            read_buf: Vec::with_capacity(8 * 1024),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            peer: peer.into(),
        }
    }

    /// Reject frames larger than `max` bytes.
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    /// Split the next complete frame off the read buffer.
    fn take_frame(&mut self) -> std::result::Result<Option<Vec<u8>>, ProtocolError> {
        let Some(declared) = frame_length(&self.read_buf) else {
            return Ok(None);
        };
        if declared < HEADER_LEN as i32 {
            trace!(
                "Invalid frame prefix from {}: {}",
                self.peer,
                hex::encode(&self.read_buf[..self.read_buf.len().min(16)])
            );
            return Err(ProtocolError::InvalidLength(declared));
        }

        let len = declared as usize;
        if len > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                length: len,
                max: self.max_message_size,
            });
        }
        if self.read_buf.len() < len {
            return Ok(None);
        }

        let rest = self.read_buf.split_off(len);
        Ok(Some(std::mem::replace(&mut self.read_buf, rest)))
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        trace!("Sent {} bytes to {}", bytes.len(), self.peer);
        Ok(())
    }

    async fn receive(&mut self, deadline: Deadline) -> Result<Vec<u8>> {
        loop {
            if let Some(frame) = self.take_frame()? {
                trace!("Received {} byte frame from {}", frame.len(), self.peer);
                return Ok(frame);
            }

            self.read_buf.reserve(8 * 1024);
            // read_buf is cancel-safe: a dropped read has consumed nothing.
            let n = deadline
                .run(self.stream.read_buf(&mut self.read_buf))
                .await??;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("{} closed the connection", self.peer),
                )
                .into());
            }
        }
    }

    fn buffered(&self) -> usize {
        self.read_buf.len()
    }

    fn peer(&self) -> &str {
        &self.peer
    }
}
