//! Framed duplex transport over a worker's stdin/stdout.
//!
//! One envelope per line. The reader keeps its partial-line buffer across
//! calls so a `receive` that times out mid-line loses nothing.

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use super::protocol::WorkerMessage;

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelError {
    /// The other end is gone (process exited or pipe broken).
    Closed(String),
    /// The envelope could not be serialized.
    Encode(String),
    /// The write did not complete within the bound.
    Timeout(Duration),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::Closed(reason) => write!(f, "channel closed: {}", reason),
            ChannelError::Encode(reason) => write!(f, "failed to encode envelope: {}", reason),
            ChannelError::Timeout(after) => write!(f, "channel write timed out after {:?}", after),
        }
    }
}

impl std::error::Error for ChannelError {}

/// Result of one `receive` call.
#[derive(Debug)]
pub enum Received {
    Message(WorkerMessage),
    Timeout,
    EndOfStream,
    /// A complete line that is not a valid envelope. Safe to skip.
    Malformed(String),
    /// The underlying read failed.
    Failed(String),
}

pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Writes one envelope followed by `\n` and flushes, bounded by `timeout`.
    pub async fn send<T: Serialize>(
        &mut self,
        envelope: &T,
        timeout: Duration,
    ) -> Result<(), ChannelError> {
        let mut line =
            serde_json::to_vec(envelope).map_err(|e| ChannelError::Encode(e.to_string()))?;
        line.push(b'\n');

        let write = async {
            self.inner.write_all(&line).await?;
            self.inner.flush().await
        };

        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ChannelError::Closed(e.to_string())),
            Err(_) => Err(ChannelError::Timeout(timeout)),
        }
    }
}

pub struct FrameReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            buf: Vec::new(),
        }
    }

    /// Waits for the next complete envelope. Blank lines are skipped.
    pub async fn receive(&mut self, timeout: Duration) -> Received {
        loop {
            let read = tokio::time::timeout(timeout, self.inner.read_until(b'\n', &mut self.buf));
            match read.await {
                Err(_) => return Received::Timeout,
                Ok(Err(e)) => return Received::Failed(e.to_string()),
                // A trailing unterminated line is flushed by the non-zero read before this.
                Ok(Ok(0)) => return Received::EndOfStream,
                Ok(Ok(_)) => {
                    let raw = std::mem::take(&mut self.buf);
                    let line = String::from_utf8_lossy(&raw);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    return match WorkerMessage::from_line(line) {
                        Ok(message) => Received::Message(message),
                        Err(e) => Received::Malformed(format!("{} (line: {})", e, truncate(line))),
                    };
                }
            }
        }
    }
}

fn truncate(line: &str) -> String {
    const MAX_CHARS: usize = 200;
    if line.chars().count() <= MAX_CHARS {
        line.to_string()
    } else {
        let head: String = line.chars().take(MAX_CHARS).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
