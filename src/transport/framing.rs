//! Terminator- and length-bounded framing over byte streams.

use super::{Terminator, TransportError};
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{timeout, Instant};
use tracing::debug;

/// Largest terminated response kept while waiting for its terminator.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Draining after a timeout gives up after this many quiet periods.
const MAX_DRAIN_PERIODS: u32 = 8;

/// How a read decides the response is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReadMode {
    /// Read until the end-of-string terminator. With [`Terminator::None`]
    /// whatever arrives in the next chunk is the response.
    #[default]
    Terminated,
    /// Read exactly this many bytes (binary and length-bound reads).
    Length(usize),
}

/// Bytes received past the end of the previous frame.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    pending: Vec<u8>,
}

impl FrameBuffer {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop anything buffered from an earlier exchange.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Bytes buffered past the last frame.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Read one frame from `reader`.
    ///
    /// The terminator itself is not part of the returned frame. There is no
    /// timeout here; callers wrap the future in `tokio::time::timeout`.
    pub async fn read_frame<R>(
        &mut self,
        reader: &mut R,
        terminator: Terminator,
        mode: ReadMode,
    ) -> io::Result<Vec<u8>>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut chunk = [0u8; 512];
        loop {
            if let Some(frame) = self.take_frame(terminator, mode) {
                return Ok(frame);
            }

            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "link closed before a complete response arrived",
                ));
            }
            self.pending.extend_from_slice(&chunk[..n]);

            let limit = match mode {
                ReadMode::Length(len) => len.max(MAX_FRAME_LEN),
                ReadMode::Terminated => MAX_FRAME_LEN,
            };
            if self.pending.len() > limit {
                self.pending.clear();
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("response exceeds {} bytes without a terminator", limit),
                ));
            }
        }
    }

    /// Read one frame, giving up after `after`.
    ///
    /// A timed-out reply may still be arriving. Its partial bytes are
    /// dropped and the link is drained until it stays quiet for `after`, so
    /// the next read starts on a fresh reply.
    pub async fn read_frame_within<R>(
        &mut self,
        reader: &mut R,
        terminator: Terminator,
        mode: ReadMode,
        after: Duration,
    ) -> Result<Vec<u8>, TransportError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let outcome = timeout(after, self.read_frame(reader, terminator, mode)).await;
        match outcome {
            Ok(frame) => Ok(frame?),
            Err(_) => {
                let partial = self.pending.len();
                self.pending.clear();
                let late = discard_late(reader, after).await;
                debug!(partial, late, "Dropped bytes of a timed-out response");
                Err(TransportError::Timeout {
                    operation: "read",
                    after,
                })
            }
        }
    }

    fn take_frame(&mut self, terminator: Terminator, mode: ReadMode) -> Option<Vec<u8>> {
        match mode {
            ReadMode::Length(len) => {
                (self.pending.len() >= len).then(|| self.pending.drain(..len).collect())
            }
            ReadMode::Terminated => {
                let term = terminator.as_bytes();
                if term.is_empty() {
                    return (!self.pending.is_empty()).then(|| std::mem::take(&mut self.pending));
                }
                let end = self
                    .pending
                    .windows(term.len())
                    .position(|window| window == term)?;
                let mut frame: Vec<u8> = self.pending.drain(..end + term.len()).collect();
                frame.truncate(end);
                Some(frame)
            }
        }
    }
}

/// Read and drop whatever arrives until the link is silent for `quiet`.
async fn discard_late<R>(reader: &mut R, quiet: Duration) -> usize
where
    R: AsyncRead + Unpin + ?Sized,
{
    let deadline = Instant::now() + quiet * MAX_DRAIN_PERIODS;
    let mut chunk = [0u8; 512];
    let mut dropped = 0;
    while Instant::now() < deadline {
        match timeout(quiet, reader.read(&mut chunk)).await {
            Ok(Ok(n)) if n > 0 => dropped += n,
            // quiet, closed or failed; the next read reports the link state
            _ => break,
        }
    }
    dropped
}
