use std::io;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

static CRLF: &[u8; 2] = b"\r\n";

/// Buffered reader handing out exact byte counts and CRLF terminated lines.
///
/// Every wait for the transport is bounded by a quantum. A quantum that brings new bytes restarts
/// the wait, one that brings nothing ends the request with `None`. Bytes that already arrived stay
/// buffered, so a request that timed out can be issued again and pick up where it left off.
/// The peer closing the stream is reported as an `UnexpectedEof` error, never as `None`.
pub struct ByteSource<R> {
    reader: R,
    // Data is read from the transport into the buffer, requests consume it from the front.
    buffer: BytesMut,
    quantum: Duration,
}

impl<R> ByteSource<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R, quantum: Duration) -> ByteSource<R> {
        ByteSource {
            reader,
            // Allocate the buffer with 4kb of capacity.
            buffer: BytesMut::with_capacity(4096),
            quantum,
        }
    }

    /// Number of bytes received but not consumed yet.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn quantum(&self) -> Duration {
        self.quantum
    }

    /// Waits, without a bound, until at least one byte is buffered. Returns `false` when the peer
    /// closed the stream and nothing is left.
    pub async fn readable(&mut self) -> io::Result<bool> {
        if !self.buffer.is_empty() {
            return Ok(true);
        }
        let n = self.reader.read_buf(&mut self.buffer).await?;
        Ok(n > 0)
    }

    /// Takes whatever the transport has ready without waiting. Returns `false` when the peer
    /// closed the stream. New bytes, if any, are buffered.
    pub fn try_fill(&mut self) -> io::Result<bool> {
        match self.reader.read_buf(&mut self.buffer).now_or_never() {
            None => Ok(true),
            Some(Ok(n)) => Ok(n > 0),
            Some(Err(e)) => Err(e),
        }
    }

    /// Consumes exactly `n` bytes.
    pub async fn read_exact(&mut self, n: usize) -> io::Result<Option<Bytes>> {
        self.buffer.reserve(n.saturating_sub(self.buffer.len()));
        while self.buffer.len() < n {
            if !self.fill().await? {
                return Ok(None);
            }
        }
        Ok(Some(self.buffer.split_to(n).freeze()))
    }

    /// Consumes one line, terminator included.
    pub async fn read_line(&mut self) -> io::Result<Option<Bytes>> {
        let mut searched = 0;
        loop {
            if let Some(index) = find_crlf(&self.buffer[searched..]) {
                let end = searched + index + CRLF.len();
                return Ok(Some(self.buffer.split_to(end).freeze()));
            }
            // The terminator may straddle two reads.
            searched = self.buffer.len().saturating_sub(1);

            if !self.fill().await? {
                return Ok(None);
            }
        }
    }

    // One quantum of waiting. `Ok(false)` means nothing arrived in time.
    async fn fill(&mut self) -> io::Result<bool> {
        match timeout(self.quantum, self.reader.read_buf(&mut self.buffer)).await {
            Err(_) => Ok(false),
            Ok(Ok(0)) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            )),
            Ok(Ok(_)) => Ok(true),
            Ok(Err(e)) => Err(e),
        }
    }
}

fn find_crlf(src: &[u8]) -> Option<usize> {
    src.windows(2).position(|window| window == CRLF)
}
