//! Line-based IPC over child process pipes.
//!
//! Both ends of every channel speak newline-delimited JSON. Reads go through
//! `Lines`, whose `next_line` is cancellation safe, so a reader can sit in a
//! `tokio::select!` without losing partial lines.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, Lines};

use crate::core::protocol::WireMessage;
use crate::core::PoolError;

/// Default buffer size for IPC (64KB).
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Buffered line reader for IPC.
pub struct LineReader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    /// Wrap a readable pipe.
    pub fn new(inner: R) -> Self {
        Self {
            lines: BufReader::with_capacity(DEFAULT_BUFFER_SIZE, inner).lines(),
        }
    }

    /// Read one line without its terminator. Returns `None` on EOF.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    pub async fn read_line(&mut self) -> std::io::Result<Option<String>> {
        self.lines.next_line().await
    }

    /// Read and decode the next message, skipping blank lines. Returns `None`
    /// on EOF.
    ///
    /// # Errors
    ///
    /// `PoolError::Protocol` for a line that does not decode, `PoolError::Io`
    /// for pipe failures.
    pub async fn recv<M: WireMessage>(&mut self) -> Result<Option<M>, PoolError> {
        loop {
            match self.read_line().await? {
                None => return Ok(None),
                Some(line) if line.trim().is_empty() => {}
                Some(line) => return M::from_line(&line).map(Some),
            }
        }
    }
}

/// Buffered line writer for IPC.
pub struct LineWriter<W> {
    writer: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin> LineWriter<W> {
    /// Wrap a writable pipe.
    pub fn new(inner: W) -> Self {
        Self {
            writer: BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, inner),
        }
    }

    /// Write a line (appends newline if not present) and flush.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error, e.g. a broken pipe once the peer exits.
    pub async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        if !line.ends_with('\n') {
            self.writer.write_all(b"\n").await?;
        }
        self.writer.flush().await
    }

    /// Encode and write one message.
    ///
    /// # Errors
    ///
    /// `PoolError::Serialization` if encoding fails, `PoolError::Io` if the
    /// write fails.
    pub async fn send<M: WireMessage>(&mut self, message: &M) -> Result<(), PoolError> {
        let line = message.to_line()?;
        self.write_line(&line).await?;
        Ok(())
    }
}
