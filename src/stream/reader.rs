//! Raw chunk reader over an attached output stream.
//!
//! [`ChunkReader`] hands out whatever bytes each read returns, without any
//! framing: sentinel extraction happens later in the parser. A single read
//! fault is reported as [`ReadItem::Fault`] and reading continues, since the
//! runtime's own end-of-stream is the authoritative termination signal. Only
//! a run of `max_read_errors` consecutive faults gives up with
//! [`ReadItem::Exhausted`].

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

/// Initial read buffer reservation.
const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Outcome of one read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadItem {
    /// Bytes received from the agent.
    Chunk(Bytes),
    /// A recoverable read fault.
    Fault {
        /// Fault description.
        message: String,
        /// Consecutive faults so far, including this one.
        consecutive: u32,
    },
    /// Too many consecutive faults; the stream is considered lost.
    Exhausted {
        /// Description of the last fault.
        message: String,
    },
    /// The stream ended.
    Eof,
}

/// Reader yielding raw chunks from an agent's output.
#[derive(Debug)]
pub struct ChunkReader<R> {
    session_id: String,
    inner: R,
    buf: BytesMut,
    consecutive_errors: u32,
    max_read_errors: u32,
}

impl<R> ChunkReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Reader over `inner`; `max_read_errors` below one is treated as one.
    pub fn new(session_id: impl Into<String>, inner: R, max_read_errors: u32) -> Self {
        Self {
            session_id: session_id.into(),
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK_BYTES),
            consecutive_errors: 0,
            max_read_errors: max_read_errors.max(1),
        }
    }

    /// Read the next chunk.
    ///
    /// Cancel safe: a read dropped mid-flight loses no bytes.
    pub async fn next(&mut self) -> ReadItem {
        if self.buf.capacity() < READ_CHUNK_BYTES {
            self.buf.reserve(READ_CHUNK_BYTES);
        }
        match self.inner.read_buf(&mut self.buf).await {
            Ok(0) => {
                debug!(session_id = %self.session_id, "output stream closed");
                ReadItem::Eof
            }
            Ok(n) => {
                self.consecutive_errors = 0;
                debug!(session_id = %self.session_id, bytes = n, "output chunk received");
                ReadItem::Chunk(self.buf.split().freeze())
            }
            Err(err) => {
                self.consecutive_errors += 1;
                let message = format!("read failed: {err}");
                if self.consecutive_errors >= self.max_read_errors {
                    warn!(
                        session_id = %self.session_id,
                        error = %err,
                        consecutive = self.consecutive_errors,
                        "output stream lost"
                    );
                    ReadItem::Exhausted { message }
                } else {
                    warn!(
                        session_id = %self.session_id,
                        error = %err,
                        consecutive = self.consecutive_errors,
                        "output read failed, continuing"
                    );
                    ReadItem::Fault {
                        message,
                        consecutive: self.consecutive_errors,
                    }
                }
            }
        }
    }
}
