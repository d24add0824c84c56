//! The host-side traits behind `wasi:io/streams`.
//!
//! Both directions are non-blocking at the core: `read`, `write`, `flush`
//! and `check_write` return at once, and readiness is awaited through
//! [`Subscribe`]. The `blocking_*` variants are built from those two pieces.

use crate::poll::Subscribe;
use crate::table::TableError;
use bytes::Bytes;

/// The `error` resource of `wasi:io/error`.
pub type Error = anyhow::Error;

pub type StreamResult<T> = Result<T, StreamError>;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// End of stream. Not a failure, and reported on every call after it.
    #[error("closed")]
    Closed,
    /// An I/O failure; the stream is closed from now on.
    #[error("last operation failed: {0}")]
    LastOperationFailed(Error),
    /// The caller broke the stream contract, e.g. by exceeding a permit.
    #[error("trap: {0}")]
    Trap(Error),
}

impl StreamError {
    pub fn trap(msg: &str) -> StreamError {
        StreamError::Trap(anyhow::anyhow!("{msg}"))
    }

    /// The `stream-error` case this maps to; traps never reach the guest.
    pub fn tag(&self) -> Option<&'static str> {
        match self {
            StreamError::Closed => Some("closed"),
            StreamError::LastOperationFailed(_) => Some("last-operation-failed"),
            StreamError::Trap(_) => None,
        }
    }
}

impl From<TableError> for StreamError {
    fn from(error: TableError) -> Self {
        StreamError::Trap(error.into())
    }
}

/// A readable byte stream, stored in the table as `input-stream`.
#[async_trait::async_trait]
pub trait InputStream: Subscribe {
    /// Returns up to `size` bytes that are available right now.
    ///
    /// An empty result means nothing has arrived yet. Once the source has
    /// ended and the buffered bytes are gone this fails with
    /// [`StreamError::Closed`].
    fn read(&mut self, size: usize) -> StreamResult<Bytes>;

    /// Waits for readiness once, then reads.
    async fn blocking_read(&mut self, size: usize) -> StreamResult<Bytes> {
        self.ready().await;
        self.read(size)
    }

    /// Like [`read`](Self::read), but discards the bytes and returns how
    /// many there were.
    fn skip(&mut self, size: usize) -> StreamResult<usize> {
        self.read(size).map(|bytes| bytes.len())
    }

    async fn blocking_skip(&mut self, size: usize) -> StreamResult<usize> {
        self.blocking_read(size).await.map(|bytes| bytes.len())
    }

    /// Stops any background work feeding this stream.
    async fn cancel(&mut self) {}
}

/// A writable byte stream, stored in the table as `output-stream`.
///
/// Writes are permit based. [`check_write`](Self::check_write) reports how
/// many bytes the next [`write`](Self::write) may carry, and it reports
/// zero while an earlier write or flush is still draining. Writing more
/// than the permit, or writing again before a new permit, is a trap.
#[async_trait::async_trait]
pub trait OutputStream: Subscribe {
    /// Hands `bytes` to the stream without waiting for them to drain.
    fn write(&mut self, bytes: Bytes) -> StreamResult<()>;

    /// Starts flushing; `check_write` stays at zero until it is done.
    fn flush(&mut self) -> StreamResult<()>;

    /// The current write permit, or the error that ended the stream.
    fn check_write(&mut self) -> StreamResult<usize>;

    /// Writes all of `bytes` as permits allow, then flushes and waits for
    /// the flush to finish.
    async fn blocking_write_and_flush(&mut self, mut bytes: Bytes) -> StreamResult<()> {
        while !bytes.is_empty() {
            let permit = self.write_ready().await?;
            self.write(bytes.split_to(permit.min(bytes.len())))?;
        }
        self.flush()?;
        self.write_ready().await.map(drop)
    }

    /// Writes `len` zero bytes under the same permit rules as `write`.
    fn write_zeroes(&mut self, len: usize) -> StreamResult<()> {
        self.write(Bytes::from(vec![0; len]))
    }

    async fn blocking_write_zeroes_and_flush(&mut self, len: usize) -> StreamResult<()> {
        self.blocking_write_and_flush(Bytes::from(vec![0; len])).await
    }

    /// Waits until the permit is nonzero and returns it.
    async fn write_ready(&mut self) -> StreamResult<usize> {
        loop {
            self.ready().await;
            match self.check_write()? {
                0 => tokio::task::yield_now().await,
                permit => return Ok(permit),
            }
        }
    }

    /// Stops any background work draining this stream.
    async fn cancel(&mut self) {}
}

pub type DynInputStream = Box<dyn InputStream>;

pub type DynOutputStream = Box<dyn OutputStream>;

#[async_trait::async_trait]
impl Subscribe for DynInputStream {
    async fn ready(&mut self) {
        (**self).ready().await
    }
}

#[async_trait::async_trait]
impl Subscribe for DynOutputStream {
    async fn ready(&mut self) {
        (**self).ready().await
    }
}
