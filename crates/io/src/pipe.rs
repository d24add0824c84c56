//! Ready-made stream resources: in-memory buffers, fixed sinks and sources,
//! and adapters over tokio's `AsyncRead`/`AsyncWrite`.
use crate::poll::Subscribe;
use crate::runtime::AbortOnDropJoinHandle;
use crate::streams::{InputStream, OutputStream, StreamError, StreamResult};
use bytes::{Bytes, BytesMut};
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

pub use crate::write_stream::AsyncWriteStream;

/// Largest chunk the [`AsyncReadStream`] task reads at once.
const READ_CHUNK: usize = 4096;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Serves a fixed byte buffer, then reports [`StreamError::Closed`].
///
/// Clones drain the same buffer.
#[derive(Debug, Clone)]
pub struct MemoryInputPipe {
    remaining: Arc<Mutex<Bytes>>,
}

impl MemoryInputPipe {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        MemoryInputPipe {
            remaining: Arc::new(Mutex::new(bytes.into())),
        }
    }
}

#[async_trait::async_trait]
impl InputStream for MemoryInputPipe {
    fn read(&mut self, size: usize) -> StreamResult<Bytes> {
        let mut remaining = lock(&self.remaining);
        if remaining.is_empty() {
            return Err(StreamError::Closed);
        }
        let n = size.min(remaining.len());
        Ok(remaining.split_to(n))
    }
}

#[async_trait::async_trait]
impl Subscribe for MemoryInputPipe {
    async fn ready(&mut self) {}
}

/// Collects writes in memory, up to `capacity` bytes in total.
///
/// Once full the pipe is closed. Clones share the collected bytes, so a
/// clone kept by the host observes what the guest wrote.
#[derive(Debug, Clone)]
pub struct MemoryOutputPipe {
    capacity: usize,
    written: Arc<Mutex<BytesMut>>,
}

impl MemoryOutputPipe {
    pub fn new(capacity: usize) -> Self {
        MemoryOutputPipe {
            capacity,
            written: Arc::new(Mutex::new(BytesMut::new())),
        }
    }

    /// A copy of everything written so far.
    pub fn contents(&self) -> Bytes {
        Bytes::copy_from_slice(&lock(&self.written))
    }

    fn room(&self) -> usize {
        self.capacity.saturating_sub(lock(&self.written).len())
    }
}

#[async_trait::async_trait]
impl OutputStream for MemoryOutputPipe {
    fn write(&mut self, bytes: Bytes) -> StreamResult<()> {
        if bytes.len() > self.room() {
            return Err(StreamError::trap("write exceeds the last check-write permit"));
        }
        lock(&self.written).extend_from_slice(&bytes);
        Ok(())
    }

    fn flush(&mut self) -> StreamResult<()> {
        Ok(())
    }

    fn check_write(&mut self) -> StreamResult<usize> {
        match self.room() {
            0 => Err(StreamError::Closed),
            n => Ok(n),
        }
    }
}

#[async_trait::async_trait]
impl Subscribe for MemoryOutputPipe {
    async fn ready(&mut self) {}
}

enum ReadState {
    /// Nothing buffered; the reader task may still deliver.
    Open,
    Buffered(Bytes),
    /// The source ended or failed. The error is reported once.
    Ending(StreamError),
    Ended,
}

/// An [`InputStream`] over a [`tokio::io::AsyncRead`].
///
/// A background task reads ahead one chunk of at most 4 KiB. `read` only
/// looks at what that task already delivered, so it never waits.
pub struct AsyncReadStream {
    state: ReadState,
    chunks: mpsc::Receiver<StreamResult<Bytes>>,
    task: Option<AbortOnDropJoinHandle<()>>,
}

impl AsyncReadStream {
    /// Starts the reader task on the ambient tokio runtime.
    pub fn new<T: tokio::io::AsyncRead + Send + Unpin + 'static>(mut source: T) -> Self {
        let (tx, chunks) = mpsc::channel(1);
        let task = crate::runtime::spawn(async move {
            use tokio::io::AsyncReadExt;
            loop {
                let mut buf = BytesMut::with_capacity(READ_CHUNK);
                let chunk = match source.read_buf(&mut buf).await {
                    Ok(0) => Err(StreamError::Closed),
                    Ok(_) => Ok(buf.freeze()),
                    Err(e) => {
                        tracing::debug!(error = %e, "stream source failed");
                        Err(StreamError::LastOperationFailed(e.into()))
                    }
                };
                let last = chunk.is_err();
                if tx.send(chunk).await.is_err() || last {
                    break;
                }
            }
        });
        AsyncReadStream {
            state: ReadState::Open,
            chunks,
            task: Some(task),
        }
    }

    /// Records what the reader task delivered; `None` means it is gone.
    fn deliver(&mut self, chunk: Option<StreamResult<Bytes>>) {
        self.state = match chunk {
            Some(Ok(bytes)) => ReadState::Buffered(bytes),
            Some(Err(e)) => ReadState::Ending(e),
            None => ReadState::Ending(StreamError::Closed),
        };
    }
}

#[async_trait::async_trait]
impl InputStream for AsyncReadStream {
    fn read(&mut self, size: usize) -> StreamResult<Bytes> {
        if let ReadState::Open = self.state {
            match self.chunks.try_recv() {
                Ok(chunk) => self.deliver(Some(chunk)),
                Err(mpsc::error::TryRecvError::Empty) => return Ok(Bytes::new()),
                Err(mpsc::error::TryRecvError::Disconnected) => self.deliver(None),
            }
        }
        match mem::replace(&mut self.state, ReadState::Ended) {
            ReadState::Buffered(mut bytes) => {
                let rest = bytes.split_off(size.min(bytes.len()));
                self.state = if rest.is_empty() {
                    ReadState::Open
                } else {
                    ReadState::Buffered(rest)
                };
                Ok(bytes)
            }
            ReadState::Ending(e) => Err(e),
            ReadState::Open | ReadState::Ended => Err(StreamError::Closed),
        }
    }

    async fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            _ = task.cancel().await;
        }
    }
}

#[async_trait::async_trait]
impl Subscribe for AsyncReadStream {
    async fn ready(&mut self) {
        if let ReadState::Open = self.state {
            let chunk = self.chunks.recv().await;
            self.deliver(chunk);
        }
    }
}

/// Accepts and discards every write.
#[derive(Copy, Clone)]
pub struct SinkOutputStream;

#[async_trait::async_trait]
impl OutputStream for SinkOutputStream {
    fn write(&mut self, _: Bytes) -> StreamResult<()> {
        Ok(())
    }

    fn flush(&mut self) -> StreamResult<()> {
        Ok(())
    }

    fn check_write(&mut self) -> StreamResult<usize> {
        Ok(usize::MAX)
    }
}

#[async_trait::async_trait]
impl Subscribe for SinkOutputStream {
    async fn ready(&mut self) {}
}

/// An input stream that has already ended.
#[derive(Copy, Clone)]
pub struct ClosedInputStream;

#[async_trait::async_trait]
impl InputStream for ClosedInputStream {
    fn read(&mut self, _: usize) -> StreamResult<Bytes> {
        Err(StreamError::Closed)
    }
}

#[async_trait::async_trait]
impl Subscribe for ClosedInputStream {
    async fn ready(&mut self) {}
}

/// An output stream that rejects everything as closed.
#[derive(Copy, Clone)]
pub struct ClosedOutputStream;

#[async_trait::async_trait]
impl OutputStream for ClosedOutputStream {
    fn write(&mut self, _: Bytes) -> StreamResult<()> {
        Err(StreamError::Closed)
    }

    fn flush(&mut self) -> StreamResult<()> {
        Err(StreamError::Closed)
    }

    fn check_write(&mut self) -> StreamResult<usize> {
        Err(StreamError::Closed)
    }
}

#[async_trait::async_trait]
impl Subscribe for ClosedOutputStream {
    async fn ready(&mut self) {}
}
