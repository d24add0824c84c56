use super::{ChannelError, lock};
use crate::poll::Subscribe;
use crate::runtime::AbortOnDropJoinHandle;
use crate::streams::{InputStream, OutputStream, StreamError, StreamResult};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Number of elements a [`stream`] buffers before `write` waits for the
/// reader.
pub const DEFAULT_STREAM_CAPACITY: usize = 64 * 1024;

struct State<T> {
    buffer: VecDeque<T>,
    capacity: usize,
    writer_closed: bool,
    reader_closed: bool,
    write_in_flight: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

impl<T> Shared<T> {
    fn close_writer(&self) {
        lock(&self.state).writer_closed = true;
        self.notify.notify_waiters();
    }

    fn close_reader(&self) {
        {
            let mut state = lock(&self.state);
            state.reader_closed = true;
            state.buffer.clear();
        }
        self.notify.notify_waiters();
    }
}

/// Creates a connected single-producer single-consumer stream with the
/// default capacity.
pub fn stream<T>() -> (StreamWriter<T>, StreamReader<T>) {
    stream_with_capacity(DEFAULT_STREAM_CAPACITY)
}

/// Creates a connected stream which buffers at most `capacity` elements.
pub fn stream_with_capacity<T>(capacity: usize) -> (StreamWriter<T>, StreamReader<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            buffer: VecDeque::new(),
            capacity: capacity.max(1),
            writer_closed: false,
            reader_closed: false,
            write_in_flight: false,
        }),
        notify: Notify::new(),
    });
    (
        StreamWriter {
            shared: shared.clone(),
        },
        StreamReader {
            shared,
            producer: None,
        },
    )
}

/// The writing end of a [`stream`].
///
/// Dropping the writer ends the stream: the reader drains what is buffered
/// and then sees end-of-stream.
pub struct StreamWriter<T> {
    shared: Arc<Shared<T>>,
}

struct InFlight<'a, T>(&'a Shared<T>);

impl<T> Drop for InFlight<'_, T> {
    fn drop(&mut self) {
        lock(&self.0.state).write_in_flight = false;
    }
}

impl<T> StreamWriter<T> {
    /// Writes all of `items`, waiting for the reader to make room as needed.
    ///
    /// Fails with [`ChannelError::WriteInFlight`] if another `write` on this
    /// writer has not completed, and with [`ChannelError::Closed`] once the
    /// reader is gone. Items accepted before the reader went away are lost.
    pub async fn write(&self, items: Vec<T>) -> Result<(), ChannelError> {
        let _in_flight = {
            let mut state = lock(&self.shared.state);
            if state.write_in_flight {
                return Err(ChannelError::WriteInFlight);
            }
            if state.reader_closed {
                return Err(ChannelError::Closed);
            }
            state.write_in_flight = true;
            InFlight(&self.shared)
        };

        let mut items = VecDeque::from(items);
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = lock(&self.shared.state);
                if state.reader_closed {
                    return Err(ChannelError::Closed);
                }
                let room = state.capacity.saturating_sub(state.buffer.len());
                let n = room.min(items.len());
                state.buffer.extend(items.drain(..n));
                if n > 0 {
                    self.shared.notify.notify_waiters();
                }
                if items.is_empty() {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Returns whether the reader has gone away, in which case every further
    /// write fails.
    pub fn is_closed(&self) -> bool {
        lock(&self.shared.state).reader_closed
    }

    /// Ends the stream.
    pub fn close(self) {}
}

impl<T> Drop for StreamWriter<T> {
    fn drop(&mut self) {
        self.shared.close_writer();
    }
}

/// The reading end of a [`stream`].
///
/// Dropping the reader rejects the writer's pending and future writes, and
/// aborts the producer task attached through [`with_producer`](Self::with_producer).
pub struct StreamReader<T> {
    shared: Arc<Shared<T>>,
    producer: Option<AbortOnDropJoinHandle<()>>,
}

impl<T> StreamReader<T> {
    /// Ties `task` to this reader: it is aborted when the reader is dropped.
    pub fn with_producer(mut self, task: AbortOnDropJoinHandle<()>) -> Self {
        self.producer = Some(task);
        self
    }

    /// Reads up to `max` elements, waiting until at least one is available.
    ///
    /// Returns `None` once the writer is gone and everything it wrote has
    /// been read.
    pub async fn read(&mut self, max: usize) -> Option<Vec<T>> {
        loop {
            let notified = self.shared.notify.notified();
            if let Some(result) = self.try_take(max) {
                return result;
            }
            notified.await;
        }
    }

    /// Reads until end-of-stream and returns everything read.
    pub async fn read_all(&mut self) -> Vec<T> {
        let mut all = Vec::new();
        while let Some(chunk) = self.read(usize::MAX).await {
            all.extend(chunk);
        }
        all
    }

    /// Returns whether the writer is gone and the buffer drained.
    pub fn is_finished(&self) -> bool {
        let state = lock(&self.shared.state);
        state.writer_closed && state.buffer.is_empty()
    }

    /// Ends the stream from the reading side.
    pub fn close(self) {}

    /// `Some(Some(_))` with data, `Some(None)` at end-of-stream, `None` when
    /// nothing is available yet.
    fn try_take(&self, max: usize) -> Option<Option<Vec<T>>> {
        let mut state = lock(&self.shared.state);
        if !state.buffer.is_empty() {
            let n = max.min(state.buffer.len());
            let chunk = state.buffer.drain(..n).collect();
            drop(state);
            self.shared.notify.notify_waiters();
            return Some(Some(chunk));
        }
        if state.writer_closed {
            return Some(None);
        }
        None
    }
}

impl<T> Drop for StreamReader<T> {
    fn drop(&mut self) {
        self.shared.close_reader();
    }
}

#[async_trait::async_trait]
impl<T: Send + 'static> Subscribe for StreamReader<T> {
    async fn ready(&mut self) {
        loop {
            let notified = self.shared.notify.notified();
            {
                let state = lock(&self.shared.state);
                if !state.buffer.is_empty() || state.writer_closed {
                    return;
                }
            }
            notified.await;
        }
    }
}

#[async_trait::async_trait]
impl InputStream for StreamReader<u8> {
    fn read(&mut self, size: usize) -> StreamResult<Bytes> {
        match self.try_take(size) {
            Some(Some(bytes)) => Ok(Bytes::from(bytes)),
            Some(None) => Err(StreamError::Closed),
            None => Ok(Bytes::new()),
        }
    }

    async fn cancel(&mut self) {
        if let Some(task) = self.producer.take() {
            _ = task.cancel().await;
        }
    }
}

#[async_trait::async_trait]
impl<T: Send + 'static> Subscribe for StreamWriter<T> {
    async fn ready(&mut self) {
        loop {
            let notified = self.shared.notify.notified();
            {
                let state = lock(&self.shared.state);
                if state.reader_closed
                    || (!state.write_in_flight && state.buffer.len() < state.capacity)
                {
                    return;
                }
            }
            notified.await;
        }
    }
}

#[async_trait::async_trait]
impl OutputStream for StreamWriter<u8> {
    fn write(&mut self, bytes: Bytes) -> StreamResult<()> {
        let mut state = lock(&self.shared.state);
        if state.reader_closed {
            return Err(StreamError::Closed);
        }
        if state.write_in_flight {
            return Err(StreamError::trap(
                "write not permitted while a previous write is pending",
            ));
        }
        if bytes.len() > state.capacity - state.buffer.len() {
            return Err(StreamError::trap("write exceeded budget"));
        }
        state.buffer.extend(bytes.iter().copied());
        drop(state);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    fn flush(&mut self) -> StreamResult<()> {
        if self.is_closed() {
            return Err(StreamError::Closed);
        }
        Ok(())
    }

    fn check_write(&mut self) -> StreamResult<usize> {
        let state = lock(&self.shared.state);
        if state.reader_closed {
            return Err(StreamError::Closed);
        }
        if state.write_in_flight {
            return Ok(0);
        }
        Ok(state.capacity - state.buffer.len())
    }
}
