use crate::poll::Subscribe;
use crate::runtime::AbortOnDropJoinHandle;
use crate::streams::{OutputStream, StreamError};
use anyhow::anyhow;
use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
struct WorkerState {
    alive: bool,
    pending: Option<Bytes>,
    write_in_flight: bool,
    write_budget: usize,
    flush_pending: bool,
    error: Option<anyhow::Error>,
}

impl WorkerState {
    fn check_error(&mut self) -> Result<(), StreamError> {
        if let Some(e) = self.error.take() {
            return Err(StreamError::LastOperationFailed(e));
        }
        if !self.alive {
            return Err(StreamError::Closed);
        }
        Ok(())
    }

    fn busy(&self) -> bool {
        self.write_in_flight || self.flush_pending
    }
}

struct Worker {
    state: Mutex<WorkerState>,
    new_work: tokio::sync::Notify,
    write_ready_changed: tokio::sync::Notify,
}

enum Job {
    Flush,
    Write(Bytes),
}

impl Worker {
    fn new(write_budget: usize) -> Self {
        Self {
            state: Mutex::new(WorkerState {
                alive: true,
                pending: None,
                write_in_flight: false,
                write_budget,
                flush_pending: false,
                error: None,
            }),
            new_work: tokio::sync::Notify::new(),
            write_ready_changed: tokio::sync::Notify::new(),
        }
    }

    async fn ready(&self) {
        loop {
            let notified = self.write_ready_changed.notified();
            {
                let state = self.state();
                if state.error.is_some() || !state.alive || !state.busy() {
                    return;
                }
            }
            notified.await;
        }
    }

    fn check_write(&self) -> Result<usize, StreamError> {
        let mut state = self.state();
        state.check_error()?;

        if state.busy() {
            return Ok(0);
        }

        Ok(state.write_budget)
    }

    fn state(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pop(&self) -> Option<Job> {
        let mut state = self.state();
        if let Some(bytes) = state.pending.take() {
            return Some(Job::Write(bytes));
        }
        if state.flush_pending && !state.write_in_flight {
            return Some(Job::Flush);
        }
        None
    }

    fn report_error(&self, e: std::io::Error) {
        {
            let mut state = self.state();
            state.alive = false;
            state.error = Some(e.into());
            state.write_in_flight = false;
            state.flush_pending = false;
        }
        self.write_ready_changed.notify_waiters();
    }

    async fn work<T: tokio::io::AsyncWrite + Send + Unpin + 'static>(&self, mut writer: T) {
        use tokio::io::AsyncWriteExt;
        loop {
            let notified = self.new_work.notified();
            while let Some(job) = self.pop() {
                match job {
                    Job::Flush => {
                        if let Err(e) = writer.flush().await {
                            self.report_error(e);
                            return;
                        }

                        tracing::trace!("worker marking flush complete");
                        self.state().flush_pending = false;
                    }

                    Job::Write(mut bytes) => {
                        tracing::trace!(len = bytes.len(), "worker writing");
                        if let Err(e) = writer.write_all_buf(&mut bytes).await {
                            self.report_error(e);
                            return;
                        }
                        self.state().write_in_flight = false;
                    }
                }

                self.write_ready_changed.notify_waiters();
            }
            notified.await;
        }
    }
}

/// Provides an [`OutputStream`] impl from a [`tokio::io::AsyncWrite`] impl.
///
/// At most one write is in flight at any time. While it drains, or while a
/// flush is pending, [`check_write`](OutputStream::check_write) reports a
/// permit of zero and a further `write` traps.
pub struct AsyncWriteStream {
    worker: Arc<Worker>,
    join_handle: Option<AbortOnDropJoinHandle<()>>,
}

impl AsyncWriteStream {
    /// Create a [`AsyncWriteStream`]. `write_budget` is the largest permit
    /// handed out by `check_write`.
    pub fn new<T: tokio::io::AsyncWrite + Send + Unpin + 'static>(
        write_budget: usize,
        writer: T,
    ) -> Self {
        let worker = Arc::new(Worker::new(write_budget));

        let w = Arc::clone(&worker);
        let join_handle = crate::runtime::spawn(async move { w.work(writer).await });

        AsyncWriteStream {
            worker,
            join_handle: Some(join_handle),
        }
    }
}

#[async_trait::async_trait]
impl OutputStream for AsyncWriteStream {
    fn write(&mut self, bytes: Bytes) -> Result<(), StreamError> {
        let mut state = self.worker.state();
        state.check_error()?;
        if state.write_in_flight {
            return Err(StreamError::Trap(anyhow!(
                "write not permitted while a previous write is pending"
            )));
        }
        if state.flush_pending {
            return Err(StreamError::Trap(anyhow!(
                "write not permitted while flush pending"
            )));
        }
        if bytes.len() > state.write_budget {
            return Err(StreamError::Trap(anyhow!("write exceeded budget")));
        }
        if bytes.is_empty() {
            return Ok(());
        }
        state.pending = Some(bytes);
        state.write_in_flight = true;
        drop(state);
        self.worker.new_work.notify_one();
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StreamError> {
        let mut state = self.worker.state();
        state.check_error()?;

        state.flush_pending = true;
        drop(state);
        self.worker.new_work.notify_one();

        Ok(())
    }

    fn check_write(&mut self) -> Result<usize, StreamError> {
        self.worker.check_write()
    }

    async fn cancel(&mut self) {
        if let Some(task) = self.join_handle.take() {
            _ = task.cancel().await;
        }
        let mut state = self.worker.state();
        state.alive = false;
        state.pending = None;
        state.write_in_flight = false;
        state.flush_pending = false;
        drop(state);
        self.worker.write_ready_changed.notify_waiters();
    }
}

#[async_trait::async_trait]
impl Subscribe for AsyncWriteStream {
    async fn ready(&mut self) {
        self.worker.ready().await;
    }
}
