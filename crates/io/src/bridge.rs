//! A synchronous call surface over asynchronous host operations.
//!
//! [`SyncBridge`] owns a dedicated OS thread running its own current-thread
//! tokio runtime. Each [`call`](SyncBridge::call) ships a future-producing
//! closure to that thread and blocks the calling thread until the single
//! reply for that call comes back.
//!
//! Once the worker thread has exited, every call fails with an error
//! instead of blocking.

use anyhow::{Result, anyhow};
use std::future::Future;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};

type Job = Box<dyn FnOnce(&tokio::runtime::Runtime) + Send>;

pub struct SyncBridge {
    jobs: Option<mpsc::UnboundedSender<Job>>,
    thread: Option<JoinHandle<()>>,
}

impl SyncBridge {
    /// Starts the worker thread, named `name`.
    pub fn new(name: &str) -> Result<Self> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    job(&rt);
                }
                tracing::debug!("sync bridge worker exiting");
            })?;
        tracing::debug!(name, "sync bridge worker started");
        Ok(SyncBridge {
            jobs: Some(jobs),
            thread: Some(thread),
        })
    }

    /// Runs the future produced by `f` on the worker thread and blocks until
    /// it completes.
    ///
    /// Every call gets exactly one answer: the future's output, or an error
    /// if it panicked or the worker is gone. This blocks the calling thread,
    /// so async callers must wrap it in `tokio::task::block_in_place`.
    pub fn call<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move |rt| {
            let reply = rt
                .block_on(rt.spawn(f()))
                .map_err(|e| anyhow!("sync bridge call failed: {e}"));
            // The caller may have given up; nothing to do then.
            _ = reply_tx.send(reply);
        });

        self.jobs
            .as_ref()
            .ok_or_else(|| anyhow!("sync bridge is shut down"))?
            .send(job)
            .map_err(|_| anyhow!("sync bridge worker has exited"))?;

        reply_rx
            .blocking_recv()
            .map_err(|_| anyhow!("sync bridge worker has exited"))?
    }
}

impl Drop for SyncBridge {
    fn drop(&mut self) {
        drop(self.jobs.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("sync bridge worker panicked");
            }
        }
    }
}
