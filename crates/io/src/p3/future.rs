use super::lock;
use crate::poll::Subscribe;
use crate::runtime::AbortOnDropJoinHandle;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

struct State<T> {
    value: Option<T>,
    settled: bool,
    writer_gone: bool,
    reader_gone: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

/// Creates a connected single-value channel.
pub fn future<T>() -> (FutureWriter<T>, FutureReader<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            value: None,
            settled: false,
            writer_gone: false,
            reader_gone: false,
        }),
        notify: Notify::new(),
    });
    (
        FutureWriter {
            shared: shared.clone(),
        },
        FutureReader {
            shared,
            producer: None,
        },
    )
}

/// The writing end of a [`future`].
pub struct FutureWriter<T> {
    shared: Arc<Shared<T>>,
}

impl<T> FutureWriter<T> {
    /// Settles the future with `value`.
    ///
    /// Only the first call settles it; later calls are no-ops. Returns
    /// whether `value` will reach the reader, which is `false` after
    /// settlement or once the reader is gone.
    pub fn write(&mut self, value: T) -> bool {
        {
            let mut state = lock(&self.shared.state);
            if state.settled {
                return false;
            }
            state.settled = true;
            if state.reader_gone {
                return false;
            }
            state.value = Some(value);
        }
        self.shared.notify.notify_waiters();
        true
    }

    /// Returns whether this future already settled.
    pub fn is_settled(&self) -> bool {
        lock(&self.shared.state).settled
    }

    /// Returns whether the reader has gone away.
    pub fn is_closed(&self) -> bool {
        lock(&self.shared.state).reader_gone
    }
}

impl<T> Drop for FutureWriter<T> {
    fn drop(&mut self) {
        lock(&self.shared.state).writer_gone = true;
        self.shared.notify.notify_waiters();
    }
}

/// The reading end of a [`future`].
pub struct FutureReader<T> {
    shared: Arc<Shared<T>>,
    producer: Option<AbortOnDropJoinHandle<()>>,
}

impl<T> FutureReader<T> {
    /// Ties `task` to this reader: it is aborted when the reader is dropped.
    pub fn with_producer(mut self, task: AbortOnDropJoinHandle<()>) -> Self {
        self.producer = Some(task);
        self
    }

    /// Waits for the value. `None` means the writer went away without
    /// settling.
    pub async fn read(mut self) -> Option<T> {
        self.wait().await;
        let value = lock(&self.shared.state).value.take();
        value
    }

    /// Returns whether [`read`](Self::read) would complete without waiting.
    pub fn is_ready(&self) -> bool {
        let state = lock(&self.shared.state);
        state.settled || state.writer_gone
    }

    async fn wait(&mut self) {
        loop {
            let notified = self.shared.notify.notified();
            if self.is_ready() {
                return;
            }
            notified.await;
        }
    }
}

impl<T> Drop for FutureReader<T> {
    fn drop(&mut self) {
        let mut state = lock(&self.shared.state);
        state.reader_gone = true;
        state.value = None;
    }
}

#[async_trait::async_trait]
impl<T: Send + 'static> Subscribe for FutureReader<T> {
    async fn ready(&mut self) {
        self.wait().await
    }
}
