//! Preview3 channels: [`stream`] and [`future`].
//!
//! Unlike the Preview2 check-then-write protocol, both ends of these
//! channels are awaited directly. A [`StreamWriter`] has at most one `write`
//! outstanding and learns through its result when the reader has gone away.
//! A [`FutureWriter`] settles at most once.

mod future;
mod stream;

pub use self::future::{FutureReader, FutureWriter, future};
pub use self::stream::{DEFAULT_STREAM_CAPACITY, StreamReader, StreamWriter, stream, stream_with_capacity};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Rejection of a write on a P3 channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// The other end was closed or dropped.
    #[error("channel closed")]
    Closed,
    /// A previous `write` on this writer has not completed yet.
    #[error("a write is already in flight on this stream")]
    WriteInFlight,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
