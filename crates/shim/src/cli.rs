//! Command-line environment and standard I/O.
//!
//! The context holds one [`StdinStream`] and two [`StdoutStream`]s. Every
//! Preview2 `get-stdin`/`get-stdout`/`get-stderr` call asks them for a fresh
//! stream resource. The Preview3 functions instead hand over a
//! [`StreamReader`] whose contents a background task copies to the
//! configured output. Installing a new one replaces the old one: its task is
//! aborted, its reader dropped, and the guest's old writer starts rejecting.

use crate::ctx::WasiCtx;
use bytes::Bytes;
use preview_shim_io::p3::{FutureReader, StreamReader, future, stream};
use preview_shim_io::pipe::{
    AsyncReadStream, ClosedInputStream, ClosedOutputStream, MemoryInputPipe, MemoryOutputPipe,
    SinkOutputStream,
};
use preview_shim_io::runtime::{AbortOnDropJoinHandle, spawn, with_ambient_tokio_runtime};
use preview_shim_io::{InputStream, OutputStream, StreamError, StreamResult, Subscribe};
use std::io::Write;
use std::sync::Arc;

/// Largest chunk moved at once between a P3 stream and stdio.
const STDIO_CHUNK: usize = 4096;

/// A source of stdin streams for a context.
pub trait StdinStream: Send {
    /// Creates a fresh stream which reads from this source.
    fn p2_stream(&self) -> Box<dyn InputStream>;
}

/// A sink of stdout or stderr streams for a context.
pub trait StdoutStream: Send {
    /// Creates a fresh stream which writes to this sink.
    fn p2_stream(&self) -> Box<dyn OutputStream>;
}

impl StdinStream for MemoryInputPipe {
    fn p2_stream(&self) -> Box<dyn InputStream> {
        Box::new(self.clone())
    }
}

impl StdinStream for ClosedInputStream {
    fn p2_stream(&self) -> Box<dyn InputStream> {
        Box::new(*self)
    }
}

impl StdoutStream for MemoryOutputPipe {
    fn p2_stream(&self) -> Box<dyn OutputStream> {
        Box::new(self.clone())
    }
}

impl StdoutStream for SinkOutputStream {
    fn p2_stream(&self) -> Box<dyn OutputStream> {
        Box::new(*self)
    }
}

impl StdoutStream for ClosedOutputStream {
    fn p2_stream(&self) -> Box<dyn OutputStream> {
        Box::new(*self)
    }
}

/// A [`StdinStream`] over any [`tokio::io::AsyncRead`].
///
/// All streams created from one value share the underlying reader, so
/// input is consumed once no matter how many handles read it.
#[derive(Clone)]
pub struct AsyncStdinStream(Arc<tokio::sync::Mutex<AsyncReadStream>>);

impl AsyncStdinStream {
    pub fn new(s: impl tokio::io::AsyncRead + Send + Unpin + 'static) -> Self {
        let stream = with_ambient_tokio_runtime(|| AsyncReadStream::new(s));
        Self(Arc::new(tokio::sync::Mutex::new(stream)))
    }
}

impl StdinStream for AsyncStdinStream {
    fn p2_stream(&self) -> Box<dyn InputStream> {
        Box::new(self.clone())
    }
}

#[async_trait::async_trait]
impl InputStream for AsyncStdinStream {
    fn read(&mut self, size: usize) -> StreamResult<Bytes> {
        match self.0.try_lock() {
            Ok(mut stream) => stream.read(size),
            Err(_) => Err(StreamError::trap("concurrent reads of stdin are not supported")),
        }
    }

    fn skip(&mut self, size: usize) -> StreamResult<usize> {
        match self.0.try_lock() {
            Ok(mut stream) => stream.skip(size),
            Err(_) => Err(StreamError::trap("concurrent skips of stdin are not supported")),
        }
    }
}

#[async_trait::async_trait]
impl Subscribe for AsyncStdinStream {
    async fn ready(&mut self) {
        self.0.lock().await.ready().await
    }
}

/// Returns a stdin source reading the host process's stdin.
pub fn stdin() -> AsyncStdinStream {
    AsyncStdinStream::new(tokio::io::stdin())
}

/// The host process's stdout.
#[derive(Copy, Clone, Default)]
pub struct Stdout;

/// Returns a stdout sink writing to the host process's stdout.
pub fn stdout() -> Stdout {
    Stdout
}

impl StdoutStream for Stdout {
    fn p2_stream(&self) -> Box<dyn OutputStream> {
        Box::new(StdioOutputStream::Stdout)
    }
}

/// The host process's stderr.
#[derive(Copy, Clone, Default)]
pub struct Stderr;

/// Returns a stderr sink writing to the host process's stderr.
pub fn stderr() -> Stderr {
    Stderr
}

impl StdoutStream for Stderr {
    fn p2_stream(&self) -> Box<dyn OutputStream> {
        Box::new(StdioOutputStream::Stderr)
    }
}

/// Writes synchronously to the process's stdout or stderr.
enum StdioOutputStream {
    Stdout,
    Stderr,
}

impl OutputStream for StdioOutputStream {
    fn write(&mut self, bytes: Bytes) -> StreamResult<()> {
        let result = match self {
            StdioOutputStream::Stdout => std::io::stdout().write_all(&bytes),
            StdioOutputStream::Stderr => std::io::stderr().write_all(&bytes),
        };
        result.map_err(|e| StreamError::LastOperationFailed(anyhow::anyhow!(e)))
    }

    fn flush(&mut self) -> StreamResult<()> {
        let result = match self {
            StdioOutputStream::Stdout => std::io::stdout().flush(),
            StdioOutputStream::Stderr => std::io::stderr().flush(),
        };
        result.map_err(|e| StreamError::LastOperationFailed(anyhow::anyhow!(e)))
    }

    fn check_write(&mut self) -> StreamResult<usize> {
        Ok(1024 * 1024)
    }
}

#[async_trait::async_trait]
impl Subscribe for StdioOutputStream {
    async fn ready(&mut self) {}
}

/// Copies everything from `data` into `output`. The returned future
/// resolves once all of it was written, and to `None` if the copy is
/// aborted or fails.
fn pump(
    mut output: Box<dyn OutputStream>,
    mut data: StreamReader<u8>,
) -> (AbortOnDropJoinHandle<()>, FutureReader<()>) {
    let (mut done_tx, done_rx) = future();
    let task = spawn(async move {
        while let Some(chunk) = data.read(STDIO_CHUNK).await {
            if let Err(err) = output.blocking_write_and_flush(chunk.into()).await {
                tracing::debug!(?err, "stdio write failed");
                return;
            }
        }
        done_tx.write(());
    });
    (task, done_rx)
}

impl WasiCtx {
    /// Returns the environment variables given to the guest.
    pub fn environment(&self) -> &[(String, String)] {
        &self.env
    }

    /// Returns the arguments given to the guest.
    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn initial_cwd(&self) -> Option<&str> {
        self.initial_cwd.as_deref()
    }

    /// Returns a P3 stream of stdin's contents.
    pub fn read_via_stream(&mut self) -> StreamReader<u8> {
        let mut input = self.stdin.p2_stream();
        let (tx, rx) = stream();
        let task = spawn(async move {
            loop {
                match input.blocking_read(STDIO_CHUNK).await {
                    Ok(bytes) if bytes.is_empty() => continue,
                    Ok(bytes) => {
                        if tx.write(bytes.to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Err(StreamError::Closed) => break,
                    Err(err) => {
                        tracing::debug!(?err, "stdin read failed");
                        break;
                    }
                }
            }
        });
        rx.with_producer(task)
    }

    /// Sends `data` to stdout, replacing any stream installed before.
    pub fn write_stdout_via_stream(&mut self, data: StreamReader<u8>) -> FutureReader<()> {
        let (task, done) = pump(self.stdout.p2_stream(), data);
        if self.stdout_pump.replace(task).is_some() {
            tracing::debug!("replaced the stdout stream");
        }
        done
    }

    /// Sends `data` to stderr, replacing any stream installed before.
    pub fn write_stderr_via_stream(&mut self, data: StreamReader<u8>) -> FutureReader<()> {
        let (task, done) = pump(self.stderr.p2_stream(), data);
        if self.stderr_pump.replace(task).is_some() {
            tracing::debug!("replaced the stderr stream");
        }
        done
    }
}
