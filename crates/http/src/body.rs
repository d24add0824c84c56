//! Implementation of the `wasi:http/types` interface's various body types.

use crate::error::ErrorCode;
use crate::fields::FieldMap;
use bytes::Bytes;
use http_body::{Body, Frame};
use http_body_util::BodyExt;
use http_body_util::combinators::BoxBody;
use preview_shim_io::runtime::{AbortOnDropJoinHandle, poll_noop, with_ambient_tokio_runtime};
use preview_shim_io::{DynOutputStream, InputStream, OutputStream, StreamError, StreamResult, Subscribe};
use std::future::Future;
use std::pin::{Pin, pin};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Common type for incoming bodies.
pub type HyperIncomingBody = BoxBody<Bytes, ErrorCode>;

/// Common type for outgoing bodies.
pub type HyperOutgoingBody = BoxBody<Bytes, ErrorCode>;

/// A body which fails with `connection-read-timeout` when no frame arrives
/// within `between_bytes_timeout`.
pub(crate) struct BodyWithTimeout {
    inner: HyperIncomingBody,
    // Created on first poll, which always happens inside a runtime.
    timeout: Option<Pin<Box<tokio::time::Sleep>>>,
    reset_sleep: bool,
    between_bytes_timeout: Duration,
}

impl BodyWithTimeout {
    pub(crate) fn new(inner: HyperIncomingBody, between_bytes_timeout: Duration) -> Self {
        Self {
            inner,
            timeout: None,
            reset_sleep: false,
            between_bytes_timeout,
        }
    }
}

impl Body for BodyWithTimeout {
    type Data = Bytes;
    type Error = ErrorCode;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, ErrorCode>>> {
        let me = self.get_mut();
        let between_bytes_timeout = me.between_bytes_timeout;
        let timeout = me
            .timeout
            .get_or_insert_with(|| Box::pin(tokio::time::sleep(between_bytes_timeout)));

        // Reset the timer after every frame which was received.
        if me.reset_sleep {
            timeout
                .as_mut()
                .reset(tokio::time::Instant::now() + between_bytes_timeout);
            me.reset_sleep = false;
        }

        // If the sleep timer has elapsed, then stop polling the inner body.
        if let Poll::Ready(()) = timeout.as_mut().poll(cx) {
            return Poll::Ready(Some(Err(ErrorCode::ConnectionReadTimeout)));
        }

        let result = Pin::new(&mut me.inner).poll_frame(cx);
        if let Poll::Ready(Some(Ok(_))) = &result {
            me.reset_sleep = true;
        }
        result
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }
}

/// How a body stream handed its body back when it went away.
enum StreamEnd {
    /// The stream was dropped before the end of the body.
    Remaining(BodyWithTimeout),
    /// The stream reached the end of the body.
    Trailers(Option<FieldMap>),
    /// The body failed while the stream was reading it.
    Failed(ErrorCode),
}

enum IncomingBodyState {
    Start(BodyWithTimeout),
    InBodyStream(oneshot::Receiver<StreamEnd>),
}

/// The concrete type behind a `wasi:http/types/incoming-body` resource.
pub struct HostIncomingBody {
    body: IncomingBodyState,
    /// An optional worker task to keep alive while this body is being read.
    /// This ensures that if the parent of this body is dropped before the
    /// body then the backing data behind this worker is kept alive.
    worker: Option<AbortOnDropJoinHandle<()>>,
}

impl std::fmt::Debug for HostIncomingBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostIncomingBody").finish_non_exhaustive()
    }
}

impl HostIncomingBody {
    /// Create a new `HostIncomingBody` with the given `body` and a per-frame timeout
    pub fn new(body: HyperIncomingBody, between_bytes_timeout: Duration) -> HostIncomingBody {
        HostIncomingBody {
            body: IncomingBodyState::Start(BodyWithTimeout::new(body, between_bytes_timeout)),
            worker: None,
        }
    }

    /// Retain a worker task that needs to be kept alive while this body is being read.
    pub fn retain_worker(&mut self, worker: AbortOnDropJoinHandle<()>) {
        assert!(self.worker.is_none());
        self.worker = Some(worker);
    }

    /// Take the body stream. Only the first call returns one.
    pub fn take_stream(&mut self) -> Option<HostIncomingBodyStream> {
        if !matches!(self.body, IncomingBodyState::Start(_)) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        match std::mem::replace(&mut self.body, IncomingBodyState::InBodyStream(rx)) {
            IncomingBodyState::Start(body) => Some(HostIncomingBodyStream::new(body, tx)),
            IncomingBodyState::InBodyStream(_) => None,
        }
    }

    /// Convert this body into a `HostFutureTrailers` resource.
    pub fn into_future_trailers(self) -> HostFutureTrailers {
        HostFutureTrailers::Waiting(self)
    }

    /// Reads to the end of the body, discarding data, and returns its
    /// trailers.
    async fn trailers(&mut self) -> Result<Option<FieldMap>, ErrorCode> {
        loop {
            let end = match &mut self.body {
                IncomingBodyState::Start(body) => match body.frame().await {
                    None => return Ok(None),
                    Some(Err(e)) => return Err(e),
                    Some(Ok(frame)) => {
                        if let Ok(trailers) = frame.into_trailers() {
                            return Ok(Some(trailers));
                        }
                        continue;
                    }
                },
                IncomingBodyState::InBodyStream(rx) => rx.await,
            };
            match end {
                Ok(StreamEnd::Remaining(body)) => self.body = IncomingBodyState::Start(body),
                Ok(StreamEnd::Trailers(trailers)) => return Ok(trailers),
                Ok(StreamEnd::Failed(e)) => return Err(e),
                Err(_) => return Err(ErrorCode::ConnectionTerminated),
            }
        }
    }
}

enum IncomingBodyStreamState {
    Open {
        body: BodyWithTimeout,
        tx: oneshot::Sender<StreamEnd>,
    },
    Closed,
}

/// The `input-stream` of an incoming body.
pub struct HostIncomingBodyStream {
    state: IncomingBodyStreamState,
    buffer: Bytes,
    error: Option<anyhow::Error>,
}

impl HostIncomingBodyStream {
    fn new(body: BodyWithTimeout, tx: oneshot::Sender<StreamEnd>) -> HostIncomingBodyStream {
        HostIncomingBodyStream {
            state: IncomingBodyStreamState::Open { body, tx },
            buffer: Bytes::new(),
            error: None,
        }
    }

    fn record_frame(&mut self, frame: Option<Result<Frame<Bytes>, ErrorCode>>) {
        match frame {
            Some(Ok(frame)) => match frame.into_data() {
                Ok(bytes) => self.buffer = bytes,
                Err(frame) => {
                    if let Ok(trailers) = frame.into_trailers() {
                        self.close(StreamEnd::Trailers(Some(trailers)));
                    }
                }
            },
            Some(Err(e)) => {
                self.error = Some(e.clone().into());
                self.close(StreamEnd::Failed(e));
            }
            None => self.close(StreamEnd::Trailers(None)),
        }
    }

    fn close(&mut self, end: StreamEnd) {
        if let IncomingBodyStreamState::Open { tx, .. } =
            std::mem::replace(&mut self.state, IncomingBodyStreamState::Closed)
        {
            // The body may have been dropped already.
            let _ = tx.send(end);
        }
    }
}

#[async_trait::async_trait]
impl InputStream for HostIncomingBodyStream {
    fn read(&mut self, size: usize) -> StreamResult<Bytes> {
        loop {
            if !self.buffer.is_empty() {
                let len = size.min(self.buffer.len());
                return Ok(self.buffer.split_to(len));
            }
            if let Some(e) = self.error.take() {
                return Err(StreamError::LastOperationFailed(e));
            }
            let IncomingBodyStreamState::Open { body, .. } = &mut self.state else {
                return Err(StreamError::Closed);
            };
            let frame = with_ambient_tokio_runtime(|| poll_noop(pin!(body.frame())));
            match frame {
                Some(frame) => self.record_frame(frame),
                None => return Ok(Bytes::new()),
            }
        }
    }
}

#[async_trait::async_trait]
impl Subscribe for HostIncomingBodyStream {
    async fn ready(&mut self) {
        if !self.buffer.is_empty() || self.error.is_some() {
            return;
        }
        if let IncomingBodyStreamState::Open { body, .. } = &mut self.state {
            let frame = body.frame().await;
            self.record_frame(frame);
        }
    }
}

impl Drop for HostIncomingBodyStream {
    fn drop(&mut self) {
        if let IncomingBodyStreamState::Open { body, tx } =
            std::mem::replace(&mut self.state, IncomingBodyStreamState::Closed)
        {
            let _ = tx.send(StreamEnd::Remaining(body));
        }
    }
}

/// The concrete type behind a `wasi:http/types/future-trailers` resource.
#[derive(Debug)]
pub enum HostFutureTrailers {
    /// Trailers aren't here yet.
    ///
    /// This state represents waiting for the other end of the body stream to
    /// finish and for trailers to be received. Pollables may not be ready.
    Waiting(HostIncomingBody),

    /// Trailers are ready and here they are.
    Done(Result<Option<FieldMap>, ErrorCode>),

    /// Trailers have been consumed by `future-trailers.get`.
    Consumed,
}

#[async_trait::async_trait]
impl Subscribe for HostFutureTrailers {
    async fn ready(&mut self) {
        if let HostFutureTrailers::Waiting(body) = self {
            let result = body.trailers().await;
            *self = HostFutureTrailers::Done(result);
        }
    }
}

/// Which message an outgoing body belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamContext {
    Request,
    Response,
}

impl StreamContext {
    /// The body-size error for this context.
    pub fn body_size_error(&self, size: Option<u64>) -> ErrorCode {
        match self {
            StreamContext::Request => ErrorCode::HttpRequestBodySize(size),
            StreamContext::Response => ErrorCode::HttpResponseBodySize(size),
        }
    }
}

#[derive(Debug)]
enum FinishMessage {
    Finished,
    Trailers(FieldMap),
    Abort(ErrorCode),
}

/// Progress against a declared `content-length`.
#[derive(Debug, Clone)]
struct WrittenState {
    expected: u64,
    written: Arc<AtomicU64>,
}

impl WrittenState {
    /// Counts `len` more bytes, returning whether the total still fits.
    fn update(&self, len: usize) -> bool {
        let len = len as u64;
        let old = self.written.fetch_add(len, Ordering::Relaxed);
        old + len <= self.expected
    }

    fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }
}

/// The concrete type behind a `wasi:http/types/outgoing-body` resource.
pub struct HostOutgoingBody {
    /// The output stream that the body is written to.
    body_output_stream: Option<DynOutputStream>,
    context: StreamContext,
    written: Option<WrittenState>,
    finish_sender: Option<oneshot::Sender<FinishMessage>>,
    /// Shared with the output stream, which rejects writes once set.
    finished: Arc<AtomicBool>,
}

impl std::fmt::Debug for HostOutgoingBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostOutgoingBody")
            .field("context", &self.context)
            .field("written", &self.written)
            .finish_non_exhaustive()
    }
}

impl HostOutgoingBody {
    /// Create a new `HostOutgoingBody` and the hyper body it feeds.
    ///
    /// `size` is the declared `content-length`, if any. At most
    /// `buffer_chunks` writes of at most `chunk_size` bytes each are
    /// buffered before the stream applies backpressure.
    pub fn new(
        context: StreamContext,
        size: Option<u64>,
        buffer_chunks: usize,
        chunk_size: usize,
    ) -> (Self, HyperOutgoingBody) {
        let (body_sender, body_receiver) = mpsc::channel(buffer_chunks.max(1));
        let (finish_sender, finish_receiver) = oneshot::channel();
        let finished = Arc::new(AtomicBool::new(false));
        let written = size.map(|expected| WrittenState {
            expected,
            written: Arc::default(),
        });

        let stream = BodyWriteStream {
            context,
            writer: body_sender,
            chunk_size: chunk_size.max(1),
            written: written.clone(),
            finished: finished.clone(),
        };
        let body = BodyImpl {
            body_receiver,
            finish: FinishState::Waiting(finish_receiver),
        };

        (
            Self {
                body_output_stream: Some(Box::new(stream)),
                context,
                written,
                finish_sender: Some(finish_sender),
                finished,
            },
            body.boxed(),
        )
    }

    /// Take the output stream, if it's available.
    pub fn take_output_stream(&mut self) -> Option<DynOutputStream> {
        self.body_output_stream.take()
    }

    /// Finish the body, optionally with trailers.
    ///
    /// Fails when fewer bytes were written than the declared
    /// `content-length`; the body is aborted in that case.
    pub fn finish(mut self, trailers: Option<FieldMap>) -> Result<(), ErrorCode> {
        self.finished.store(true, Ordering::SeqCst);
        let Some(sender) = self.finish_sender.take() else {
            return Ok(());
        };

        if let Some(w) = &self.written {
            let written = w.written();
            if written != w.expected {
                let err = self.context.body_size_error(Some(written));
                let _ = sender.send(FinishMessage::Abort(err.clone()));
                return Err(err);
            }
        }

        let message = match trailers {
            Some(trailers) => FinishMessage::Trailers(trailers),
            None => FinishMessage::Finished,
        };
        // The receiving end may have gone away already.
        let _ = sender.send(message);
        Ok(())
    }
}

impl Drop for HostOutgoingBody {
    fn drop(&mut self) {
        self.finished.store(true, Ordering::SeqCst);
        if let Some(sender) = self.finish_sender.take() {
            tracing::debug!(context = ?self.context, "outgoing body dropped without finish");
            let _ = sender.send(FinishMessage::Abort(ErrorCode::InternalError(Some(
                "outgoing body was dropped before it was finished".to_string(),
            ))));
        }
    }
}

/// The `output-stream` of an outgoing body.
struct BodyWriteStream {
    context: StreamContext,
    writer: mpsc::Sender<Bytes>,
    chunk_size: usize,
    written: Option<WrittenState>,
    finished: Arc<AtomicBool>,
}

impl BodyWriteStream {
    fn is_closed(&self) -> bool {
        self.finished.load(Ordering::SeqCst) || self.writer.is_closed()
    }
}

#[async_trait::async_trait]
impl OutputStream for BodyWriteStream {
    fn write(&mut self, bytes: Bytes) -> StreamResult<()> {
        if self.is_closed() {
            return Err(StreamError::Closed);
        }
        let len = bytes.len();
        if len > self.chunk_size {
            return Err(StreamError::trap("write exceeded budget"));
        }
        if let Some(written) = &self.written {
            if !written.update(len) {
                let err = self.context.body_size_error(Some(written.written()));
                return Err(StreamError::LastOperationFailed(err.into()));
            }
        }
        match self.writer.try_send(bytes) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(StreamError::trap("write exceeded budget"))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(StreamError::Closed),
        }
    }

    fn flush(&mut self) -> StreamResult<()> {
        if self.is_closed() {
            return Err(StreamError::Closed);
        }
        // Bytes are handed to the body as soon as they are written.
        Ok(())
    }

    fn check_write(&mut self) -> StreamResult<usize> {
        if self.is_closed() {
            return Err(StreamError::Closed);
        }
        if self.writer.capacity() > 0 {
            Ok(self.chunk_size)
        } else {
            Ok(0)
        }
    }
}

#[async_trait::async_trait]
impl Subscribe for BodyWriteStream {
    async fn ready(&mut self) {
        if self.finished.load(Ordering::SeqCst) {
            return;
        }
        // Waits for buffer space; the permit is released right away.
        let _ = self.writer.reserve().await;
    }
}

enum FinishState {
    Waiting(oneshot::Receiver<FinishMessage>),
    Received(FinishMessage),
    Done,
}

/// The hyper side of a [`HostOutgoingBody`].
struct BodyImpl {
    body_receiver: mpsc::Receiver<Bytes>,
    finish: FinishState,
}

impl Body for BodyImpl {
    type Data = Bytes;
    type Error = ErrorCode;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let me = &mut *self;

        // Once finished, no more data can be written: drain what is
        // buffered and then deliver the end of the body.
        if let FinishState::Waiting(rx) = &mut me.finish {
            if let Poll::Ready(message) = Pin::new(rx).poll(cx) {
                let message = message.unwrap_or_else(|_| {
                    FinishMessage::Abort(ErrorCode::InternalError(Some(
                        "outgoing body went away".to_string(),
                    )))
                });
                me.finish = FinishState::Received(message);
                me.body_receiver.close();
            }
        }

        match me.body_receiver.poll_recv(cx) {
            Poll::Ready(Some(bytes)) => return Poll::Ready(Some(Ok(Frame::data(bytes)))),
            Poll::Ready(None) => {}
            Poll::Pending => return Poll::Pending,
        }

        match std::mem::replace(&mut me.finish, FinishState::Done) {
            FinishState::Waiting(rx) => {
                // The stream was dropped but the body is not finished yet.
                me.finish = FinishState::Waiting(rx);
                Poll::Pending
            }
            FinishState::Received(FinishMessage::Finished) | FinishState::Done => {
                Poll::Ready(None)
            }
            FinishState::Received(FinishMessage::Trailers(trailers)) => {
                Poll::Ready(Some(Ok(Frame::trailers(trailers))))
            }
            FinishState::Received(FinishMessage::Abort(err)) => Poll::Ready(Some(Err(err))),
        }
    }

    fn is_end_stream(&self) -> bool {
        matches!(self.finish, FinishState::Done)
    }
}
