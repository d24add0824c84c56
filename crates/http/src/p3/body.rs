//! Bodies of Preview3 requests and responses.
//!
//! A guest supplies a body as a byte [`StreamReader`] plus a trailers
//! [`FutureReader`]; the host sees it as an [`http_body::Body`]. Both
//! directions are bridged by a task that pumps one side into the other.

use crate::body::HyperOutgoingBody;
use crate::error::ErrorCode;
use crate::fields::FieldMap;
use bytes::Bytes;
use http_body::{Body, Frame};
use http_body_util::BodyExt;
use preview_shim_io::p3::{FutureReader, FutureWriter, StreamReader, future, stream};
use preview_shim_io::runtime::{AbortOnDropJoinHandle, with_ambient_tokio_runtime};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// The trailers half of a body, as a guest sees it.
pub type TrailersReader = FutureReader<Result<Option<FieldMap>, ErrorCode>>;

/// Reports whether a body was fully transmitted.
pub type TransmitReader = FutureReader<Result<(), ErrorCode>>;

/// How much of a guest stream is read at once.
const GUEST_READ_SIZE: usize = 64 * 1024;

/// The body of a request or response.
pub(crate) enum MessageBody {
    /// Supplied by a guest. `contents` is `None` for an empty body.
    Guest {
        contents: Option<StreamReader<u8>>,
        trailers: TrailersReader,
        result: FutureWriter<Result<(), ErrorCode>>,
    },
    /// Received from the network.
    Host {
        body: HyperOutgoingBody,
        worker: Option<AbortOnDropJoinHandle<()>>,
    },
    /// Already handed out.
    Consumed,
}

impl MessageBody {
    /// A guest body along with the future through which its transmission is
    /// reported.
    pub(crate) fn guest(
        contents: Option<StreamReader<u8>>,
        trailers: TrailersReader,
    ) -> (MessageBody, TransmitReader) {
        let (result, result_rx) = future();
        (
            MessageBody::Guest {
                contents,
                trailers,
                result,
            },
            result_rx,
        )
    }

    /// Takes the body out, leaving it consumed.
    pub(crate) fn take(&mut self) -> Option<MessageBody> {
        match std::mem::replace(self, MessageBody::Consumed) {
            MessageBody::Consumed => None,
            body => Some(body),
        }
    }

    /// Converts the body for sending with hyper.
    ///
    /// A guest body is forwarded by a detached task, which settles the
    /// transmission result once the guest's trailers have gone out, or
    /// with `connection-terminated` when the receiving side goes away first.
    pub(crate) fn into_http(self) -> Result<HyperOutgoingBody, ErrorCode> {
        match self {
            MessageBody::Guest {
                contents,
                trailers,
                result,
            } => {
                let (tx, rx) = mpsc::channel(1);
                with_ambient_tokio_runtime(|| {
                    drop(tokio::spawn(forward_guest_body(contents, trailers, tx, result)))
                });
                Ok(ChannelBody { rx }.boxed())
            }
            MessageBody::Host { body, worker } => match worker {
                // The connection must stay up for as long as the body is read.
                Some(worker) => Ok(KeepAlive { body, _worker: worker }.boxed()),
                None => Ok(body),
            },
            MessageBody::Consumed => Err(ErrorCode::InternalError(Some(
                "body was already consumed".to_string(),
            ))),
        }
    }

    /// Converts the body into the stream and trailers a guest reads.
    ///
    /// The stream ends only after the trailers future has settled. Dropping
    /// the stream stops reading the body.
    pub(crate) fn into_guest(self) -> Result<(StreamReader<u8>, TrailersReader), ErrorCode> {
        let body = self.into_http()?;
        let (tx, rx) = stream();
        let (mut trailers_tx, trailers_rx) = future();
        let task = preview_shim_io::runtime::spawn(async move {
            let mut body = body;
            let end = loop {
                match body.frame().await {
                    Some(Ok(frame)) => match frame.into_data() {
                        Ok(data) => {
                            if tx.write(data.to_vec()).await.is_err() {
                                tracing::debug!("body stream reader went away");
                                return;
                            }
                        }
                        Err(frame) => {
                            if let Ok(trailers) = frame.into_trailers() {
                                break Ok(Some(trailers));
                            }
                        }
                    },
                    Some(Err(e)) => break Err(e),
                    None => break Ok(None),
                }
            };
            trailers_tx.write(end);
            tx.close();
        });
        Ok((rx.with_producer(task), trailers_rx))
    }
}

async fn forward_guest_body(
    contents: Option<StreamReader<u8>>,
    trailers: TrailersReader,
    tx: mpsc::Sender<Result<Frame<Bytes>, ErrorCode>>,
    mut result: FutureWriter<Result<(), ErrorCode>>,
) {
    if let Some(mut contents) = contents {
        while let Some(chunk) = contents.read(GUEST_READ_SIZE).await {
            if tx.send(Ok(Frame::data(Bytes::from(chunk)))).await.is_err() {
                result.write(Err(ErrorCode::ConnectionTerminated));
                return;
            }
        }
    }

    let trailers = match trailers.read().await {
        Some(Ok(trailers)) => trailers,
        Some(Err(e)) => {
            // The receiver may be gone already; the result reports it either way.
            _ = tx.send(Err(e.clone())).await;
            result.write(Err(e));
            return;
        }
        // The guest dropped its trailers writer without settling it.
        None => None,
    };
    if let Some(trailers) = trailers {
        if tx.send(Ok(Frame::trailers(trailers))).await.is_err() {
            result.write(Err(ErrorCode::ConnectionTerminated));
            return;
        }
    }
    result.write(Ok(()));
}

/// A body whose frames arrive over a channel.
struct ChannelBody {
    rx: mpsc::Receiver<Result<Frame<Bytes>, ErrorCode>>,
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = ErrorCode;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, ErrorCode>>> {
        self.rx.poll_recv(cx)
    }
}

/// A body that keeps its connection task running.
struct KeepAlive {
    body: HyperOutgoingBody,
    _worker: AbortOnDropJoinHandle<()>,
}

impl Body for KeepAlive {
    type Data = Bytes;
    type Error = ErrorCode;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, ErrorCode>>> {
        Pin::new(&mut self.body).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.body.is_end_stream()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use http_body_util::Full;

    fn trailers(name: &'static str) -> FieldMap {
        let mut map = FieldMap::new();
        map.insert(name, http::HeaderValue::from_static("done"));
        map
    }

    #[test_log::test(tokio::test)]
    async fn guest_body_to_http() {
        let (contents_tx, contents) = stream();
        let (mut trailers_tx, trailers_rx) = future();
        let (body, result) = MessageBody::guest(Some(contents), trailers_rx);
        let body = body.into_http().unwrap();

        contents_tx.write(b"hello ".to_vec()).await.unwrap();
        contents_tx.write(b"world".to_vec()).await.unwrap();
        contents_tx.close();
        trailers_tx.write(Ok(Some(trailers("x-checksum"))));

        let collected = body.collect().await.unwrap();
        assert_eq!(collected.trailers().unwrap()["x-checksum"], "done");
        assert_eq!(collected.to_bytes(), "hello world");
        assert_eq!(result.read().await, Some(Ok(())));
    }

    #[test_log::test(tokio::test)]
    async fn guest_body_error_reaches_both_sides() {
        let (mut trailers_tx, trailers_rx) = future();
        let (body, result) = MessageBody::guest(None, trailers_rx);
        let body = body.into_http().unwrap();
        trailers_tx.write(Err(ErrorCode::HttpRequestBodySize(Some(3))));

        let err = body.collect().await.unwrap_err();
        assert_eq!(err, ErrorCode::HttpRequestBodySize(Some(3)));
        assert_eq!(
            result.read().await,
            Some(Err(ErrorCode::HttpRequestBodySize(Some(3))))
        );
    }

    #[test_log::test(tokio::test)]
    async fn dropped_receiver_terminates_transmission() {
        let (contents_tx, contents) = stream();
        let (_trailers_tx, trailers_rx) = future();
        let (body, result) = MessageBody::guest(Some(contents), trailers_rx);
        drop(body.into_http().unwrap());

        // The forwarding task notices once it has something to send.
        _ = contents_tx.write(b"lost".to_vec()).await;
        assert_eq!(
            result.read().await,
            Some(Err(ErrorCode::ConnectionTerminated))
        );
    }

    #[test_log::test(tokio::test)]
    async fn host_body_to_guest() {
        let body = Full::new(Bytes::from_static(b"payload"))
            .map_err(|never| match never {})
            .boxed();
        let mut body = MessageBody::Host { body, worker: None };
        let (mut contents, trailers) = body.take().unwrap().into_guest().unwrap();
        assert!(body.take().is_none());

        assert_eq!(contents.read_all().await, b"payload");
        assert_eq!(trailers.read().await, Some(Ok(None)));
    }
}
