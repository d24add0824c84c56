use super::body::{MessageBody, TrailersReader, TransmitReader};
use crate::body::{BodyWithTimeout, HyperOutgoingBody};
use crate::error::ErrorCode;
use crate::fields::{Fields, remove_forbidden_headers};
use crate::types::{IncomingResponse, WasiHttpCtx};
use http_body_util::BodyExt;
use preview_shim_io::p3::StreamReader;

/// The concrete type behind a Preview3 `wasi:http/types/response` resource.
pub struct Response {
    status: u16,
    headers: Fields,
    body: MessageBody,
}

impl Response {
    /// Construct a new [`Response`] with status 200.
    ///
    /// `headers` become immutable. The returned future settles once the body
    /// and trailers have been fully transmitted.
    pub fn new(
        mut headers: Fields,
        contents: Option<StreamReader<u8>>,
        trailers: TrailersReader,
    ) -> (Response, TransmitReader) {
        headers.freeze();
        let (body, result) = MessageBody::guest(contents, trailers);
        let resp = Response {
            status: 200,
            headers,
            body,
        };
        (resp, result)
    }

    /// Wraps a response received from the network.
    ///
    /// Forbidden headers are dropped before the guest sees them.
    pub fn from_incoming(resp: IncomingResponse, ctx: &WasiHttpCtx) -> Response {
        let IncomingResponse {
            resp,
            worker,
            between_bytes_timeout,
        } = resp;
        let (mut parts, body) = resp.into_parts();
        remove_forbidden_headers(ctx, &mut parts.headers);
        Response {
            status: parts.status.as_u16(),
            headers: Fields::immutable(parts.headers),
            body: MessageBody::Host {
                body: BodyWithTimeout::new(body, between_bytes_timeout).boxed(),
                worker,
            },
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// Sets the status, which must lie in `100..=599`.
    pub fn set_status(&mut self, status: u16) -> Result<(), ()> {
        if !(100..=599).contains(&status) {
            return Err(());
        }
        self.status = status;
        Ok(())
    }

    /// The response's headers, which are immutable.
    pub fn headers(&self) -> &Fields {
        &self.headers
    }

    /// Takes the body as a stream and its trailers.
    ///
    /// The body can be taken once.
    pub fn body(&mut self) -> Result<(StreamReader<u8>, TrailersReader), ()> {
        let body = self.body.take().ok_or(())?;
        body.into_guest().map_err(|e| {
            tracing::warn!("failed to take response body: {e}");
        })
    }

    /// Converts this response into an [`http::Response`].
    pub fn into_http(self) -> Result<http::Response<HyperOutgoingBody>, ErrorCode> {
        let Response {
            status,
            headers,
            body,
        } = self;
        let mut resp = http::Response::new(body.into_http()?);
        *resp.status_mut() = http::StatusCode::from_u16(status)
            .map_err(|e| crate::error::internal_error(e.to_string()))?;
        *resp.headers_mut() = headers.into_map();
        Ok(resp)
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;
    use http_body_util::Full;
    use preview_shim_io::p3::{future, stream};
    use std::time::Duration;

    #[test_log::test(tokio::test)]
    async fn status_is_validated() {
        let (_trailers_tx, trailers) = future();
        let (mut resp, _result) = Response::new(Fields::new(), None, trailers);
        assert_eq!(resp.status(), 200);
        assert!(resp.set_status(99).is_err());
        assert!(resp.set_status(600).is_err());
        resp.set_status(404).unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[test_log::test(tokio::test)]
    async fn guest_response_into_http() {
        let (contents_tx, contents) = stream();
        let (mut trailers_tx, trailers) = future();
        let (mut resp, result) = Response::new(Fields::new(), Some(contents), trailers);
        resp.set_status(201).unwrap();

        let resp = resp.into_http().unwrap();
        assert_eq!(resp.status(), 201);
        contents_tx.write(b"made".to_vec()).await.unwrap();
        drop(contents_tx);
        trailers_tx.write(Ok(None));

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "made");
        assert_eq!(result.read().await, Some(Ok(())));
    }

    #[test_log::test(tokio::test)]
    async fn incoming_response_drops_forbidden_headers() {
        let resp = http::Response::builder()
            .status(503)
            .header("connection", "close")
            .header("retry-after", "1")
            .body(
                Full::new(Bytes::from_static(b"later"))
                    .map_err(|never| match never {})
                    .boxed(),
            )
            .unwrap();
        let incoming = IncomingResponse {
            resp,
            worker: None,
            between_bytes_timeout: Duration::from_secs(5),
        };
        let mut resp = Response::from_incoming(incoming, &WasiHttpCtx::new());
        assert_eq!(resp.status(), 503);
        assert!(!resp.headers().has("connection"));
        assert_eq!(resp.headers().get("retry-after"), vec![b"1".to_vec()]);
        assert!(resp.headers().is_immutable());

        let (mut contents, trailers) = resp.body().unwrap();
        assert!(resp.body().is_err());
        assert_eq!(contents.read_all().await, b"later");
        assert_eq!(trailers.read().await, Some(Ok(None)));
    }
}
