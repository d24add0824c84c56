//! Implementation for the `wasi:http/outgoing-handler` interface, plus a
//! synchronous way to send a fully buffered request.

use crate::bindings::wasi::http::outgoing_handler;
use crate::bindings::wasi::http::types::{FutureIncomingResponse, OutgoingRequest};
use crate::body::HyperOutgoingBody;
use crate::error::{ErrorCode, HttpResult, http_request_error};
use crate::fields::FieldMap;
use crate::types::{
    HostOutgoingRequest, OutgoingRequestConfig, RequestOptions, Scheme, WasiHttpImpl, WasiHttpView,
    default_send_request_handler,
};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use preview_shim_io::Resource;
use preview_shim_io::bridge::SyncBridge;

impl<T> outgoing_handler::Host for WasiHttpImpl<T>
where
    T: WasiHttpView,
{
    fn handle(
        &mut self,
        request_id: Resource<OutgoingRequest>,
        options: Option<Resource<RequestOptions>>,
    ) -> HttpResult<Resource<FutureIncomingResponse>> {
        let opts = options
            .map(|options| self.table().get(&options).copied())
            .transpose()?
            .unwrap_or_default();

        let req = self.table().delete(request_id)?;
        let request = into_hyper_request(req)?;
        let use_tls = request.uri().scheme() == Some(&http::uri::Scheme::HTTPS);

        let future = self.send_request(request, opts.config(use_tls))?;
        Ok(self.table().push(future)?)
    }
}

/// Builds the request hyper sends out of the guest's resource.
pub(crate) fn into_hyper_request(
    req: HostOutgoingRequest,
) -> Result<hyper::Request<HyperOutgoingBody>, ErrorCode> {
    let HostOutgoingRequest {
        method,
        scheme,
        authority,
        path_with_query,
        headers,
        body,
    } = req;

    let method = http::Method::try_from(method).map_err(|_| ErrorCode::HttpRequestMethodInvalid)?;
    let scheme = match scheme.unwrap_or(Scheme::Https) {
        Scheme::Http => http::uri::Scheme::HTTP,
        Scheme::Https => http::uri::Scheme::HTTPS,
        // We can only support http/https
        Scheme::Other(_) => return Err(ErrorCode::HttpProtocolError),
    };
    let authority = authority.unwrap_or_default();

    let mut builder = hyper::Request::builder()
        .method(method)
        .header(hyper::header::HOST, &authority)
        .uri(
            http::Uri::builder()
                .scheme(scheme)
                .authority(authority)
                .path_and_query(path_with_query.as_deref().unwrap_or("/"))
                .build()
                .map_err(http_request_error)?,
        );
    for (name, value) in headers.iter() {
        builder = builder.header(name, value);
    }

    let body = body.unwrap_or_else(|| Empty::<Bytes>::new().map_err(|never| match never {}).boxed());
    builder.body(body).map_err(http_request_error)
}

/// A response whose body was read to the end.
#[derive(Debug, Clone)]
pub struct BufferedResponse {
    pub status: u16,
    pub headers: FieldMap,
    pub body: Bytes,
    pub trailers: Option<FieldMap>,
}

/// Sends `request` and reads the whole response, blocking the calling thread.
///
/// The request runs on `bridge`'s worker thread. As with the asynchronous
/// surface, transport failures come back as the inner `ErrorCode`.
pub fn send_request_sync(
    bridge: &SyncBridge,
    request: http::Request<Bytes>,
    config: OutgoingRequestConfig,
) -> anyhow::Result<Result<BufferedResponse, ErrorCode>> {
    let request = request.map(|body| Full::new(body).map_err(|never| match never {}).boxed());
    bridge.call(move || async move {
        let resp = default_send_request_handler(request, config).await?;
        // The connection task must outlive the body read.
        let _worker = resp.worker;
        let (parts, body) = resp.resp.into_parts();
        let collected = crate::body::BodyWithTimeout::new(body, resp.between_bytes_timeout)
            .collect()
            .await?;
        let trailers = collected.trailers().cloned();
        tracing::debug!(status = parts.status.as_u16(), "buffered response");
        Ok::<_, ErrorCode>(BufferedResponse {
            status: parts.status.as_u16(),
            headers: parts.headers,
            body: collected.to_bytes(),
            trailers,
        })
    })
}
