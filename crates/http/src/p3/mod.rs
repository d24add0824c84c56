//! Preview3 flavor of `wasi:http`.
//!
//! Requests and responses own their headers and carry their bodies as a
//! byte [`stream`](preview_shim_io::p3::stream) plus a trailers
//! [`future`](preview_shim_io::p3::future). Both are built with `new`, which
//! also hands back a future reporting whether the body was fully
//! transmitted.

mod body;
mod request;
mod response;

pub use self::body::{TrailersReader, TransmitReader};
pub use self::request::Request;
pub use self::response::Response;

use crate::error::HttpResult;
use crate::types::WasiHttpView;

/// Sends `request` through `view` and waits for the response head.
///
/// The response body is read through [`Response::body`]. Transport
/// failures come back as an [`ErrorCode`](crate::ErrorCode).
pub async fn send_request(view: &mut impl WasiHttpView, request: Request) -> HttpResult<Response> {
    let (request, options) = request.into_http()?;
    let use_tls = request.uri().scheme() == Some(&http::uri::Scheme::HTTPS);
    let future = view.send_request(request, options.config(use_tls))?;
    let ctx = view.ctx().clone();
    let resp = future.resolve().await??;
    Ok(Response::from_incoming(resp, &ctx))
}
