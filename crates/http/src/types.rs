//! Implements the base structure (i.e. [WasiHttpCtx]) that will provide the
//! implementation of the wasi-http API, along with the concrete types behind
//! its resources.

use crate::body::{HostIncomingBody, HyperIncomingBody, HyperOutgoingBody};
use crate::error::{ErrorCode, HttpResult, dns_error, hyper_request_error, internal_error};
use crate::fields::FieldMap;
use crate::io::TokioIo;
use http_body_util::BodyExt;
use hyper::header::HeaderName;
use preview_shim_io::runtime::{AbortOnDropJoinHandle, poll_noop, with_ambient_tokio_runtime};
use preview_shim_io::{ResourceTable, Subscribe};
use std::any::Any;
use std::pin::Pin;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Header names no guest may set, and which are stripped from incoming
/// messages before a guest sees them.
pub static DEFAULT_FORBIDDEN_HEADERS: [HeaderName; 10] = [
    hyper::header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    hyper::header::PROXY_AUTHENTICATE,
    hyper::header::PROXY_AUTHORIZATION,
    HeaderName::from_static("proxy-connection"),
    hyper::header::TE,
    hyper::header::TRANSFER_ENCODING,
    hyper::header::UPGRADE,
    hyper::header::HOST,
    HeaderName::from_static("http2-settings"),
];

/// The default value of [`WasiHttpCtx::outgoing_body_buffer_chunks`].
pub const DEFAULT_OUTGOING_BODY_BUFFER_CHUNKS: usize = 1;
/// The default value of [`WasiHttpCtx::outgoing_body_chunk_size`].
pub const DEFAULT_OUTGOING_BODY_CHUNK_SIZE: usize = 1024 * 1024;

/// Default for all three HTTP timeouts.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// Capture the state necessary for use in the wasi-http API implementation.
///
/// The set of forbidden headers is fixed when the context is built.
#[derive(Debug, Clone)]
pub struct WasiHttpCtx {
    extra_forbidden_headers: Vec<HeaderName>,
    outgoing_body_buffer_chunks: usize,
    outgoing_body_chunk_size: usize,
}

impl Default for WasiHttpCtx {
    fn default() -> Self {
        Self::new()
    }
}

impl WasiHttpCtx {
    /// Create a new context with the default forbidden headers.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> WasiHttpCtxBuilder {
        WasiHttpCtxBuilder {
            ctx: WasiHttpCtx {
                extra_forbidden_headers: Vec::new(),
                outgoing_body_buffer_chunks: DEFAULT_OUTGOING_BODY_BUFFER_CHUNKS,
                outgoing_body_chunk_size: DEFAULT_OUTGOING_BODY_CHUNK_SIZE,
            },
        }
    }

    /// Whether a given header should be considered forbidden and not allowed.
    pub fn is_forbidden_header(&self, name: &HeaderName) -> bool {
        DEFAULT_FORBIDDEN_HEADERS.contains(name) || self.extra_forbidden_headers.contains(name)
    }

    /// Number of distinct write calls to an outgoing body's output-stream
    /// that are buffered.
    pub fn outgoing_body_buffer_chunks(&self) -> usize {
        self.outgoing_body_buffer_chunks
    }

    /// Maximum size allowed in a write call to an outgoing body's
    /// output-stream.
    pub fn outgoing_body_chunk_size(&self) -> usize {
        self.outgoing_body_chunk_size
    }
}

/// Builder for a [`WasiHttpCtx`].
pub struct WasiHttpCtxBuilder {
    ctx: WasiHttpCtx,
}

impl WasiHttpCtxBuilder {
    /// Forbids `name` in addition to [`DEFAULT_FORBIDDEN_HEADERS`].
    pub fn forbid_header(mut self, name: HeaderName) -> Self {
        if !self.ctx.extra_forbidden_headers.contains(&name) {
            self.ctx.extra_forbidden_headers.push(name);
        }
        self
    }

    pub fn outgoing_body_buffer_chunks(mut self, chunks: usize) -> Self {
        self.ctx.outgoing_body_buffer_chunks = chunks.max(1);
        self
    }

    pub fn outgoing_body_chunk_size(mut self, size: usize) -> Self {
        self.ctx.outgoing_body_chunk_size = size.max(1);
        self
    }

    pub fn build(self) -> WasiHttpCtx {
        self.ctx
    }
}

/// A trait which provides internal WASI HTTP state.
///
/// # Example
///
/// ```
/// use preview_shim_http::{WasiHttpCtx, WasiHttpView};
/// use preview_shim_io::ResourceTable;
///
/// struct MyState {
///     http_ctx: WasiHttpCtx,
///     table: ResourceTable,
/// }
///
/// impl WasiHttpView for MyState {
///     fn ctx(&mut self) -> &mut WasiHttpCtx { &mut self.http_ctx }
///     fn table(&mut self) -> &mut ResourceTable { &mut self.table }
/// }
/// ```
pub trait WasiHttpView: Send {
    /// Returns a mutable reference to the WASI HTTP context.
    fn ctx(&mut self) -> &mut WasiHttpCtx;

    /// Returns a mutable reference to the WASI HTTP resource table.
    fn table(&mut self) -> &mut ResourceTable;

    /// Send an outgoing request.
    fn send_request(
        &mut self,
        request: hyper::Request<HyperOutgoingBody>,
        config: OutgoingRequestConfig,
    ) -> HttpResult<HostFutureIncomingResponse> {
        Ok(default_send_request(request, config))
    }
}

impl<T: ?Sized + WasiHttpView> WasiHttpView for &mut T {
    fn ctx(&mut self) -> &mut WasiHttpCtx {
        T::ctx(self)
    }

    fn table(&mut self) -> &mut ResourceTable {
        T::table(self)
    }

    fn send_request(
        &mut self,
        request: hyper::Request<HyperOutgoingBody>,
        config: OutgoingRequestConfig,
    ) -> HttpResult<HostFutureIncomingResponse> {
        T::send_request(self, request, config)
    }
}

impl<T: ?Sized + WasiHttpView> WasiHttpView for Box<T> {
    fn ctx(&mut self) -> &mut WasiHttpCtx {
        T::ctx(self)
    }

    fn table(&mut self) -> &mut ResourceTable {
        T::table(self)
    }

    fn send_request(
        &mut self,
        request: hyper::Request<HyperOutgoingBody>,
        config: OutgoingRequestConfig,
    ) -> HttpResult<HostFutureIncomingResponse> {
        T::send_request(self, request, config)
    }
}

/// A concrete structure that all `Host` traits of
/// [`bindings::wasi::http`](crate::bindings::wasi::http) are implemented for.
#[repr(transparent)]
pub struct WasiHttpImpl<T>(pub T);

impl<T: WasiHttpView> WasiHttpView for WasiHttpImpl<T> {
    fn ctx(&mut self) -> &mut WasiHttpCtx {
        self.0.ctx()
    }

    fn table(&mut self) -> &mut ResourceTable {
        self.0.table()
    }

    fn send_request(
        &mut self,
        request: hyper::Request<HyperOutgoingBody>,
        config: OutgoingRequestConfig,
    ) -> HttpResult<HostFutureIncomingResponse> {
        self.0.send_request(request, config)
    }
}

/// A borrowed [`WasiHttpCtx`] next to the [`ResourceTable`] it shares with
/// the other interfaces.
pub struct WasiHttpCtxView<'a> {
    pub ctx: &'a mut WasiHttpCtx,
    pub table: &'a mut ResourceTable,
}

impl WasiHttpView for WasiHttpCtxView<'_> {
    fn ctx(&mut self) -> &mut WasiHttpCtx {
        self.ctx
    }

    fn table(&mut self) -> &mut ResourceTable {
        self.table
    }
}

/// The `wasi:http/types.method` variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
    Other(String),
}

impl From<http::Method> for Method {
    fn from(method: http::Method) -> Self {
        if method == http::Method::GET {
            Method::Get
        } else if method == http::Method::HEAD {
            Method::Head
        } else if method == http::Method::POST {
            Method::Post
        } else if method == http::Method::PUT {
            Method::Put
        } else if method == http::Method::DELETE {
            Method::Delete
        } else if method == http::Method::CONNECT {
            Method::Connect
        } else if method == http::Method::OPTIONS {
            Method::Options
        } else if method == http::Method::TRACE {
            Method::Trace
        } else if method == http::Method::PATCH {
            Method::Patch
        } else {
            Method::Other(method.to_string())
        }
    }
}

impl TryFrom<Method> for http::Method {
    type Error = http::method::InvalidMethod;

    fn try_from(method: Method) -> Result<http::Method, Self::Error> {
        match method {
            Method::Get => Ok(http::Method::GET),
            Method::Head => Ok(http::Method::HEAD),
            Method::Post => Ok(http::Method::POST),
            Method::Put => Ok(http::Method::PUT),
            Method::Delete => Ok(http::Method::DELETE),
            Method::Connect => Ok(http::Method::CONNECT),
            Method::Options => Ok(http::Method::OPTIONS),
            Method::Trace => Ok(http::Method::TRACE),
            Method::Patch => Ok(http::Method::PATCH),
            Method::Other(s) => http::Method::from_bytes(s.as_bytes()),
        }
    }
}

/// The `wasi:http/types.scheme` variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
    Other(String),
}

impl From<&http::uri::Scheme> for Scheme {
    fn from(scheme: &http::uri::Scheme) -> Self {
        if *scheme == http::uri::Scheme::HTTP {
            Scheme::Http
        } else if *scheme == http::uri::Scheme::HTTPS {
            Scheme::Https
        } else {
            Scheme::Other(scheme.as_str().to_owned())
        }
    }
}

impl TryFrom<Scheme> for http::uri::Scheme {
    type Error = http::uri::InvalidUri;

    fn try_from(scheme: Scheme) -> Result<Self, Self::Error> {
        match scheme {
            Scheme::Http => Ok(http::uri::Scheme::HTTP),
            Scheme::Https => Ok(http::uri::Scheme::HTTPS),
            Scheme::Other(s) => s.parse(),
        }
    }
}

/// Whether `authority` is acceptable for a request: it must parse, and a
/// port, when present, must be a valid `u16`.
pub(crate) fn is_valid_authority(authority: &str) -> bool {
    if authority.parse::<http::uri::Authority>().is_err() {
        return false;
    }
    match authority.rsplit_once(':') {
        // An IPv6 literal without a port ends with `]`.
        Some((_, port)) if !port.ends_with(']') => port.parse::<u16>().is_ok(),
        _ => true,
    }
}

pub(crate) fn is_valid_path_with_query(path: &str) -> bool {
    path.parse::<http::uri::PathAndQuery>().is_ok()
}

/// The concrete type behind a `wasi:http/types/outgoing-request` resource.
#[derive(Debug)]
pub struct HostOutgoingRequest {
    /// The method of the request.
    pub method: Method,
    /// The scheme of the request.
    pub scheme: Option<Scheme>,
    /// The authority of the request.
    pub authority: Option<String>,
    /// The path and query of the request.
    pub path_with_query: Option<String>,
    /// The request headers.
    pub headers: FieldMap,
    /// The request body.
    pub body: Option<HyperOutgoingBody>,
}

/// The concrete type behind a `wasi:http/types/request-options` resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// How long to wait for a connection to be established.
    pub connect_timeout: Option<Duration>,
    /// How long to wait for the first byte of the response body.
    pub first_byte_timeout: Option<Duration>,
    /// How long to wait between frames of the response body.
    pub between_bytes_timeout: Option<Duration>,
}

impl RequestOptions {
    /// The configuration for one request, with defaults filled in.
    pub fn config(&self, use_tls: bool) -> OutgoingRequestConfig {
        OutgoingRequestConfig {
            use_tls,
            connect_timeout: self.connect_timeout.unwrap_or(DEFAULT_TIMEOUT),
            first_byte_timeout: self.first_byte_timeout.unwrap_or(DEFAULT_TIMEOUT),
            between_bytes_timeout: self.between_bytes_timeout.unwrap_or(DEFAULT_TIMEOUT),
        }
    }
}

/// The concrete type behind a `wasi:http/types/incoming-response` resource.
#[derive(Debug)]
pub struct HostIncomingResponse {
    /// The response status
    pub status: u16,
    /// The response headers
    pub headers: FieldMap,
    /// The response body
    pub body: Option<HostIncomingBody>,
}

/// The concrete type behind a `wasi:http/types/fields` resource.
#[derive(Debug)]
pub enum HostFields {
    /// A reference to the fields of a parent entry. These are immutable.
    Ref {
        /// The parent resource rep.
        parent: u32,

        /// The function to get the fields from the parent.
        get_fields: for<'a> fn(elem: &'a mut (dyn Any + 'static)) -> Option<&'a mut FieldMap>,
    },
    /// An owned, mutable version of the fields.
    Owned {
        /// The fields themselves.
        fields: FieldMap,
    },
}

/// Configuration for an outgoing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutgoingRequestConfig {
    /// Whether to use TLS for the request.
    pub use_tls: bool,
    /// The timeout for connecting.
    pub connect_timeout: Duration,
    /// The timeout until the first byte.
    pub first_byte_timeout: Duration,
    /// The timeout between chunks of a streaming body
    pub between_bytes_timeout: Duration,
}

impl Default for OutgoingRequestConfig {
    fn default() -> Self {
        RequestOptions::default().config(false)
    }
}

/// A response that is in the process of being received.
#[derive(Debug)]
pub struct IncomingResponse {
    /// The response itself.
    pub resp: hyper::Response<HyperIncomingBody>,
    /// Optional worker task that continues to process the response.
    pub worker: Option<AbortOnDropJoinHandle<()>>,
    /// The timeout between chunks of the response.
    pub between_bytes_timeout: Duration,
}

impl IncomingResponse {
    /// Splits this response into the resource a guest sees.
    pub(crate) fn into_host(self, ctx: &WasiHttpCtx) -> HostIncomingResponse {
        let (mut parts, body) = self.resp.into_parts();
        crate::fields::remove_forbidden_headers(ctx, &mut parts.headers);
        let mut body = HostIncomingBody::new(body, self.between_bytes_timeout);
        if let Some(worker) = self.worker {
            body.retain_worker(worker);
        }
        HostIncomingResponse {
            status: parts.status.as_u16(),
            headers: parts.headers,
            body: Some(body),
        }
    }
}

/// A handle to a future incoming response.
pub type FutureIncomingResponseHandle =
    AbortOnDropJoinHandle<anyhow::Result<Result<IncomingResponse, ErrorCode>>>;

/// The concrete type behind a `wasi:http/types/future-incoming-response` resource.
#[derive(Debug)]
pub enum HostFutureIncomingResponse {
    /// A pending response
    Pending(FutureIncomingResponseHandle),
    /// The response is ready.
    ///
    /// An outer error will trap while the inner error gets returned to the guest.
    Ready(anyhow::Result<Result<IncomingResponse, ErrorCode>>),
    /// The response has been consumed.
    Consumed,
}

impl HostFutureIncomingResponse {
    /// Create a new `HostFutureIncomingResponse` that is pending on the provided task handle.
    pub fn pending(handle: FutureIncomingResponseHandle) -> Self {
        Self::Pending(handle)
    }

    /// Create a new `HostFutureIncomingResponse` that is ready.
    pub fn ready(result: anyhow::Result<Result<IncomingResponse, ErrorCode>>) -> Self {
        Self::Ready(result)
    }

    /// Returns `true` if the response is ready.
    ///
    /// A pending response whose task already finished becomes ready here,
    /// without waiting.
    pub fn is_ready(&mut self) -> bool {
        if let Self::Pending(handle) = self {
            if handle.is_finished() {
                if let Some(result) = with_ambient_tokio_runtime(|| poll_noop(Pin::new(handle))) {
                    *self = Self::Ready(result);
                }
            }
        }
        matches!(self, Self::Ready(_))
    }

    /// Takes the response out if it is ready, leaving this consumed.
    pub fn take_ready(&mut self) -> Option<anyhow::Result<Result<IncomingResponse, ErrorCode>>> {
        if !self.is_ready() {
            return None;
        }
        match std::mem::replace(self, Self::Consumed) {
            Self::Ready(result) => Some(result),
            Self::Pending(_) | Self::Consumed => None,
        }
    }

    /// Waits for the response.
    pub async fn resolve(mut self) -> anyhow::Result<Result<IncomingResponse, ErrorCode>> {
        self.ready().await;
        match self {
            Self::Ready(result) => result,
            Self::Pending(_) | Self::Consumed => {
                anyhow::bail!("response was already consumed")
            }
        }
    }
}

#[async_trait::async_trait]
impl Subscribe for HostFutureIncomingResponse {
    async fn ready(&mut self) {
        if let Self::Pending(handle) = self {
            *self = Self::Ready(handle.await);
        }
    }
}

/// The default implementation of how an outgoing request is sent.
///
/// This implementation is used by the `wasi:http/outgoing-handler` interface
/// default implementation.
pub fn default_send_request(
    request: hyper::Request<HyperOutgoingBody>,
    config: OutgoingRequestConfig,
) -> HostFutureIncomingResponse {
    let handle = preview_shim_io::runtime::spawn(async move {
        Ok(default_send_request_handler(request, config).await)
    });
    HostFutureIncomingResponse::pending(handle)
}

/// The underlying implementation of how an outgoing request is sent. This should likely be spawned
/// in a task.
///
/// This is called from [default_send_request] to actually send the request.
pub async fn default_send_request_handler(
    mut request: hyper::Request<HyperOutgoingBody>,
    OutgoingRequestConfig {
        use_tls,
        connect_timeout,
        first_byte_timeout,
        between_bytes_timeout,
    }: OutgoingRequestConfig,
) -> Result<IncomingResponse, ErrorCode> {
    let authority = if let Some(authority) = request.uri().authority() {
        if authority.port().is_some() {
            authority.to_string()
        } else {
            let port = if use_tls { 443 } else { 80 };
            format!("{authority}:{port}")
        }
    } else {
        return Err(ErrorCode::HttpRequestUriInvalid);
    };
    tracing::debug!(%authority, use_tls, "sending request");

    let tcp_stream = timeout(connect_timeout, TcpStream::connect(&authority))
        .await
        .map_err(|_| ErrorCode::ConnectionTimeout)?
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::AddrNotAvailable => {
                dns_error("address not available".to_string(), 0)
            }
            _ => {
                if e.to_string()
                    .starts_with("failed to lookup address information")
                {
                    dns_error("address not available".to_string(), 0)
                } else {
                    ErrorCode::ConnectionRefused
                }
            }
        })?;

    let (mut sender, worker) = if use_tls {
        use rustls::pki_types::ServerName;

        let root_cert_store = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.into(),
        };
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();
        let connector = tokio_rustls::TlsConnector::from(std::sync::Arc::new(config));
        let host = authority
            .rsplit_once(':')
            .map_or(authority.as_str(), |(host, _)| host);
        let domain = ServerName::try_from(host)
            .map_err(|e| {
                tracing::warn!("dns lookup error: {e:?}");
                dns_error("invalid dns name".to_string(), 0)
            })?
            .to_owned();
        let stream = connector.connect(domain, tcp_stream).await.map_err(|e| {
            tracing::warn!("tls protocol error: {e:?}");
            ErrorCode::TlsProtocolError
        })?;
        let stream = TokioIo::new(stream);

        let (sender, conn) = timeout(
            connect_timeout,
            hyper::client::conn::http1::handshake(stream),
        )
        .await
        .map_err(|_| ErrorCode::ConnectionTimeout)?
        .map_err(hyper_request_error)?;

        let worker = preview_shim_io::runtime::spawn(async move {
            if let Err(e) = conn.await {
                tracing::warn!("dropping error {e}");
            }
        });

        (sender, worker)
    } else {
        let tcp_stream = TokioIo::new(tcp_stream);
        let (sender, conn) = timeout(
            connect_timeout,
            hyper::client::conn::http1::handshake(tcp_stream),
        )
        .await
        .map_err(|_| ErrorCode::ConnectionTimeout)?
        .map_err(hyper_request_error)?;

        let worker = preview_shim_io::runtime::spawn(async move {
            if let Err(e) = conn.await {
                tracing::warn!("dropping error {e}");
            }
        });

        (sender, worker)
    };

    // At this point, the request contains the scheme and the authority, but
    // the http packet should only include those if addressing a proxy, so
    // remove them here, since SendRequest::send_request does not do it for us.
    let path = request
        .uri()
        .path_and_query()
        .map_or("/", |p| p.as_str())
        .to_owned();
    *request.uri_mut() = http::Uri::builder()
        .path_and_query(path)
        .build()
        .map_err(|e| internal_error(e.to_string()))?;

    let resp = timeout(first_byte_timeout, sender.send_request(request))
        .await
        .map_err(|_| ErrorCode::ConnectionReadTimeout)?
        .map_err(hyper_request_error)?
        .map(|body| body.map_err(hyper_request_error).boxed());

    Ok(IncomingResponse {
        resp,
        worker: Some(worker),
        between_bytes_timeout,
    })
}
