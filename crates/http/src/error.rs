use preview_shim_io::TableError;
use std::error::Error;
use std::fmt;

pub type HttpResult<T, E = HttpError> = Result<T, E>;

/// A `wasi:http`-specific error type used to represent either a trap or a
/// guest-visible payload: an [`ErrorCode`] or a [`HeaderError`].
pub struct HttpError {
    err: anyhow::Error,
}

impl HttpError {
    pub fn trap(err: impl Into<anyhow::Error>) -> HttpError {
        HttpError { err: err.into() }
    }

    /// Recovers the guest-visible payload, or gives back the trap.
    pub fn downcast<E>(self) -> anyhow::Result<E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.err.downcast()
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.err.downcast_ref()
    }

    /// The tag of the guest-visible payload, or `None` for a trap.
    pub fn tag(&self) -> Option<&'static str> {
        if let Some(code) = self.downcast_ref::<ErrorCode>() {
            Some(code.tag())
        } else {
            self.downcast_ref::<HeaderError>().map(HeaderError::tag)
        }
    }
}

impl From<ErrorCode> for HttpError {
    fn from(error: ErrorCode) -> Self {
        Self { err: error.into() }
    }
}

impl From<HeaderError> for HttpError {
    fn from(error: HeaderError) -> Self {
        Self { err: error.into() }
    }
}

impl From<TableError> for HttpError {
    fn from(error: TableError) -> Self {
        HttpError::trap(error)
    }
}

impl From<anyhow::Error> for HttpError {
    fn from(error: anyhow::Error) -> Self {
        HttpError::trap(error)
    }
}

impl fmt::Debug for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.err.fmt(f)
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.err.fmt(f)
    }
}

impl Error for HttpError {}

/// The `wasi:http/types.header-error` variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    /// A name or value was syntactically invalid.
    #[error("invalid header syntax")]
    InvalidSyntax,
    /// A name is forbidden for guests.
    #[error("forbidden header")]
    Forbidden,
    /// The fields are immutable.
    #[error("fields are immutable")]
    Immutable,
}

impl HeaderError {
    pub fn tag(&self) -> &'static str {
        match self {
            HeaderError::InvalidSyntax => "invalid-syntax",
            HeaderError::Forbidden => "forbidden",
            HeaderError::Immutable => "immutable",
        }
    }
}

/// The `wasi:http/types.DNS-error-payload` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsErrorPayload {
    pub rcode: Option<String>,
    pub info_code: Option<u16>,
}

/// The `wasi:http/types.TLS-alert-received-payload` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsAlertReceivedPayload {
    pub alert_id: Option<u8>,
    pub alert_message: Option<String>,
}

/// The `wasi:http/types.field-size-payload` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSizePayload {
    pub field_name: Option<String>,
    pub field_size: Option<u32>,
}

/// The `wasi:http/types.error-code` variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ErrorCode {
    #[error("DNS timeout")]
    DnsTimeout,
    #[error("DNS error: {0:?}")]
    DnsError(DnsErrorPayload),
    #[error("destination not found")]
    DestinationNotFound,
    #[error("destination unavailable")]
    DestinationUnavailable,
    #[error("destination IP prohibited")]
    DestinationIpProhibited,
    #[error("destination IP unroutable")]
    DestinationIpUnroutable,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection terminated")]
    ConnectionTerminated,
    #[error("connection timeout")]
    ConnectionTimeout,
    #[error("connection read timeout")]
    ConnectionReadTimeout,
    #[error("connection write timeout")]
    ConnectionWriteTimeout,
    #[error("connection limit reached")]
    ConnectionLimitReached,
    #[error("TLS protocol error")]
    TlsProtocolError,
    #[error("TLS certificate error")]
    TlsCertificateError,
    #[error("TLS alert received: {0:?}")]
    TlsAlertReceived(TlsAlertReceivedPayload),
    #[error("HTTP request denied")]
    HttpRequestDenied,
    #[error("HTTP request length required")]
    HttpRequestLengthRequired,
    #[error("HTTP request body size {0:?}")]
    HttpRequestBodySize(Option<u64>),
    #[error("HTTP request method invalid")]
    HttpRequestMethodInvalid,
    #[error("HTTP request URI invalid")]
    HttpRequestUriInvalid,
    #[error("HTTP request URI too long")]
    HttpRequestUriTooLong,
    #[error("HTTP request header section size {0:?}")]
    HttpRequestHeaderSectionSize(Option<u32>),
    #[error("HTTP request header size {0:?}")]
    HttpRequestHeaderSize(Option<FieldSizePayload>),
    #[error("HTTP request trailer section size {0:?}")]
    HttpRequestTrailerSectionSize(Option<u32>),
    #[error("HTTP request trailer size {0:?}")]
    HttpRequestTrailerSize(FieldSizePayload),
    #[error("HTTP response incomplete")]
    HttpResponseIncomplete,
    #[error("HTTP response header section size {0:?}")]
    HttpResponseHeaderSectionSize(Option<u32>),
    #[error("HTTP response header size {0:?}")]
    HttpResponseHeaderSize(FieldSizePayload),
    #[error("HTTP response body size {0:?}")]
    HttpResponseBodySize(Option<u64>),
    #[error("HTTP response trailer section size {0:?}")]
    HttpResponseTrailerSectionSize(Option<u32>),
    #[error("HTTP response trailer size {0:?}")]
    HttpResponseTrailerSize(FieldSizePayload),
    #[error("HTTP response transfer coding {0:?}")]
    HttpResponseTransferCoding(Option<String>),
    #[error("HTTP response content coding {0:?}")]
    HttpResponseContentCoding(Option<String>),
    #[error("HTTP response timeout")]
    HttpResponseTimeout,
    #[error("HTTP upgrade failed")]
    HttpUpgradeFailed,
    #[error("HTTP protocol error")]
    HttpProtocolError,
    #[error("loop detected")]
    LoopDetected,
    #[error("configuration error")]
    ConfigurationError,
    #[error("internal error: {0:?}")]
    InternalError(Option<String>),
}

impl ErrorCode {
    /// The kebab-case case name of this code as guests see it.
    pub fn tag(&self) -> &'static str {
        match self {
            ErrorCode::DnsTimeout => "DNS-timeout",
            ErrorCode::DnsError(_) => "DNS-error",
            ErrorCode::DestinationNotFound => "destination-not-found",
            ErrorCode::DestinationUnavailable => "destination-unavailable",
            ErrorCode::DestinationIpProhibited => "destination-IP-prohibited",
            ErrorCode::DestinationIpUnroutable => "destination-IP-unroutable",
            ErrorCode::ConnectionRefused => "connection-refused",
            ErrorCode::ConnectionTerminated => "connection-terminated",
            ErrorCode::ConnectionTimeout => "connection-timeout",
            ErrorCode::ConnectionReadTimeout => "connection-read-timeout",
            ErrorCode::ConnectionWriteTimeout => "connection-write-timeout",
            ErrorCode::ConnectionLimitReached => "connection-limit-reached",
            ErrorCode::TlsProtocolError => "TLS-protocol-error",
            ErrorCode::TlsCertificateError => "TLS-certificate-error",
            ErrorCode::TlsAlertReceived(_) => "TLS-alert-received",
            ErrorCode::HttpRequestDenied => "HTTP-request-denied",
            ErrorCode::HttpRequestLengthRequired => "HTTP-request-length-required",
            ErrorCode::HttpRequestBodySize(_) => "HTTP-request-body-size",
            ErrorCode::HttpRequestMethodInvalid => "HTTP-request-method-invalid",
            ErrorCode::HttpRequestUriInvalid => "HTTP-request-URI-invalid",
            ErrorCode::HttpRequestUriTooLong => "HTTP-request-URI-too-long",
            ErrorCode::HttpRequestHeaderSectionSize(_) => "HTTP-request-header-section-size",
            ErrorCode::HttpRequestHeaderSize(_) => "HTTP-request-header-size",
            ErrorCode::HttpRequestTrailerSectionSize(_) => "HTTP-request-trailer-section-size",
            ErrorCode::HttpRequestTrailerSize(_) => "HTTP-request-trailer-size",
            ErrorCode::HttpResponseIncomplete => "HTTP-response-incomplete",
            ErrorCode::HttpResponseHeaderSectionSize(_) => "HTTP-response-header-section-size",
            ErrorCode::HttpResponseHeaderSize(_) => "HTTP-response-header-size",
            ErrorCode::HttpResponseBodySize(_) => "HTTP-response-body-size",
            ErrorCode::HttpResponseTrailerSectionSize(_) => "HTTP-response-trailer-section-size",
            ErrorCode::HttpResponseTrailerSize(_) => "HTTP-response-trailer-size",
            ErrorCode::HttpResponseTransferCoding(_) => "HTTP-response-transfer-coding",
            ErrorCode::HttpResponseContentCoding(_) => "HTTP-response-content-coding",
            ErrorCode::HttpResponseTimeout => "HTTP-response-timeout",
            ErrorCode::HttpUpgradeFailed => "HTTP-upgrade-failed",
            ErrorCode::HttpProtocolError => "HTTP-protocol-error",
            ErrorCode::LoopDetected => "loop-detected",
            ErrorCode::ConfigurationError => "configuration-error",
            ErrorCode::InternalError(_) => "internal-error",
        }
    }
}

pub(crate) fn dns_error(rcode: String, info_code: u16) -> ErrorCode {
    ErrorCode::DnsError(DnsErrorPayload {
        rcode: Some(rcode),
        info_code: Some(info_code),
    })
}

pub(crate) fn internal_error(msg: String) -> ErrorCode {
    ErrorCode::InternalError(Some(msg))
}

/// Translate a [`http::Error`] to a wasi-http `ErrorCode` in the context of a request.
pub fn http_request_error(err: http::Error) -> ErrorCode {
    if err.is::<http::uri::InvalidUri>() {
        return ErrorCode::HttpRequestUriInvalid;
    }

    tracing::warn!("http request error: {err:?}");

    ErrorCode::HttpProtocolError
}

/// Translate a [`hyper::Error`] to a wasi-http `ErrorCode` in the context of a request.
pub fn hyper_request_error(err: hyper::Error) -> ErrorCode {
    // If there's a source, we might be able to extract a wasi-http error from it.
    if let Some(cause) = err.source() {
        if let Some(err) = cause.downcast_ref::<ErrorCode>() {
            return err.clone();
        }
    }

    tracing::warn!("hyper request error: {err:?}");

    ErrorCode::HttpProtocolError
}

/// Translate a [`hyper::Error`] to a wasi-http `ErrorCode` in the context of a response.
pub fn hyper_response_error(err: hyper::Error) -> ErrorCode {
    if err.is_timeout() {
        return ErrorCode::HttpResponseTimeout;
    }

    // If there's a source, we might be able to extract a wasi-http error from it.
    if let Some(cause) = err.source() {
        if let Some(err) = cause.downcast_ref::<ErrorCode>() {
            return err.clone();
        }
    }

    tracing::warn!("hyper response error: {err:?}");

    ErrorCode::HttpProtocolError
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn payload_tags() {
        let err = HttpError::from(HeaderError::Forbidden);
        assert_eq!(err.tag(), Some("forbidden"));
        assert_eq!(err.downcast::<HeaderError>().unwrap(), HeaderError::Forbidden);

        let err = HttpError::from(ErrorCode::ConnectionTimeout);
        assert_eq!(err.tag(), Some("connection-timeout"));
        assert!(err.downcast_ref::<HeaderError>().is_none());

        let err = HttpError::trap(anyhow::anyhow!("bad handle"));
        assert_eq!(err.tag(), None);
        assert!(err.downcast::<ErrorCode>().is_err());
    }

    #[test]
    fn uri_errors() {
        let err = http::Request::builder()
            .uri("http://exa mple.com/")
            .body(())
            .unwrap_err();
        assert_eq!(http_request_error(err), ErrorCode::HttpRequestUriInvalid);
    }
}
