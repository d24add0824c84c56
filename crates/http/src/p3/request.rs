use super::body::{MessageBody, TrailersReader, TransmitReader};
use crate::body::HyperOutgoingBody;
use crate::error::ErrorCode;
use crate::fields::Fields;
use crate::types::{
    HostOutgoingRequest, Method, RequestOptions, Scheme, is_valid_authority,
    is_valid_path_with_query,
};
use preview_shim_io::p3::StreamReader;

/// The concrete type behind a Preview3 `wasi:http/types/request` resource.
///
/// [`Request::new`] is the only way to build one.
pub struct Request {
    method: Method,
    scheme: Option<Scheme>,
    authority: Option<String>,
    path_with_query: Option<String>,
    headers: Fields,
    options: Option<RequestOptions>,
    body: MessageBody,
}

impl Request {
    /// Construct a new [`Request`] with a `GET` method and no URI parts.
    ///
    /// `headers` become immutable. The returned future settles once the body
    /// and trailers have been fully transmitted, or with the error that
    /// stopped them.
    pub fn new(
        mut headers: Fields,
        contents: Option<StreamReader<u8>>,
        trailers: TrailersReader,
        options: Option<RequestOptions>,
    ) -> (Request, TransmitReader) {
        headers.freeze();
        let (body, result) = MessageBody::guest(contents, trailers);
        let req = Request {
            method: Method::Get,
            scheme: None,
            authority: None,
            path_with_query: None,
            headers,
            options,
            body,
        };
        (req, result)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn set_method(&mut self, method: Method) -> Result<(), ()> {
        if http::Method::try_from(method.clone()).is_err() {
            return Err(());
        }
        self.method = method;
        Ok(())
    }

    pub fn scheme(&self) -> Option<&Scheme> {
        self.scheme.as_ref()
    }

    pub fn set_scheme(&mut self, scheme: Option<Scheme>) -> Result<(), ()> {
        if let Some(scheme) = &scheme {
            if http::uri::Scheme::try_from(scheme.clone()).is_err() {
                return Err(());
            }
        }
        self.scheme = scheme;
        Ok(())
    }

    pub fn authority(&self) -> Option<&str> {
        self.authority.as_deref()
    }

    pub fn set_authority(&mut self, authority: Option<String>) -> Result<(), ()> {
        if let Some(authority) = &authority {
            if !is_valid_authority(authority) {
                return Err(());
            }
        }
        self.authority = authority;
        Ok(())
    }

    pub fn path_with_query(&self) -> Option<&str> {
        self.path_with_query.as_deref()
    }

    pub fn set_path_with_query(&mut self, path_with_query: Option<String>) -> Result<(), ()> {
        if let Some(path) = &path_with_query {
            if !is_valid_path_with_query(path) {
                return Err(());
            }
        }
        self.path_with_query = path_with_query;
        Ok(())
    }

    /// The request's headers, which are immutable.
    pub fn headers(&self) -> &Fields {
        &self.headers
    }

    pub fn options(&self) -> Option<&RequestOptions> {
        self.options.as_ref()
    }

    /// Takes the body as a stream and its trailers.
    ///
    /// The body can be taken once: every later call fails, whether or not
    /// the first stream was read to the end.
    pub fn body(&mut self) -> Result<(StreamReader<u8>, TrailersReader), ()> {
        let body = self.body.take().ok_or(())?;
        body.into_guest().map_err(|e| {
            tracing::warn!("failed to take request body: {e}");
        })
    }

    /// Converts this request into the one hyper sends, along with its
    /// options.
    pub(crate) fn into_http(
        self,
    ) -> Result<(hyper::Request<HyperOutgoingBody>, RequestOptions), ErrorCode> {
        let Request {
            method,
            scheme,
            authority,
            path_with_query,
            headers,
            options,
            body,
        } = self;
        let req = HostOutgoingRequest {
            method,
            scheme,
            authority,
            path_with_query,
            headers: headers.into_map(),
            body: Some(body.into_http()?),
        };
        Ok((
            crate::http_impl::into_hyper_request(req)?,
            options.unwrap_or_default(),
        ))
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("scheme", &self.scheme)
            .field("authority", &self.authority)
            .field("path_with_query", &self.path_with_query)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}
