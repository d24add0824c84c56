//! Host-side traits for the `wasi:http` interfaces, laid out the same way as
//! [`preview_shim_io::bindings`].
//!
//! All of them are implemented for
//! [`WasiHttpImpl`](crate::WasiHttpImpl) over any
//! [`WasiHttpView`](crate::WasiHttpView).

pub use preview_shim_io::bindings::wasi::io;

pub mod wasi {
    pub use preview_shim_io::bindings::wasi::io;

    pub mod http {
        pub mod types {
            use crate::error::{HttpError, HttpResult};
            use preview_shim_io::{DynInputStream, DynOutputStream, Pollable, Resource};

            pub use crate::error::{
                DnsErrorPayload, ErrorCode, FieldSizePayload, HeaderError, TlsAlertReceivedPayload,
            };
            pub use crate::types::{Method, RequestOptions, Scheme};

            pub type FieldKey = String;
            pub type FieldValue = Vec<u8>;
            pub type StatusCode = u16;
            /// Nanoseconds.
            pub type Duration = u64;

            pub type Fields = crate::types::HostFields;
            pub type Headers = crate::types::HostFields;
            pub type Trailers = crate::types::HostFields;
            pub type OutgoingRequest = crate::types::HostOutgoingRequest;
            pub type IncomingResponse = crate::types::HostIncomingResponse;
            pub type FutureIncomingResponse = crate::types::HostFutureIncomingResponse;
            pub type IncomingBody = crate::body::HostIncomingBody;
            pub type FutureTrailers = crate::body::HostFutureTrailers;
            pub type OutgoingBody = crate::body::HostOutgoingBody;

            pub trait Host {
                /// Extracts an HTTP error code from a `wasi:io/error.error`,
                /// if it carries one.
                fn http_error_code(
                    &mut self,
                    err: Resource<super::super::io::error::Error>,
                ) -> anyhow::Result<Option<ErrorCode>>;

                /// Lowers an HTTP error for the guest. Traps come back as
                /// `Err`.
                fn convert_error_code(&mut self, err: HttpError) -> anyhow::Result<ErrorCode>;

                /// Lowers a header error for the guest. Traps come back as
                /// `Err`.
                fn convert_header_error(&mut self, err: HttpError) -> anyhow::Result<HeaderError>;
            }

            pub trait HostFields {
                fn new(&mut self) -> anyhow::Result<Resource<Fields>>;

                fn from_list(
                    &mut self,
                    entries: Vec<(FieldKey, FieldValue)>,
                ) -> HttpResult<Resource<Fields>>;

                fn get(&mut self, this: Resource<Fields>, name: FieldKey)
                -> anyhow::Result<Vec<FieldValue>>;

                fn has(&mut self, this: Resource<Fields>, name: FieldKey) -> anyhow::Result<bool>;

                fn set(
                    &mut self,
                    this: Resource<Fields>,
                    name: FieldKey,
                    values: Vec<FieldValue>,
                ) -> HttpResult<()>;

                fn delete(&mut self, this: Resource<Fields>, name: FieldKey) -> HttpResult<()>;

                fn get_and_delete(
                    &mut self,
                    this: Resource<Fields>,
                    name: FieldKey,
                ) -> HttpResult<Vec<FieldValue>>;

                fn append(
                    &mut self,
                    this: Resource<Fields>,
                    name: FieldKey,
                    value: FieldValue,
                ) -> HttpResult<()>;

                fn entries(
                    &mut self,
                    this: Resource<Fields>,
                ) -> anyhow::Result<Vec<(FieldKey, FieldValue)>>;

                /// A mutable copy of `this`.
                fn clone(&mut self, this: Resource<Fields>) -> anyhow::Result<Resource<Fields>>;

                fn drop(&mut self, this: Resource<Fields>) -> anyhow::Result<()>;
            }

            pub trait HostOutgoingRequest {
                /// Moves `headers` into a new request.
                fn new(
                    &mut self,
                    headers: Resource<Headers>,
                ) -> anyhow::Result<Resource<OutgoingRequest>>;

                fn body(
                    &mut self,
                    this: Resource<OutgoingRequest>,
                ) -> anyhow::Result<Result<Resource<OutgoingBody>, ()>>;

                fn method(&mut self, this: Resource<OutgoingRequest>) -> anyhow::Result<Method>;

                fn set_method(
                    &mut self,
                    this: Resource<OutgoingRequest>,
                    method: Method,
                ) -> anyhow::Result<Result<(), ()>>;

                fn path_with_query(
                    &mut self,
                    this: Resource<OutgoingRequest>,
                ) -> anyhow::Result<Option<String>>;

                fn set_path_with_query(
                    &mut self,
                    this: Resource<OutgoingRequest>,
                    path_with_query: Option<String>,
                ) -> anyhow::Result<Result<(), ()>>;

                fn scheme(
                    &mut self,
                    this: Resource<OutgoingRequest>,
                ) -> anyhow::Result<Option<Scheme>>;

                fn set_scheme(
                    &mut self,
                    this: Resource<OutgoingRequest>,
                    scheme: Option<Scheme>,
                ) -> anyhow::Result<Result<(), ()>>;

                fn authority(
                    &mut self,
                    this: Resource<OutgoingRequest>,
                ) -> anyhow::Result<Option<String>>;

                fn set_authority(
                    &mut self,
                    this: Resource<OutgoingRequest>,
                    authority: Option<String>,
                ) -> anyhow::Result<Result<(), ()>>;

                /// An immutable child view of the request's headers.
                fn headers(
                    &mut self,
                    this: Resource<OutgoingRequest>,
                ) -> anyhow::Result<Resource<Headers>>;

                fn drop(&mut self, this: Resource<OutgoingRequest>) -> anyhow::Result<()>;
            }

            pub trait HostRequestOptions {
                fn new(&mut self) -> anyhow::Result<Resource<RequestOptions>>;

                fn connect_timeout(
                    &mut self,
                    this: Resource<RequestOptions>,
                ) -> anyhow::Result<Option<Duration>>;

                fn set_connect_timeout(
                    &mut self,
                    this: Resource<RequestOptions>,
                    duration: Option<Duration>,
                ) -> anyhow::Result<Result<(), ()>>;

                fn first_byte_timeout(
                    &mut self,
                    this: Resource<RequestOptions>,
                ) -> anyhow::Result<Option<Duration>>;

                fn set_first_byte_timeout(
                    &mut self,
                    this: Resource<RequestOptions>,
                    duration: Option<Duration>,
                ) -> anyhow::Result<Result<(), ()>>;

                fn between_bytes_timeout(
                    &mut self,
                    this: Resource<RequestOptions>,
                ) -> anyhow::Result<Option<Duration>>;

                fn set_between_bytes_timeout(
                    &mut self,
                    this: Resource<RequestOptions>,
                    duration: Option<Duration>,
                ) -> anyhow::Result<Result<(), ()>>;

                fn drop(&mut self, this: Resource<RequestOptions>) -> anyhow::Result<()>;
            }

            pub trait HostIncomingResponse {
                fn status(&mut self, this: Resource<IncomingResponse>)
                -> anyhow::Result<StatusCode>;

                fn headers(
                    &mut self,
                    this: Resource<IncomingResponse>,
                ) -> anyhow::Result<Resource<Headers>>;

                fn consume(
                    &mut self,
                    this: Resource<IncomingResponse>,
                ) -> anyhow::Result<Result<Resource<IncomingBody>, ()>>;

                fn drop(&mut self, this: Resource<IncomingResponse>) -> anyhow::Result<()>;
            }

            pub trait HostIncomingBody {
                fn stream(
                    &mut self,
                    this: Resource<IncomingBody>,
                ) -> anyhow::Result<Result<Resource<DynInputStream>, ()>>;

                fn finish(
                    &mut self,
                    this: Resource<IncomingBody>,
                ) -> anyhow::Result<Resource<FutureTrailers>>;

                fn drop(&mut self, this: Resource<IncomingBody>) -> anyhow::Result<()>;
            }

            pub trait HostFutureTrailers {
                fn subscribe(
                    &mut self,
                    this: Resource<FutureTrailers>,
                ) -> anyhow::Result<Resource<Pollable>>;

                fn get(
                    &mut self,
                    this: Resource<FutureTrailers>,
                ) -> anyhow::Result<Option<Result<Result<Option<Resource<Trailers>>, ErrorCode>, ()>>>;

                fn drop(&mut self, this: Resource<FutureTrailers>) -> anyhow::Result<()>;
            }

            pub trait HostOutgoingBody {
                fn write(
                    &mut self,
                    this: Resource<OutgoingBody>,
                ) -> anyhow::Result<Result<Resource<DynOutputStream>, ()>>;

                fn finish(
                    &mut self,
                    this: Resource<OutgoingBody>,
                    trailers: Option<Resource<Trailers>>,
                ) -> HttpResult<()>;

                fn drop(&mut self, this: Resource<OutgoingBody>) -> anyhow::Result<()>;
            }

            pub trait HostFutureIncomingResponse {
                fn subscribe(
                    &mut self,
                    this: Resource<FutureIncomingResponse>,
                ) -> anyhow::Result<Resource<Pollable>>;

                /// `None` while pending, `Some(Err(()))` once the response
                /// was taken by an earlier call.
                fn get(
                    &mut self,
                    this: Resource<FutureIncomingResponse>,
                ) -> anyhow::Result<
                    Option<Result<Result<Resource<IncomingResponse>, ErrorCode>, ()>>,
                >;

                fn drop(&mut self, this: Resource<FutureIncomingResponse>)
                -> anyhow::Result<()>;
            }
        }

        pub mod outgoing_handler {
            use super::types::{FutureIncomingResponse, OutgoingRequest, RequestOptions};
            use crate::error::HttpResult;
            use preview_shim_io::Resource;

            pub use super::types::ErrorCode;

            pub trait Host {
                /// Sends `request`, consuming it.
                fn handle(
                    &mut self,
                    request: Resource<OutgoingRequest>,
                    options: Option<Resource<RequestOptions>>,
                ) -> HttpResult<Resource<FutureIncomingResponse>>;
            }
        }
    }
}
