//! # Preview shim HTTP
//!
//! Host implementation of the outgoing side of `wasi:http`: header
//! [`Fields`], requests and responses, their bodies, and a hyper-based
//! client that sends requests over plain TCP or TLS.
//!
//! Embedders keep a [`WasiHttpCtx`] next to the [`ResourceTable`] shared with
//! [`preview_shim_io`] and expose both through [`WasiHttpView`]. The host
//! traits in [`bindings`] are implemented for [`WasiHttpImpl`]; the
//! Preview3 flavor lives in [`p3`].
//!
//! Requests are sent through [`WasiHttpView::send_request`], which defaults
//! to [`types::default_send_request`]. Embedders override it to route or
//! refuse requests. [`http_impl::send_request_sync`] sends a buffered request
//! from synchronous code.
//!
//! [`ResourceTable`]: preview_shim_io::ResourceTable

pub mod bindings;
pub mod body;
mod error;
pub mod fields;
pub mod http_impl;
pub mod io;
pub mod p3;
pub mod types;
mod types_impl;

pub use crate::error::{
    DnsErrorPayload, ErrorCode, FieldSizePayload, HeaderError, HttpError, HttpResult,
    TlsAlertReceivedPayload, http_request_error, hyper_request_error, hyper_response_error,
};
pub use crate::fields::{FieldMap, Fields};
pub use crate::types::{WasiHttpCtx, WasiHttpCtxBuilder, WasiHttpCtxView, WasiHttpImpl, WasiHttpView};
