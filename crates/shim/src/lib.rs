//! # Preview shim host
//!
//! Host implementations of the `wasi:cli`, `wasi:clocks` and `wasi:sockets`
//! interfaces, built on the resource table and streams of
//! [`preview_shim_io`].
//!
//! Everything is configured through a [`WasiCtxBuilder`] into a [`WasiCtx`].
//! Embedders store the context next to a [`ResourceTable`] and borrow both
//! as a [`WasiCtxView`], which implements the host traits in [`bindings`].
//!
//! Two surfaces are offered over the same host objects:
//!
//! * The Preview2 surface in [`bindings`] works with handles in the table,
//!   two-phase `start-*`/`finish-*` socket operations and pollables.
//! * The Preview3 surface is plain async methods on [`sockets::TcpSocket`],
//!   [`sockets::UdpSocket`] and [`WasiCtx`], with data moving through
//!   [`preview_shim_io::p3`] streams and futures.

pub mod bindings;
pub mod cli;
pub mod clocks;
mod ctx;
mod host;
pub mod sockets;

pub use self::ctx::{WasiCtx, WasiCtxBuilder, WasiCtxView};
pub use preview_shim_io::{
    DynInputStream, DynOutputStream, InputStream, IoImpl, IoView, OutputStream, Pollable,
    Resource, ResourceTable, StreamError, StreamResult, Subscribe,
};
