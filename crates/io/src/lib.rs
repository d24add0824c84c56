//! # Preview shim I/O core
//!
//! This crate provides the foundation shared by the other shim crates: the
//! [`ResourceTable`] mapping guest handles to host objects, the `pollable`
//! resource and `poll`, the Preview2 `input-stream` and `output-stream`
//! resources with their host surface, and the Preview3 [`p3::stream`] and
//! [`p3::future`] channels.
//!
//! Readiness throughout is native async Rust: anything that implements
//! [`Subscribe`] can back a pollable, so stream, socket, clock and HTTP
//! readiness all compose in a single `poll` call. Synchronous embedders go
//! through [`runtime::in_tokio`] or a [`bridge::SyncBridge`].

pub mod bindings;
pub mod bridge;
mod impls;
pub mod p3;
pub mod pipe;
pub mod poll;
pub mod runtime;
pub mod streams;
mod table;
mod view;
mod write_stream;

pub use self::poll::{Pollable, Subscribe, subscribe};
pub use self::streams::{
    DynInputStream, DynOutputStream, Error, InputStream, OutputStream, StreamError, StreamResult,
};
pub use self::table::{Resource, ResourceTable, TableError};
pub use self::view::{IoImpl, IoView};
pub use self::write_stream::AsyncWriteStream;

#[doc(no_inline)]
pub use async_trait::async_trait;
