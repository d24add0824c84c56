//! Host-side traits for the `wasi:io` interfaces.
//!
//! Each interface is a module holding a `Host` trait for its free functions
//! and one `Host<Resource>` trait per resource type. Parameters typed
//! `Resource<T>` carry the guest's handle: borrowed for methods, owned for
//! `drop`. Methods return `anyhow::Result` where only traps can happen, and
//! [`StreamError`](crate::streams::StreamError) where the guest sees a
//! `stream-error`.

pub mod wasi {
    pub mod io {
        pub mod error {
            use crate::table::Resource;

            /// The `wasi:io/error.error` resource.
            pub type Error = crate::streams::Error;

            pub trait Host {}

            pub trait HostError {
                fn drop(&mut self, err: Resource<Error>) -> anyhow::Result<()>;

                fn to_debug_string(&mut self, err: Resource<Error>) -> anyhow::Result<String>;
            }
        }

        pub mod poll {
            use crate::poll::Pollable;
            use crate::table::Resource;

            #[async_trait::async_trait]
            pub trait Host {
                /// Waits for at least one of `pollables` and returns the
                /// indices of every ready member.
                async fn poll(&mut self, pollables: Vec<Resource<Pollable>>)
                -> anyhow::Result<Vec<u32>>;
            }

            #[async_trait::async_trait]
            pub trait HostPollable {
                async fn block(&mut self, pollable: Resource<Pollable>) -> anyhow::Result<()>;

                async fn ready(&mut self, pollable: Resource<Pollable>) -> anyhow::Result<bool>;

                fn drop(&mut self, pollable: Resource<Pollable>) -> anyhow::Result<()>;
            }
        }

        pub mod streams {
            use crate::poll::Pollable;
            use crate::streams::{DynInputStream, DynOutputStream, StreamResult};
            use crate::table::Resource;

            pub use super::error::Error;

            /// The `wasi:io/streams.stream-error` variant as the guest sees it.
            #[derive(Debug)]
            pub enum StreamError {
                LastOperationFailed(Resource<Error>),
                Closed,
            }

            impl StreamError {
                pub fn tag(&self) -> &'static str {
                    match self {
                        StreamError::LastOperationFailed(_) => "last-operation-failed",
                        StreamError::Closed => "closed",
                    }
                }
            }

            pub trait Host {
                /// Lowers a host stream error for the guest. Traps come back
                /// as `Err`.
                fn convert_stream_error(
                    &mut self,
                    err: crate::streams::StreamError,
                ) -> anyhow::Result<StreamError>;
            }

            #[async_trait::async_trait]
            pub trait HostInputStream {
                fn read(&mut self, stream: Resource<DynInputStream>, len: u64)
                -> StreamResult<Vec<u8>>;

                async fn blocking_read(
                    &mut self,
                    stream: Resource<DynInputStream>,
                    len: u64,
                ) -> StreamResult<Vec<u8>>;

                fn skip(&mut self, stream: Resource<DynInputStream>, len: u64) -> StreamResult<u64>;

                async fn blocking_skip(
                    &mut self,
                    stream: Resource<DynInputStream>,
                    len: u64,
                ) -> StreamResult<u64>;

                fn subscribe(
                    &mut self,
                    stream: Resource<DynInputStream>,
                ) -> anyhow::Result<Resource<Pollable>>;

                async fn drop(&mut self, stream: Resource<DynInputStream>) -> anyhow::Result<()>;
            }

            #[async_trait::async_trait]
            pub trait HostOutputStream {
                fn check_write(&mut self, stream: Resource<DynOutputStream>) -> StreamResult<u64>;

                fn write(&mut self, stream: Resource<DynOutputStream>, bytes: Vec<u8>)
                -> StreamResult<()>;

                async fn blocking_write_and_flush(
                    &mut self,
                    stream: Resource<DynOutputStream>,
                    bytes: Vec<u8>,
                ) -> StreamResult<()>;

                fn flush(&mut self, stream: Resource<DynOutputStream>) -> StreamResult<()>;

                async fn blocking_flush(&mut self, stream: Resource<DynOutputStream>)
                -> StreamResult<()>;

                fn subscribe(
                    &mut self,
                    stream: Resource<DynOutputStream>,
                ) -> anyhow::Result<Resource<Pollable>>;

                fn write_zeroes(&mut self, stream: Resource<DynOutputStream>, len: u64)
                -> StreamResult<()>;

                async fn blocking_write_zeroes_and_flush(
                    &mut self,
                    stream: Resource<DynOutputStream>,
                    len: u64,
                ) -> StreamResult<()>;

                fn splice(
                    &mut self,
                    dest: Resource<DynOutputStream>,
                    src: Resource<DynInputStream>,
                    len: u64,
                ) -> StreamResult<u64>;

                async fn blocking_splice(
                    &mut self,
                    dest: Resource<DynOutputStream>,
                    src: Resource<DynInputStream>,
                    len: u64,
                ) -> StreamResult<u64>;

                async fn drop(&mut self, stream: Resource<DynOutputStream>) -> anyhow::Result<()>;
            }
        }
    }
}
