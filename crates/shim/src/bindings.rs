//! Host-side traits for the `wasi:cli`, `wasi:clocks` and `wasi:sockets`
//! interfaces, laid out the same way as
//! [`preview_shim_io::bindings`].
//!
//! All of them are implemented for [`WasiCtxView`](crate::WasiCtxView).
//! The `wasi:io` traits are implemented through
//! [`IoImpl`](preview_shim_io::IoImpl) over the same view.

pub use preview_shim_io::bindings::wasi::io;

pub mod wasi {
    pub use preview_shim_io::bindings::wasi::io;

    pub mod cli {
        pub mod environment {
            pub trait Host {
                fn get_environment(&mut self) -> anyhow::Result<Vec<(String, String)>>;

                fn get_arguments(&mut self) -> anyhow::Result<Vec<String>>;

                fn initial_cwd(&mut self) -> anyhow::Result<Option<String>>;
            }
        }

        pub mod stdin {
            use preview_shim_io::{DynInputStream, Resource};

            pub trait Host {
                fn get_stdin(&mut self) -> anyhow::Result<Resource<DynInputStream>>;
            }
        }

        pub mod stdout {
            use preview_shim_io::{DynOutputStream, Resource};

            pub trait Host {
                fn get_stdout(&mut self) -> anyhow::Result<Resource<DynOutputStream>>;
            }
        }

        pub mod stderr {
            use preview_shim_io::{DynOutputStream, Resource};

            pub trait Host {
                fn get_stderr(&mut self) -> anyhow::Result<Resource<DynOutputStream>>;
            }
        }
    }

    pub mod clocks {
        pub mod monotonic_clock {
            use preview_shim_io::{Pollable, Resource};

            /// Nanoseconds since the clock's epoch.
            pub type Instant = u64;
            /// Nanoseconds.
            pub type Duration = u64;

            pub trait Host {
                fn now(&mut self) -> anyhow::Result<Instant>;

                fn resolution(&mut self) -> anyhow::Result<Duration>;

                fn subscribe_instant(&mut self, when: Instant) -> anyhow::Result<Resource<Pollable>>;

                fn subscribe_duration(
                    &mut self,
                    duration: Duration,
                ) -> anyhow::Result<Resource<Pollable>>;
            }
        }

        pub mod wall_clock {
            pub use crate::clocks::Datetime;

            pub trait Host {
                fn now(&mut self) -> anyhow::Result<Datetime>;

                fn resolution(&mut self) -> anyhow::Result<Datetime>;
            }
        }
    }

    pub mod sockets {
        pub mod network {
            use preview_shim_io::Resource;

            pub use crate::sockets::{
                ErrorCode, IpAddressFamily, IpSocketAddress, Network, SocketError,
            };

            pub trait Host {
                /// Lowers a socket error for the guest. Traps come back as
                /// `Err`.
                fn convert_error_code(&mut self, err: SocketError) -> anyhow::Result<ErrorCode>;
            }

            pub trait HostNetwork {
                fn drop(&mut self, this: Resource<Network>) -> anyhow::Result<()>;
            }
        }

        pub mod instance_network {
            use super::network::Network;
            use preview_shim_io::Resource;

            pub trait Host {
                fn instance_network(&mut self) -> anyhow::Result<Resource<Network>>;
            }
        }

        pub mod tcp_create_socket {
            use super::network::IpAddressFamily;
            use crate::sockets::{SocketResult, TcpSocket};
            use preview_shim_io::Resource;

            pub trait Host {
                fn create_tcp_socket(
                    &mut self,
                    address_family: IpAddressFamily,
                ) -> SocketResult<Resource<TcpSocket>>;
            }
        }

        pub mod tcp {
            use super::network::{IpAddressFamily, IpSocketAddress, Network};
            use crate::sockets::SocketResult;
            use preview_shim_io::{DynInputStream, DynOutputStream, Pollable, Resource};

            pub use crate::sockets::TcpSocket;

            /// Nanoseconds.
            pub type Duration = u64;

            #[derive(Debug, Clone, Copy, PartialEq, Eq)]
            pub enum ShutdownType {
                Receive,
                Send,
                Both,
            }

            pub trait Host {}

            #[async_trait::async_trait]
            pub trait HostTcpSocket {
                async fn start_bind(
                    &mut self,
                    this: Resource<TcpSocket>,
                    network: Resource<Network>,
                    local_address: IpSocketAddress,
                ) -> SocketResult<()>;

                fn finish_bind(&mut self, this: Resource<TcpSocket>) -> SocketResult<()>;

                async fn start_connect(
                    &mut self,
                    this: Resource<TcpSocket>,
                    network: Resource<Network>,
                    remote_address: IpSocketAddress,
                ) -> SocketResult<()>;

                fn finish_connect(
                    &mut self,
                    this: Resource<TcpSocket>,
                ) -> SocketResult<(Resource<DynInputStream>, Resource<DynOutputStream>)>;

                fn start_listen(&mut self, this: Resource<TcpSocket>) -> SocketResult<()>;

                fn finish_listen(&mut self, this: Resource<TcpSocket>) -> SocketResult<()>;

                fn accept(
                    &mut self,
                    this: Resource<TcpSocket>,
                ) -> SocketResult<(
                    Resource<TcpSocket>,
                    Resource<DynInputStream>,
                    Resource<DynOutputStream>,
                )>;

                fn local_address(&mut self, this: Resource<TcpSocket>)
                -> SocketResult<IpSocketAddress>;

                fn remote_address(
                    &mut self,
                    this: Resource<TcpSocket>,
                ) -> SocketResult<IpSocketAddress>;

                fn is_listening(&mut self, this: Resource<TcpSocket>) -> anyhow::Result<bool>;

                fn address_family(
                    &mut self,
                    this: Resource<TcpSocket>,
                ) -> anyhow::Result<IpAddressFamily>;

                fn set_listen_backlog_size(
                    &mut self,
                    this: Resource<TcpSocket>,
                    value: u64,
                ) -> SocketResult<()>;

                fn keep_alive_enabled(&mut self, this: Resource<TcpSocket>) -> SocketResult<bool>;

                fn set_keep_alive_enabled(
                    &mut self,
                    this: Resource<TcpSocket>,
                    value: bool,
                ) -> SocketResult<()>;

                fn keep_alive_idle_time(
                    &mut self,
                    this: Resource<TcpSocket>,
                ) -> SocketResult<Duration>;

                fn set_keep_alive_idle_time(
                    &mut self,
                    this: Resource<TcpSocket>,
                    value: Duration,
                ) -> SocketResult<()>;

                fn keep_alive_interval(
                    &mut self,
                    this: Resource<TcpSocket>,
                ) -> SocketResult<Duration>;

                fn set_keep_alive_interval(
                    &mut self,
                    this: Resource<TcpSocket>,
                    value: Duration,
                ) -> SocketResult<()>;

                fn keep_alive_count(&mut self, this: Resource<TcpSocket>) -> SocketResult<u32>;

                fn set_keep_alive_count(
                    &mut self,
                    this: Resource<TcpSocket>,
                    value: u32,
                ) -> SocketResult<()>;

                fn hop_limit(&mut self, this: Resource<TcpSocket>) -> SocketResult<u8>;

                fn set_hop_limit(&mut self, this: Resource<TcpSocket>, value: u8)
                -> SocketResult<()>;

                fn receive_buffer_size(&mut self, this: Resource<TcpSocket>) -> SocketResult<u64>;

                fn set_receive_buffer_size(
                    &mut self,
                    this: Resource<TcpSocket>,
                    value: u64,
                ) -> SocketResult<()>;

                fn send_buffer_size(&mut self, this: Resource<TcpSocket>) -> SocketResult<u64>;

                fn set_send_buffer_size(
                    &mut self,
                    this: Resource<TcpSocket>,
                    value: u64,
                ) -> SocketResult<()>;

                fn subscribe(&mut self, this: Resource<TcpSocket>)
                -> anyhow::Result<Resource<Pollable>>;

                fn shutdown(
                    &mut self,
                    this: Resource<TcpSocket>,
                    shutdown_type: ShutdownType,
                ) -> SocketResult<()>;

                fn drop(&mut self, this: Resource<TcpSocket>) -> anyhow::Result<()>;
            }
        }
    }
}
