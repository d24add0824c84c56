use crate::bindings::wasi::sockets::{instance_network, network, tcp, tcp_create_socket};
use crate::ctx::WasiCtxView;
use crate::sockets::{
    ErrorCode, IpAddressFamily, IpSocketAddress, Network, SocketAddrUse, SocketError,
    SocketResult, TcpSocket, TcpState,
};
use preview_shim_io::{DynInputStream, DynOutputStream, Pollable, Resource};
use rustix::net::Shutdown;
use std::net::SocketAddr;

impl network::Host for WasiCtxView<'_> {
    fn convert_error_code(&mut self, error: SocketError) -> anyhow::Result<ErrorCode> {
        match error {
            SocketError::Code(code) => Ok(code),
            SocketError::Trap(e) => Err(e),
        }
    }
}

impl network::HostNetwork for WasiCtxView<'_> {
    fn drop(&mut self, this: Resource<Network>) -> anyhow::Result<()> {
        self.table.delete_if_present(this)?;
        Ok(())
    }
}

impl instance_network::Host for WasiCtxView<'_> {
    fn instance_network(&mut self) -> anyhow::Result<Resource<Network>> {
        let network = Network {
            sockets: self.ctx.sockets.clone(),
        };
        Ok(self.table.push(network)?)
    }
}

impl tcp_create_socket::Host for WasiCtxView<'_> {
    fn create_tcp_socket(
        &mut self,
        address_family: IpAddressFamily,
    ) -> SocketResult<Resource<TcpSocket>> {
        let socket = self.ctx.create_tcp_socket(address_family)?;
        Ok(self.table.push(socket)?)
    }
}

impl tcp::Host for WasiCtxView<'_> {}

impl WasiCtxView<'_> {
    /// Pushes the stream pair of `stream` as children of `socket`.
    fn push_streams(
        &mut self,
        socket: &Resource<TcpSocket>,
        stream: &std::sync::Arc<tokio::net::TcpStream>,
    ) -> SocketResult<(Resource<DynInputStream>, Resource<DynOutputStream>)> {
        let (input, output) = TcpSocket::p2_streams(stream);
        let input = self.table.push_child(input, socket)?;
        let output = self.table.push_child(output, socket)?;
        Ok((input, output))
    }
}

#[async_trait::async_trait]
impl tcp::HostTcpSocket for WasiCtxView<'_> {
    async fn start_bind(
        &mut self,
        this: Resource<TcpSocket>,
        network: Resource<Network>,
        local_address: IpSocketAddress,
    ) -> SocketResult<()> {
        let local_address = SocketAddr::from(local_address);
        let sockets = self.table.get(&network)?.sockets.clone();

        // Ensure that we're allowed to bind to this address.
        sockets.check(local_address, SocketAddrUse::TcpBind).await?;

        let socket = self.table.get_mut(&this)?;
        socket.start_bind(local_address)?;
        Ok(())
    }

    fn finish_bind(&mut self, this: Resource<TcpSocket>) -> SocketResult<()> {
        let socket = self.table.get_mut(&this)?;
        socket.finish_bind()?;
        Ok(())
    }

    async fn start_connect(
        &mut self,
        this: Resource<TcpSocket>,
        network: Resource<Network>,
        remote_address: IpSocketAddress,
    ) -> SocketResult<()> {
        let remote_address = SocketAddr::from(remote_address);
        let sockets = self.table.get(&network)?.sockets.clone();

        // Ensure that we're allowed to connect to this address.
        sockets
            .check(remote_address, SocketAddrUse::TcpConnect)
            .await?;

        let socket = self.table.get_mut(&this)?;
        socket.start_connect(remote_address)?;
        Ok(())
    }

    fn finish_connect(
        &mut self,
        this: Resource<TcpSocket>,
    ) -> SocketResult<(Resource<DynInputStream>, Resource<DynOutputStream>)> {
        let socket = self.table.get_mut(&this)?;
        let stream = socket.finish_connect()?;
        self.push_streams(&this, &stream)
    }

    fn start_listen(&mut self, this: Resource<TcpSocket>) -> SocketResult<()> {
        let socket = self.table.get_mut(&this)?;
        socket.start_listen()?;
        Ok(())
    }

    fn finish_listen(&mut self, this: Resource<TcpSocket>) -> SocketResult<()> {
        let socket = self.table.get_mut(&this)?;
        socket.finish_listen()?;
        Ok(())
    }

    fn accept(
        &mut self,
        this: Resource<TcpSocket>,
    ) -> SocketResult<(
        Resource<TcpSocket>,
        Resource<DynInputStream>,
        Resource<DynOutputStream>,
    )> {
        let socket = self.table.get_mut(&this)?;
        let client = socket.accept()?;
        let stream = match client.state() {
            TcpState::Connected(stream) => stream.clone(),
            state => {
                return Err(SocketError::trap(anyhow::anyhow!(
                    "accepted socket in unexpected state {state:?}"
                )));
            }
        };
        let client = self.table.push(client)?;
        let (input, output) = self.push_streams(&client, &stream)?;
        Ok((client, input, output))
    }

    fn local_address(&mut self, this: Resource<TcpSocket>) -> SocketResult<IpSocketAddress> {
        let socket = self.table.get(&this)?;
        Ok(socket.local_address()?.into())
    }

    fn remote_address(&mut self, this: Resource<TcpSocket>) -> SocketResult<IpSocketAddress> {
        let socket = self.table.get(&this)?;
        Ok(socket.remote_address()?.into())
    }

    fn is_listening(&mut self, this: Resource<TcpSocket>) -> anyhow::Result<bool> {
        let socket = self.table.get(&this)?;
        Ok(socket.is_listening())
    }

    fn address_family(&mut self, this: Resource<TcpSocket>) -> anyhow::Result<IpAddressFamily> {
        let socket = self.table.get(&this)?;
        Ok(socket.address_family())
    }

    fn set_listen_backlog_size(
        &mut self,
        this: Resource<TcpSocket>,
        value: u64,
    ) -> SocketResult<()> {
        let socket = self.table.get_mut(&this)?;
        socket.set_listen_backlog_size(value)?;
        Ok(())
    }

    fn keep_alive_enabled(&mut self, this: Resource<TcpSocket>) -> SocketResult<bool> {
        let socket = self.table.get(&this)?;
        Ok(socket.keep_alive_enabled()?)
    }

    fn set_keep_alive_enabled(
        &mut self,
        this: Resource<TcpSocket>,
        value: bool,
    ) -> SocketResult<()> {
        let socket = self.table.get(&this)?;
        socket.set_keep_alive_enabled(value)?;
        Ok(())
    }

    fn keep_alive_idle_time(&mut self, this: Resource<TcpSocket>) -> SocketResult<tcp::Duration> {
        let socket = self.table.get(&this)?;
        Ok(socket.keep_alive_idle_time()?)
    }

    fn set_keep_alive_idle_time(
        &mut self,
        this: Resource<TcpSocket>,
        value: tcp::Duration,
    ) -> SocketResult<()> {
        let socket = self.table.get(&this)?;
        socket.set_keep_alive_idle_time(value)?;
        Ok(())
    }

    fn keep_alive_interval(&mut self, this: Resource<TcpSocket>) -> SocketResult<tcp::Duration> {
        let socket = self.table.get(&this)?;
        Ok(socket.keep_alive_interval()?)
    }

    fn set_keep_alive_interval(
        &mut self,
        this: Resource<TcpSocket>,
        value: tcp::Duration,
    ) -> SocketResult<()> {
        let socket = self.table.get(&this)?;
        socket.set_keep_alive_interval(value)?;
        Ok(())
    }

    fn keep_alive_count(&mut self, this: Resource<TcpSocket>) -> SocketResult<u32> {
        let socket = self.table.get(&this)?;
        Ok(socket.keep_alive_count()?)
    }

    fn set_keep_alive_count(&mut self, this: Resource<TcpSocket>, value: u32) -> SocketResult<()> {
        let socket = self.table.get(&this)?;
        socket.set_keep_alive_count(value)?;
        Ok(())
    }

    fn hop_limit(&mut self, this: Resource<TcpSocket>) -> SocketResult<u8> {
        let socket = self.table.get(&this)?;
        Ok(socket.hop_limit()?)
    }

    fn set_hop_limit(&mut self, this: Resource<TcpSocket>, value: u8) -> SocketResult<()> {
        let socket = self.table.get(&this)?;
        socket.set_hop_limit(value)?;
        Ok(())
    }

    fn receive_buffer_size(&mut self, this: Resource<TcpSocket>) -> SocketResult<u64> {
        let socket = self.table.get(&this)?;
        Ok(socket.receive_buffer_size()?)
    }

    fn set_receive_buffer_size(
        &mut self,
        this: Resource<TcpSocket>,
        value: u64,
    ) -> SocketResult<()> {
        let socket = self.table.get(&this)?;
        socket.set_receive_buffer_size(value)?;
        Ok(())
    }

    fn send_buffer_size(&mut self, this: Resource<TcpSocket>) -> SocketResult<u64> {
        let socket = self.table.get(&this)?;
        Ok(socket.send_buffer_size()?)
    }

    fn set_send_buffer_size(&mut self, this: Resource<TcpSocket>, value: u64) -> SocketResult<()> {
        let socket = self.table.get(&this)?;
        socket.set_send_buffer_size(value)?;
        Ok(())
    }

    fn subscribe(&mut self, this: Resource<TcpSocket>) -> anyhow::Result<Resource<Pollable>> {
        preview_shim_io::subscribe(self.table, this)
    }

    fn shutdown(
        &mut self,
        this: Resource<TcpSocket>,
        shutdown_type: tcp::ShutdownType,
    ) -> SocketResult<()> {
        let socket = self.table.get(&this)?;
        let how = match shutdown_type {
            tcp::ShutdownType::Receive => Shutdown::Read,
            tcp::ShutdownType::Send => Shutdown::Write,
            tcp::ShutdownType::Both => Shutdown::Both,
        };
        socket.shutdown(how)?;
        Ok(())
    }

    fn drop(&mut self, this: Resource<TcpSocket>) -> anyhow::Result<()> {
        // Closing a socket is assumed not to block.
        let dropped = self.table.delete_if_present(this)?;
        if dropped.is_none() {
            tracing::debug!("tcp socket already dropped");
        }
        Ok(())
    }
}
