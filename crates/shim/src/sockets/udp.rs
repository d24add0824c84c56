use crate::sockets::util::{
    get_unicast_hop_limit, is_valid_address_family, is_valid_remote_address,
    is_valid_unicast_address, receive_buffer_size, send_buffer_size, set_receive_buffer_size,
    set_send_buffer_size, set_unicast_hop_limit, udp_bind, udp_disconnect, udp_socket,
};
use crate::sockets::{
    ErrorCode, IpAddressFamily, MAX_UDP_DATAGRAM_SIZE, SocketAddrUse, WasiSocketsCtx,
};
use core::future::Future;
use preview_shim_io::runtime::with_ambient_tokio_runtime;
use rustix::io::Errno;
use rustix::net::connect;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

/// The state of a UDP socket.
///
/// This represents the various states a socket can be in during the
/// activities of binding and connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UdpState {
    /// The initial state for a newly-created socket.
    Default,

    /// The socket has an address but no default peer.
    Bound,

    /// The socket is "connected" to a peer address: datagrams without an
    /// explicit destination go there, and only its datagrams are received.
    Connected(SocketAddr),
}

/// A host UDP socket, plus associated bookkeeping.
pub struct UdpSocket {
    socket: Arc<tokio::net::UdpSocket>,
    udp_state: UdpState,
    family: IpAddressFamily,
    sockets: WasiSocketsCtx,
}

impl UdpSocket {
    /// Create a new socket in the given family.
    pub(crate) fn new(sockets: &WasiSocketsCtx, family: IpAddressFamily) -> Result<Self, ErrorCode> {
        sockets.check_allowed_udp()?;

        let fd = udp_socket(family)?;
        let socket = with_ambient_tokio_runtime(|| {
            tokio::net::UdpSocket::from_std(std::net::UdpSocket::from(fd))
        })?;

        Ok(Self {
            socket: Arc::new(socket),
            udp_state: UdpState::Default,
            family,
            sockets: sockets.clone(),
        })
    }

    pub async fn bind(&mut self, addr: SocketAddr) -> Result<(), ErrorCode> {
        if self.udp_state != UdpState::Default {
            return Err(ErrorCode::InvalidState);
        }
        if !is_valid_unicast_address(addr.ip()) || !is_valid_address_family(addr.ip(), self.family)
        {
            return Err(ErrorCode::InvalidArgument);
        }
        self.sockets.check(addr, SocketAddrUse::UdpBind).await?;
        udp_bind(&*self.socket, addr)?;
        tracing::debug!(%addr, "udp socket bound");
        self.udp_state = UdpState::Bound;
        Ok(())
    }

    fn implicit_bind(&mut self) -> Result<(), ErrorCode> {
        let ip = match self.family {
            IpAddressFamily::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddressFamily::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        udp_bind(&*self.socket, SocketAddr::new(ip, 0))?;
        tracing::debug!("udp socket implicitly bound");
        self.udp_state = UdpState::Bound;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.udp_state, UdpState::Connected(..))
    }

    pub fn is_bound(&self) -> bool {
        self.udp_state != UdpState::Default
    }

    /// Fixes the default peer, replacing any previous one.
    ///
    /// An unbound socket is implicitly bound by the OS.
    pub async fn connect(&mut self, addr: SocketAddr) -> Result<(), ErrorCode> {
        if !is_valid_address_family(addr.ip(), self.family) || !is_valid_remote_address(addr) {
            return Err(ErrorCode::InvalidArgument);
        }
        self.sockets.check(addr, SocketAddrUse::UdpConnect).await?;

        // Disconnect and reconnect in two distinct steps, so a failed connect
        // leaves the socket bound rather than half-connected. Linux also
        // sometimes fails to move to a new peer without the disconnect.
        if self.is_connected() {
            udp_disconnect(&*self.socket)?;
            self.udp_state = UdpState::Bound;
        }
        connect(&*self.socket, &addr).map_err(|error| match error {
            // See `udp_bind`.
            Errno::AFNOSUPPORT => ErrorCode::InvalidArgument,
            Errno::INPROGRESS => {
                tracing::debug!("UDP connect returned EINPROGRESS, which should never happen");
                ErrorCode::Unknown
            }
            err => err.into(),
        })?;
        tracing::debug!(%addr, "udp socket connected");
        self.udp_state = UdpState::Connected(addr);
        Ok(())
    }

    /// Clears the default peer. Only legal while connected.
    pub fn disconnect(&mut self) -> Result<(), ErrorCode> {
        if !self.is_connected() {
            return Err(ErrorCode::InvalidState);
        }
        udp_disconnect(&*self.socket)?;
        self.udp_state = UdpState::Bound;
        Ok(())
    }

    /// Sends one datagram.
    ///
    /// Without `addr` the socket must be connected. With `addr` on a
    /// connected socket, `addr` must be the connected peer. The state is
    /// checked before the returned future is first polled.
    ///
    /// Sending from an unbound socket binds it to an ephemeral port on the
    /// unspecified address first.
    pub fn send(
        &mut self,
        data: Vec<u8>,
        addr: Option<SocketAddr>,
    ) -> impl Future<Output = Result<(), ErrorCode>> + Send + use<> {
        enum Mode {
            Send,
            SendTo(SocketAddr),
        }
        let mode = match (self.udp_state, addr) {
            _ if data.len() > MAX_UDP_DATAGRAM_SIZE => Err(ErrorCode::DatagramTooLarge),
            (UdpState::Connected(peer), Some(addr)) if addr != peer => {
                Err(ErrorCode::InvalidArgument)
            }
            (UdpState::Connected(_), _) => Ok(Mode::Send),
            (_, None) => Err(ErrorCode::InvalidArgument),
            (_, Some(addr)) => {
                if !is_valid_address_family(addr.ip(), self.family)
                    || !is_valid_remote_address(addr)
                {
                    Err(ErrorCode::InvalidArgument)
                } else {
                    Ok(Mode::SendTo(addr))
                }
            }
        };
        let mode = mode.and_then(|mode| {
            if self.udp_state == UdpState::Default {
                self.implicit_bind()?;
            }
            Ok(mode)
        });
        let socket = Arc::clone(&self.socket);
        let sockets = self.sockets.clone();
        async move {
            let n = match mode? {
                Mode::Send => socket.send(&data).await?,
                Mode::SendTo(addr) => {
                    sockets
                        .check(addr, SocketAddrUse::UdpOutgoingDatagram)
                        .await?;
                    socket.send_to(&data, addr).await?
                }
            };
            // The OS may refuse large buffers, but it never writes part of a
            // datagram below `i32::MAX` bytes.
            if n != data.len() {
                return Err(ErrorCode::Unknown);
            }
            Ok(())
        }
    }

    /// Receives one datagram along with the address it came from.
    pub fn receive(
        &self,
    ) -> impl Future<Output = Result<(Vec<u8>, SocketAddr), ErrorCode>> + Send + use<> {
        let state = self.udp_state;
        let socket = Arc::clone(&self.socket);
        async move {
            let mut buf = vec![0; MAX_UDP_DATAGRAM_SIZE];
            let (n, addr) = match state {
                UdpState::Default => return Err(ErrorCode::InvalidState),
                UdpState::Bound => socket.recv_from(&mut buf).await?,
                UdpState::Connected(addr) => (socket.recv(&mut buf).await?, addr),
            };
            buf.truncate(n);
            Ok((buf, addr))
        }
    }

    pub fn local_address(&self) -> Result<SocketAddr, ErrorCode> {
        if self.udp_state == UdpState::Default {
            return Err(ErrorCode::InvalidState);
        }
        Ok(self.socket.local_addr()?)
    }

    pub fn remote_address(&self) -> Result<SocketAddr, ErrorCode> {
        match self.udp_state {
            UdpState::Connected(addr) => Ok(addr),
            _ => Err(ErrorCode::InvalidState),
        }
    }

    pub fn address_family(&self) -> IpAddressFamily {
        self.family
    }

    pub fn unicast_hop_limit(&self) -> Result<u8, ErrorCode> {
        get_unicast_hop_limit(&*self.socket, self.family)
    }

    pub fn set_unicast_hop_limit(&self, value: u8) -> Result<(), ErrorCode> {
        set_unicast_hop_limit(&*self.socket, self.family, value)
    }

    pub fn receive_buffer_size(&self) -> Result<u64, ErrorCode> {
        receive_buffer_size(&*self.socket)
    }

    pub fn set_receive_buffer_size(&self, value: u64) -> Result<(), ErrorCode> {
        set_receive_buffer_size(&*self.socket, value)?;
        Ok(())
    }

    pub fn send_buffer_size(&self) -> Result<u64, ErrorCode> {
        send_buffer_size(&*self.socket)
    }

    pub fn set_send_buffer_size(&self, value: u64) -> Result<(), ErrorCode> {
        set_send_buffer_size(&*self.socket, value)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn permissive() -> WasiSocketsCtx {
        let mut sockets = WasiSocketsCtx::default();
        sockets.socket_addr_check =
            crate::sockets::SocketAddrCheck::new(|_, _| Box::pin(async { true }));
        sockets
    }

    #[test_log::test(tokio::test)]
    async fn state_rules() {
        let mut s = UdpSocket::new(&permissive(), IpAddressFamily::Ipv4).unwrap();
        assert!(!s.is_bound());
        assert_eq!(s.disconnect(), Err(ErrorCode::InvalidState));
        assert_eq!(s.receive().await, Err(ErrorCode::InvalidState));
        assert_eq!(
            s.bind("[::1]:0".parse().unwrap()).await,
            Err(ErrorCode::InvalidArgument)
        );

        s.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert_eq!(
            s.bind("127.0.0.1:0".parse().unwrap()).await,
            Err(ErrorCode::InvalidState)
        );
        assert_eq!(
            s.send(b"x".to_vec(), None).await,
            Err(ErrorCode::InvalidArgument)
        );
        assert_eq!(
            s.send(vec![0; MAX_UDP_DATAGRAM_SIZE + 1], None).await,
            Err(ErrorCode::DatagramTooLarge)
        );
    }

    #[test_log::test(tokio::test)]
    async fn send_binds_an_unbound_socket() {
        let sockets = permissive();
        let mut receiver = UdpSocket::new(&sockets, IpAddressFamily::Ipv4).unwrap();
        receiver.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let to = receiver.local_address().unwrap();

        let mut s = UdpSocket::new(&sockets, IpAddressFamily::Ipv4).unwrap();
        s.send(b"hi".to_vec(), Some(to)).await.unwrap();
        assert!(s.is_bound());
        assert_ne!(s.local_address().unwrap().port(), 0);
        assert_eq!(
            s.bind("127.0.0.1:0".parse().unwrap()).await,
            Err(ErrorCode::InvalidState)
        );

        let (data, from) = receiver.receive().await.unwrap();
        assert_eq!(data, b"hi");
        assert_eq!(from.port(), s.local_address().unwrap().port());
    }

    #[test_log::test(tokio::test)]
    async fn denied_by_address_check() {
        let mut s = UdpSocket::new(&WasiSocketsCtx::default(), IpAddressFamily::Ipv4).unwrap();
        assert_eq!(
            s.bind("127.0.0.1:0".parse().unwrap()).await,
            Err(ErrorCode::AccessDenied)
        );
    }

    #[test_log::test(tokio::test)]
    async fn connected_peer_round_trip() {
        let sockets = permissive();
        let mut a = UdpSocket::new(&sockets, IpAddressFamily::Ipv4).unwrap();
        let mut b = UdpSocket::new(&sockets, IpAddressFamily::Ipv4).unwrap();
        a.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        b.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let a_addr = a.local_address().unwrap();
        let b_addr = b.local_address().unwrap();

        a.connect(b_addr).await.unwrap();
        assert_eq!(a.remote_address().unwrap(), b_addr);
        let elsewhere = "127.0.0.1:9".parse().unwrap();
        assert_eq!(
            a.send(b"x".to_vec(), Some(elsewhere)).await,
            Err(ErrorCode::InvalidArgument)
        );
        a.send(b"ping".to_vec(), Some(b_addr)).await.unwrap();
        a.send(b"pong".to_vec(), None).await.unwrap();

        assert_eq!(b.receive().await.unwrap(), (b"ping".to_vec(), a_addr));
        assert_eq!(b.receive().await.unwrap(), (b"pong".to_vec(), a_addr));

        a.disconnect().unwrap();
        assert!(!a.is_connected());
        assert_eq!(a.remote_address(), Err(ErrorCode::InvalidState));
    }
}
