//! TCP and UDP sockets.
//!
//! [`TcpSocket`] and [`UdpSocket`] are the host objects behind both the
//! Preview2 handle surface (see [`crate::bindings::wasi::sockets`]) and the
//! Preview3 object surface, where data flows through
//! [`preview_shim_io::p3::stream`] channels.

use core::future::Future;
use rustix::io::Errno;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::pin::Pin;
use std::sync::Arc;

mod host;
mod tcp;
mod udp;
pub(crate) mod util;

pub use tcp::{TcpSocket, TcpState};
pub use udp::UdpSocket;

/// Value taken from rust std library.
pub(crate) const DEFAULT_TCP_BACKLOG: u32 = 128;

/// Theoretical maximum byte size of a UDP datagram, the real limit is lower,
/// but we do not account for e.g. the transport layer here for simplicity.
/// In practice, datagrams are typically less than 1500 bytes.
pub(crate) const MAX_UDP_DATAGRAM_SIZE: usize = u16::MAX as usize;

/// Network policy shared by every socket created from one context.
///
/// Sockets keep a clone of this so that policy checks made while an
/// operation is in flight don't need access to the embedder's state.
#[derive(Clone, Default)]
pub struct WasiSocketsCtx {
    pub(crate) socket_addr_check: SocketAddrCheck,
    pub(crate) allowed_network_uses: AllowedNetworkUses,
}

impl WasiSocketsCtx {
    pub(crate) fn check_allowed_tcp(&self) -> Result<(), ErrorCode> {
        if !self.allowed_network_uses.tcp {
            tracing::debug!("TCP is not allowed");
            return Err(ErrorCode::AccessDenied);
        }
        Ok(())
    }

    pub(crate) fn check_allowed_udp(&self) -> Result<(), ErrorCode> {
        if !self.allowed_network_uses.udp {
            tracing::debug!("UDP is not allowed");
            return Err(ErrorCode::AccessDenied);
        }
        Ok(())
    }

    pub(crate) async fn check(&self, addr: SocketAddr, reason: SocketAddrUse) -> Result<(), ErrorCode> {
        if (self.socket_addr_check.0)(addr, reason).await {
            Ok(())
        } else {
            tracing::debug!(%addr, ?reason, "socket address was not permitted");
            Err(ErrorCode::AccessDenied)
        }
    }
}

/// The `wasi:sockets/network.network` resource: a capability carrying the
/// policy its sockets are checked against.
pub struct Network {
    pub(crate) sockets: WasiSocketsCtx,
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct AllowedNetworkUses {
    pub(crate) udp: bool,
    pub(crate) tcp: bool,
}

impl Default for AllowedNetworkUses {
    fn default() -> Self {
        Self {
            udp: true,
            tcp: true,
        }
    }
}

/// A check that will be called for each socket address that is used of
/// whether the address is permitted.
#[derive(Clone)]
pub(crate) struct SocketAddrCheck(
    Arc<
        dyn Fn(SocketAddr, SocketAddrUse) -> Pin<Box<dyn Future<Output = bool> + Send + Sync>>
            + Send
            + Sync,
    >,
);

impl SocketAddrCheck {
    pub(crate) fn new(
        f: impl Fn(SocketAddr, SocketAddrUse) -> Pin<Box<dyn Future<Output = bool> + Send + Sync>>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self(Arc::new(f))
    }
}

impl Default for SocketAddrCheck {
    fn default() -> Self {
        Self(Arc::new(|_, _| Box::pin(async { false })))
    }
}

/// The reason what a socket address is being used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketAddrUse {
    /// Binding TCP socket
    TcpBind,
    /// Connecting TCP socket
    TcpConnect,
    /// Binding UDP socket
    UdpBind,
    /// Connecting UDP socket
    UdpConnect,
    /// Sending datagram on non-connected UDP socket
    UdpOutgoingDatagram,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IpAddressFamily {
    Ipv4,
    Ipv6,
}

/// The `wasi:sockets/network.ip-socket-address` variant.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IpSocketAddress {
    Ipv4 {
        port: u16,
        address: (u8, u8, u8, u8),
    },
    Ipv6 {
        port: u16,
        flow_info: u32,
        address: (u16, u16, u16, u16, u16, u16, u16, u16),
        scope_id: u32,
    },
}

impl IpSocketAddress {
    pub fn family(&self) -> IpAddressFamily {
        match self {
            IpSocketAddress::Ipv4 { .. } => IpAddressFamily::Ipv4,
            IpSocketAddress::Ipv6 { .. } => IpAddressFamily::Ipv6,
        }
    }
}

impl From<SocketAddr> for IpSocketAddress {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => {
                let [a, b, c, d] = v4.ip().octets();
                IpSocketAddress::Ipv4 {
                    port: v4.port(),
                    address: (a, b, c, d),
                }
            }
            SocketAddr::V6(v6) => {
                let [a, b, c, d, e, f, g, h] = v6.ip().segments();
                IpSocketAddress::Ipv6 {
                    port: v6.port(),
                    flow_info: v6.flowinfo(),
                    address: (a, b, c, d, e, f, g, h),
                    scope_id: v6.scope_id(),
                }
            }
        }
    }
}

impl From<IpSocketAddress> for SocketAddr {
    fn from(addr: IpSocketAddress) -> Self {
        match addr {
            IpSocketAddress::Ipv4 {
                port,
                address: (a, b, c, d),
            } => SocketAddrV4::new(Ipv4Addr::new(a, b, c, d), port).into(),
            IpSocketAddress::Ipv6 {
                port,
                flow_info,
                address: (a, b, c, d, e, f, g, h),
                scope_id,
            } => SocketAddrV6::new(
                Ipv6Addr::new(a, b, c, d, e, f, g, h),
                port,
                flow_info,
                scope_id,
            )
            .into(),
        }
    }
}

/// The `wasi:sockets/network.error-code` enum.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ErrorCode {
    #[error("unknown error")]
    Unknown,
    #[error("access denied")]
    AccessDenied,
    #[error("not supported")]
    NotSupported,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("out of memory")]
    OutOfMemory,
    #[error("timeout")]
    Timeout,
    #[error("concurrency conflict")]
    ConcurrencyConflict,
    #[error("not in progress")]
    NotInProgress,
    #[error("would block")]
    WouldBlock,
    #[error("invalid state")]
    InvalidState,
    #[error("new socket limit")]
    NewSocketLimit,
    #[error("address not bindable")]
    AddressNotBindable,
    #[error("address in use")]
    AddressInUse,
    #[error("remote unreachable")]
    RemoteUnreachable,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection reset")]
    ConnectionReset,
    #[error("connection aborted")]
    ConnectionAborted,
    #[error("datagram too large")]
    DatagramTooLarge,
    #[error("name unresolvable")]
    NameUnresolvable,
    #[error("temporary resolver failure")]
    TemporaryResolverFailure,
    #[error("permanent resolver failure")]
    PermanentResolverFailure,
}

impl ErrorCode {
    /// The kebab-case case name of this code as guests see it.
    pub fn tag(&self) -> &'static str {
        match self {
            ErrorCode::Unknown => "unknown",
            ErrorCode::AccessDenied => "access-denied",
            ErrorCode::NotSupported => "not-supported",
            ErrorCode::InvalidArgument => "invalid-argument",
            ErrorCode::OutOfMemory => "out-of-memory",
            ErrorCode::Timeout => "timeout",
            ErrorCode::ConcurrencyConflict => "concurrency-conflict",
            ErrorCode::NotInProgress => "not-in-progress",
            ErrorCode::WouldBlock => "would-block",
            ErrorCode::InvalidState => "invalid-state",
            ErrorCode::NewSocketLimit => "new-socket-limit",
            ErrorCode::AddressNotBindable => "address-not-bindable",
            ErrorCode::AddressInUse => "address-in-use",
            ErrorCode::RemoteUnreachable => "remote-unreachable",
            ErrorCode::ConnectionRefused => "connection-refused",
            ErrorCode::ConnectionReset => "connection-reset",
            ErrorCode::ConnectionAborted => "connection-aborted",
            ErrorCode::DatagramTooLarge => "datagram-too-large",
            ErrorCode::NameUnresolvable => "name-unresolvable",
            ErrorCode::TemporaryResolverFailure => "temporary-resolver-failure",
            ErrorCode::PermanentResolverFailure => "permanent-resolver-failure",
        }
    }
}

impl From<std::io::Error> for ErrorCode {
    fn from(value: std::io::Error) -> Self {
        (&value).into()
    }
}

impl From<&std::io::Error> for ErrorCode {
    fn from(value: &std::io::Error) -> Self {
        // Attempt the more detailed native error code first:
        if let Some(errno) = Errno::from_io_error(value) {
            return errno.into();
        }

        match value.kind() {
            std::io::ErrorKind::AddrInUse => ErrorCode::AddressInUse,
            std::io::ErrorKind::AddrNotAvailable => ErrorCode::AddressNotBindable,
            std::io::ErrorKind::ConnectionAborted => ErrorCode::ConnectionAborted,
            std::io::ErrorKind::ConnectionRefused => ErrorCode::ConnectionRefused,
            std::io::ErrorKind::ConnectionReset => ErrorCode::ConnectionReset,
            std::io::ErrorKind::Interrupted => ErrorCode::WouldBlock,
            std::io::ErrorKind::InvalidInput => ErrorCode::InvalidArgument,
            std::io::ErrorKind::NotConnected => ErrorCode::InvalidState,
            std::io::ErrorKind::OutOfMemory => ErrorCode::OutOfMemory,
            std::io::ErrorKind::PermissionDenied => ErrorCode::AccessDenied,
            std::io::ErrorKind::TimedOut => ErrorCode::Timeout,
            std::io::ErrorKind::Unsupported => ErrorCode::NotSupported,
            std::io::ErrorKind::WouldBlock => ErrorCode::WouldBlock,

            _ => {
                tracing::debug!("unknown I/O error: {value}");
                ErrorCode::Unknown
            }
        }
    }
}

impl From<Errno> for ErrorCode {
    fn from(value: Errno) -> Self {
        (&value).into()
    }
}

impl From<&Errno> for ErrorCode {
    fn from(value: &Errno) -> Self {
        match *value {
            Errno::WOULDBLOCK => ErrorCode::WouldBlock,
            #[allow(unreachable_patterns, reason = "EWOULDBLOCK and EAGAIN can have the same value")]
            Errno::AGAIN => ErrorCode::WouldBlock,
            Errno::INTR => ErrorCode::WouldBlock,
            Errno::PERM => ErrorCode::AccessDenied,
            Errno::ACCESS => ErrorCode::AccessDenied,
            Errno::ADDRINUSE => ErrorCode::AddressInUse,
            Errno::ADDRNOTAVAIL => ErrorCode::AddressNotBindable,
            Errno::ALREADY => ErrorCode::ConcurrencyConflict,
            Errno::TIMEDOUT => ErrorCode::Timeout,
            Errno::CONNREFUSED => ErrorCode::ConnectionRefused,
            Errno::CONNRESET => ErrorCode::ConnectionReset,
            Errno::CONNABORTED => ErrorCode::ConnectionAborted,
            Errno::INVAL => ErrorCode::InvalidArgument,
            Errno::HOSTUNREACH => ErrorCode::RemoteUnreachable,
            Errno::HOSTDOWN => ErrorCode::RemoteUnreachable,
            Errno::NETDOWN => ErrorCode::RemoteUnreachable,
            Errno::NETUNREACH => ErrorCode::RemoteUnreachable,
            #[cfg(target_os = "linux")]
            Errno::NONET => ErrorCode::RemoteUnreachable,
            Errno::ISCONN => ErrorCode::InvalidState,
            Errno::NOTCONN => ErrorCode::InvalidState,
            Errno::DESTADDRREQ => ErrorCode::InvalidState,
            Errno::MSGSIZE => ErrorCode::DatagramTooLarge,
            Errno::NFILE => ErrorCode::NewSocketLimit,
            Errno::MFILE => ErrorCode::NewSocketLimit,
            Errno::NOMEM => ErrorCode::OutOfMemory,
            Errno::NOBUFS => ErrorCode::OutOfMemory,
            Errno::OPNOTSUPP => ErrorCode::NotSupported,
            Errno::NOPROTOOPT => ErrorCode::NotSupported,
            Errno::PFNOSUPPORT => ErrorCode::NotSupported,
            Errno::PROTONOSUPPORT => ErrorCode::NotSupported,
            Errno::PROTOTYPE => ErrorCode::NotSupported,
            Errno::SOCKTNOSUPPORT => ErrorCode::NotSupported,
            Errno::AFNOSUPPORT => ErrorCode::NotSupported,

            _ => {
                tracing::debug!("unknown I/O error: {value}");
                ErrorCode::Unknown
            }
        }
    }
}

/// Error type of the Preview2 socket host calls: either a guest-visible
/// [`ErrorCode`] or a trap.
#[derive(Debug)]
pub enum SocketError {
    Code(ErrorCode),
    Trap(anyhow::Error),
}

pub type SocketResult<T> = Result<T, SocketError>;

impl SocketError {
    pub fn trap(err: impl Into<anyhow::Error>) -> SocketError {
        SocketError::Trap(err.into())
    }

    /// Returns the guest-visible code, or `None` for a trap.
    pub fn downcast(&self) -> Option<ErrorCode> {
        match self {
            SocketError::Code(code) => Some(*code),
            SocketError::Trap(_) => None,
        }
    }
}

impl std::fmt::Display for SocketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocketError::Code(code) => write!(f, "{code}"),
            SocketError::Trap(e) => write!(f, "trap: {e:#}"),
        }
    }
}

impl std::error::Error for SocketError {}

impl From<ErrorCode> for SocketError {
    fn from(code: ErrorCode) -> Self {
        SocketError::Code(code)
    }
}

impl From<preview_shim_io::TableError> for SocketError {
    fn from(error: preview_shim_io::TableError) -> Self {
        SocketError::Trap(error.into())
    }
}

impl From<anyhow::Error> for SocketError {
    fn from(error: anyhow::Error) -> Self {
        SocketError::Trap(error)
    }
}

impl From<std::io::Error> for SocketError {
    fn from(error: std::io::Error) -> Self {
        ErrorCode::from(error).into()
    }
}

impl From<Errno> for SocketError {
    fn from(error: Errno) -> Self {
        ErrorCode::from(error).into()
    }
}
