use crate::sockets::{ErrorCode, IpAddressFamily};
use core::time::Duration;
use rustix::fd::{AsFd, OwnedFd};
use rustix::io::Errno;
use rustix::net::{AddressFamily, SocketFlags, SocketType, sockopt};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

pub fn is_valid_unicast_address(addr: IpAddr) -> bool {
    match to_canonical(&addr) {
        IpAddr::V4(ipv4) => !ipv4.is_multicast() && !ipv4.is_broadcast(),
        IpAddr::V6(ipv6) => !ipv6.is_multicast(),
    }
}

pub fn is_valid_remote_address(addr: SocketAddr) -> bool {
    !to_canonical(&addr.ip()).is_unspecified() && addr.port() != 0
}

/// IPv6 sockets are always created dual-stack disabled, so IPv4-mapped
/// addresses are rejected along with the deprecated IPv4-compatible ones.
pub fn is_valid_address_family(addr: IpAddr, socket_family: IpAddressFamily) -> bool {
    match (socket_family, addr) {
        (IpAddressFamily::Ipv4, IpAddr::V4(_)) => true,
        (IpAddressFamily::Ipv6, IpAddr::V6(ipv6)) => {
            !is_deprecated_ipv4_compatible(&ipv6) && ipv6.to_ipv4_mapped().is_none()
        }
        _ => false,
    }
}

fn to_canonical(addr: &IpAddr) -> IpAddr {
    match addr {
        IpAddr::V4(ipv4) => IpAddr::V4(*ipv4),
        IpAddr::V6(ipv6) => match ipv6.to_ipv4_mapped() {
            Some(ipv4) => IpAddr::V4(ipv4),
            None => IpAddr::V6(*ipv6),
        },
    }
}

fn is_deprecated_ipv4_compatible(addr: &Ipv6Addr) -> bool {
    matches!(addr.segments(), [0, 0, 0, 0, 0, 0, _, _])
        && *addr != Ipv6Addr::UNSPECIFIED
        && *addr != Ipv6Addr::LOCALHOST
}

/// Creates a new non-blocking, close-on-exec datagram socket.
pub fn udp_socket(family: IpAddressFamily) -> std::io::Result<OwnedFd> {
    let af = match family {
        IpAddressFamily::Ipv4 => AddressFamily::INET,
        IpAddressFamily::Ipv6 => AddressFamily::INET6,
    };
    let fd = rustix::net::socket_with(
        af,
        SocketType::DGRAM,
        SocketFlags::NONBLOCK | SocketFlags::CLOEXEC,
        None,
    )?;
    if family == IpAddressFamily::Ipv6 {
        sockopt::set_ipv6_v6only(&fd, true)?;
    }
    Ok(fd)
}

pub fn udp_bind(sockfd: impl AsFd, addr: SocketAddr) -> Result<(), ErrorCode> {
    rustix::net::bind(sockfd, &addr).map_err(|error| match error {
        // See `tcp_bind`.
        Errno::AFNOSUPPORT => ErrorCode::InvalidArgument,
        error => error.into(),
    })
}

/// Dissolves the association with the connected peer.
pub fn udp_disconnect(sockfd: impl AsFd) -> Result<(), ErrorCode> {
    match rustix::net::connect_unspec(sockfd) {
        // BSD platforms return an error even if the disconnect succeeded.
        Ok(()) | Err(Errno::INVAL) | Err(Errno::AFNOSUPPORT) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub fn tcp_bind(socket: &tokio::net::TcpSocket, addr: SocketAddr) -> Result<(), ErrorCode> {
    // Allow rebinding to an address still in TIME_WAIT, the same way most
    // servers configure their listeners.
    socket.set_reuseaddr(true)?;
    socket.bind(addr).map_err(|error| {
        match Errno::from_io_error(&error) {
            // A wasi program attempting to bind an IPv6 address to an IPv4
            // socket is an argument error, not a missing feature.
            Some(Errno::AFNOSUPPORT) => ErrorCode::InvalidArgument,
            _ => ErrorCode::from(error),
        }
    })
}

pub fn normalize_setsockopt_buffer_size(value: u64) -> usize {
    value
        .clamp(1, i32::MAX as u64)
        .try_into()
        .unwrap_or(usize::MAX)
}

pub fn normalize_getsockopt_buffer_size(value: usize) -> u64 {
    let value = value as u64;
    if cfg!(target_os = "linux") {
        // Linux doubles the value passed to setsockopt to allow space for
        // bookkeeping overhead. getsockopt returns this internally doubled
        // value, so halve it to get back to what was requested.
        value / 2
    } else {
        value
    }
}

pub fn receive_buffer_size(sockfd: impl AsFd) -> Result<u64, ErrorCode> {
    let n = sockopt::socket_recv_buffer_size(sockfd)?;
    Ok(normalize_getsockopt_buffer_size(n))
}

pub fn set_receive_buffer_size(sockfd: impl AsFd, value: u64) -> Result<usize, ErrorCode> {
    if value == 0 {
        return Err(ErrorCode::InvalidArgument);
    }
    let value = normalize_setsockopt_buffer_size(value);
    sockopt::set_socket_recv_buffer_size(sockfd, value)?;
    Ok(value)
}

pub fn send_buffer_size(sockfd: impl AsFd) -> Result<u64, ErrorCode> {
    let n = sockopt::socket_send_buffer_size(sockfd)?;
    Ok(normalize_getsockopt_buffer_size(n))
}

pub fn set_send_buffer_size(sockfd: impl AsFd, value: u64) -> Result<usize, ErrorCode> {
    if value == 0 {
        return Err(ErrorCode::InvalidArgument);
    }
    let value = normalize_setsockopt_buffer_size(value);
    sockopt::set_socket_send_buffer_size(sockfd, value)?;
    Ok(value)
}

pub fn get_unicast_hop_limit(sockfd: impl AsFd, family: IpAddressFamily) -> Result<u8, ErrorCode> {
    match family {
        IpAddressFamily::Ipv4 => {
            let ttl = sockopt::ip_ttl(sockfd)?;
            ttl.try_into().map_err(|_| ErrorCode::Unknown)
        }
        IpAddressFamily::Ipv6 => Ok(sockopt::ipv6_unicast_hops(sockfd)?),
    }
}

pub fn set_unicast_hop_limit(
    sockfd: impl AsFd,
    family: IpAddressFamily,
    value: u8,
) -> Result<(), ErrorCode> {
    if value == 0 {
        // A hop limit of zero would make the socket useless. Some platforms
        // silently accept it, others reject it, so reject it everywhere.
        return Err(ErrorCode::InvalidArgument);
    }
    match family {
        IpAddressFamily::Ipv4 => sockopt::set_ip_ttl(sockfd, value.into())?,
        IpAddressFamily::Ipv6 => sockopt::set_ipv6_unicast_hops(sockfd, Some(value))?,
    }
    Ok(())
}

// Keep-alive timings are configured in whole seconds by every platform we
// support, and anything above `i16::MAX` seconds is rejected by some.
fn keep_alive_duration(nanos: u64) -> Result<Duration, ErrorCode> {
    const NANOS_PER_SEC: u64 = 1_000_000_000;
    if nanos == 0 {
        return Err(ErrorCode::InvalidArgument);
    }
    let secs = nanos.div_ceil(NANOS_PER_SEC).clamp(1, i16::MAX as u64);
    Ok(Duration::from_secs(secs))
}

/// Sets `TCP_KEEPIDLE`, returning the value actually applied in nanoseconds.
pub fn set_keep_alive_idle_time(sockfd: impl AsFd, nanos: u64) -> Result<u64, ErrorCode> {
    let duration = keep_alive_duration(nanos)?;
    sockopt::set_tcp_keepidle(sockfd, duration)?;
    Ok(duration.as_nanos().try_into().unwrap_or(u64::MAX))
}

pub fn set_keep_alive_interval(sockfd: impl AsFd, nanos: u64) -> Result<(), ErrorCode> {
    sockopt::set_tcp_keepintvl(sockfd, keep_alive_duration(nanos)?)?;
    Ok(())
}

pub fn set_keep_alive_count(sockfd: impl AsFd, value: u32) -> Result<(), ErrorCode> {
    const MAX_KEEPCNT: u32 = 127;
    if value == 0 {
        return Err(ErrorCode::InvalidArgument);
    }
    sockopt::set_tcp_keepcnt(sockfd, value.min(MAX_KEEPCNT))?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn address_validation() {
        assert!(is_valid_unicast_address("10.0.0.1".parse().unwrap()));
        assert!(!is_valid_unicast_address("224.0.0.1".parse().unwrap()));
        assert!(!is_valid_unicast_address("255.255.255.255".parse().unwrap()));
        assert!(!is_valid_unicast_address("ff02::1".parse().unwrap()));
        assert!(!is_valid_unicast_address("::ffff:224.0.0.1".parse().unwrap()));

        assert!(is_valid_remote_address("127.0.0.1:80".parse().unwrap()));
        assert!(!is_valid_remote_address("0.0.0.0:80".parse().unwrap()));
        assert!(!is_valid_remote_address("127.0.0.1:0".parse().unwrap()));
    }

    #[test]
    fn address_family_validation() {
        let v4 = "127.0.0.1".parse().unwrap();
        let v6 = "::1".parse().unwrap();
        let mapped = "::ffff:127.0.0.1".parse().unwrap();
        let compatible = "::7f00:1".parse().unwrap();

        assert!(is_valid_address_family(v4, IpAddressFamily::Ipv4));
        assert!(!is_valid_address_family(v6, IpAddressFamily::Ipv4));
        assert!(is_valid_address_family(v6, IpAddressFamily::Ipv6));
        assert!(!is_valid_address_family(v4, IpAddressFamily::Ipv6));
        assert!(!is_valid_address_family(mapped, IpAddressFamily::Ipv6));
        assert!(!is_valid_address_family(compatible, IpAddressFamily::Ipv6));
    }

    #[test]
    fn buffer_size_normalization() {
        assert_eq!(normalize_setsockopt_buffer_size(0), 1);
        assert_eq!(normalize_setsockopt_buffer_size(u64::MAX), i32::MAX as usize);
        assert_eq!(normalize_setsockopt_buffer_size(4096), 4096);
    }

    #[test]
    fn keep_alive_rounds_up_to_seconds() {
        assert_eq!(keep_alive_duration(1).unwrap(), Duration::from_secs(1));
        assert_eq!(
            keep_alive_duration(1_500_000_000).unwrap(),
            Duration::from_secs(2)
        );
        assert_eq!(
            keep_alive_duration(u64::MAX).unwrap(),
            Duration::from_secs(i16::MAX as u64)
        );
        assert_eq!(keep_alive_duration(0), Err(ErrorCode::InvalidArgument));
    }
}
