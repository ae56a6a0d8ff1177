//! A bindable/connectable IPv4 or IPv6 address, the Rust analogue of
//! `InetAddress`. Builds on `std::net::SocketAddr` rather than reinventing
//! `sockaddr_in` handling -- the conversions to/from the raw C structures
//! already live in `sys::socket`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// A listening address: either every interface or loopback-only, mirroring
/// the two-argument `InetAddress(port, loopbackOnly)` constructor used for
/// `Acceptor`'s bind address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InetAddr(SocketAddr);

impl InetAddr {
    /// Binds every interface on `port` (IPv4 `0.0.0.0`).
    pub fn any(port: u16) -> InetAddr {
        InetAddr(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
    }

    /// Binds only the loopback interface on `port`.
    pub fn loopback(port: u16) -> InetAddr {
        InetAddr(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
    }

    pub fn new(ip: IpAddr, port: u16) -> InetAddr {
        InetAddr(SocketAddr::new(ip, port))
    }

    pub fn socket_addr(self) -> SocketAddr {
        self.0
    }

    pub fn ip(self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(self) -> u16 {
        self.0.port()
    }

    pub fn to_ip_port(self) -> String {
        self.0.to_string()
    }
}

impl From<SocketAddr> for InetAddr {
    fn from(addr: SocketAddr) -> InetAddr {
        InetAddr(addr)
    }
}

impl std::fmt::Display for InetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_binds_unspecified_v4() {
        let a = InetAddr::any(8080);
        assert_eq!(a.ip(), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(a.port(), 8080);
    }

    #[test]
    fn loopback_binds_localhost() {
        let a = InetAddr::loopback(0);
        assert_eq!(a.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
}
