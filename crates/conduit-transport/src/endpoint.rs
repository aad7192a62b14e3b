use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// Well-known port shared by all conduit participants unless overridden.
pub const DEFAULT_PORT: u16 = 13321;

/// Loopback endpoint on `port`.
pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
}

/// Loopback endpoint on [`DEFAULT_PORT`].
pub fn default_endpoint() -> SocketAddr {
    loopback(DEFAULT_PORT)
}
