//! UDP socket construction helpers.

use std::io;
use std::net::SocketAddr;

use socket2::Protocol;

fn bind_udp_ops(addr: SocketAddr, only_v6: bool) -> io::Result<socket2::Socket> {
    let socket = if addr.is_ipv4() {
        socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(Protocol::UDP),
        )?
    } else {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV6,
            socket2::Type::DGRAM,
            Some(Protocol::UDP),
        )?;
        socket.set_only_v6(only_v6)?;
        socket
    };
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket)
}

/// Binds a nonblocking UDP socket suitable for [`Mux`](crate::mux::Mux),
/// STUN, or TURN use and registers it with the tokio reactor.
pub fn bind_udp(addr: SocketAddr) -> io::Result<tokio::net::UdpSocket> {
    let socket: std::net::UdpSocket = bind_udp_ops(addr, true)?.into();
    tokio::net::UdpSocket::from_std(socket)
}
