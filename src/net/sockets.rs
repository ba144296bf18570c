use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, UdpSocket};
use tracing::debug;

/// Binds a UDP socket on all IPv4 interfaces. Address reuse is enabled so that several nodes on
///  the same host can listen to the well-known discovery port.
pub fn bind_udp(port: u16, broadcast: bool) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(broadcast)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).into())?;

    let socket = UdpSocket::from_std(socket.into())?;
    debug!("bound UDP socket {:?}", socket.local_addr());
    Ok(socket)
}

pub fn bind_tcp_listener(port: u16) -> anyhow::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).into())?;
    socket.listen(128)?;

    let listener = TcpListener::from_std(socket.into())?;
    debug!("listening for TCP connections on {:?}", listener.local_addr());
    Ok(listener)
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NetworkInterface {
    pub name: String,
    /// `None` while the interface has no usable address
    pub ip: Option<Ipv4Addr>,
    pub broadcast: Ipv4Addr,
}

/// Source of the local network interfaces that hello messages are broadcast on
pub trait InterfaceProvider: Send + Sync + 'static {
    fn interfaces(&self) -> Vec<NetworkInterface>;
}

#[derive(Debug, Clone)]
pub struct StaticInterfaces {
    interfaces: Vec<NetworkInterface>,
}

impl StaticInterfaces {
    pub fn new(interfaces: Vec<NetworkInterface>) -> StaticInterfaces {
        StaticInterfaces { interfaces }
    }

    /// a single pseudo interface broadcasting to 255.255.255.255
    pub fn limited_broadcast() -> StaticInterfaces {
        StaticInterfaces::new(vec![NetworkInterface {
            name: "any".to_string(),
            ip: Some(Ipv4Addr::UNSPECIFIED),
            broadcast: Ipv4Addr::BROADCAST,
        }])
    }

    /// 'broadcasts' to 127.0.0.1, for several nodes on a single host
    pub fn loopback() -> StaticInterfaces {
        StaticInterfaces::new(vec![NetworkInterface {
            name: "lo".to_string(),
            ip: Some(Ipv4Addr::LOCALHOST),
            broadcast: Ipv4Addr::LOCALHOST,
        }])
    }
}

impl InterfaceProvider for StaticInterfaces {
    fn interfaces(&self) -> Vec<NetworkInterface> {
        self.interfaces.clone()
    }
}
