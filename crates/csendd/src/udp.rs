//! UDP discovery socket and the non-blocking datagram driver.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use anyhow::{Context, Result};
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};

use csend_core::wire::MAX_FRAME_SIZE;
use csend_services::{Datagram, DatagramTransport, TransportError};

/// Create a broadcast-capable UDP socket bound to `port` on all interfaces.
pub fn make_discovery_socket(port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_broadcast(true).context("SO_BROADCAST")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&bind_addr.into()).context("bind()")?;

    Ok(socket.into())
}

/// Find the address this host uses to reach the LAN.
///
/// Connecting a UDP socket sends nothing; it only makes the kernel pick a
/// route and a source address.
pub fn probe_local_address() -> Result<IpAddr> {
    let probe = UdpSocket::bind("0.0.0.0:0").context("bind probe socket")?;
    probe.connect("8.8.8.8:80").context("connect probe socket")?;
    Ok(probe.local_addr().context("probe local_addr")?.ip())
}

/// Datagram driver over a non-blocking std socket, for the tick loop.
pub struct UdpDriver {
    socket: UdpSocket,
    buf: Vec<u8>,
}

impl UdpDriver {
    pub fn bind(port: u16) -> Result<Self> {
        Ok(Self {
            socket: make_discovery_socket(port)?,
            buf: vec![0u8; MAX_FRAME_SIZE],
        })
    }
}

impl DatagramTransport for UdpDriver {
    fn send_datagram(&mut self, dest: SocketAddr, bytes: &[u8]) -> Result<(), TransportError> {
        self.socket.send_to(bytes, dest)?;
        Ok(())
    }

    fn receive_datagram(&mut self) -> Result<Option<Datagram>, TransportError> {
        match self.socket.recv_from(&mut self.buf) {
            Ok((len, from)) => Ok(Some(Datagram {
                bytes: Bytes::copy_from_slice(&self.buf[..len]),
                from,
            })),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
