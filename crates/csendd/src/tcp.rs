//! TCP drivers for the tick loop: a single-slot [`StreamTransport`] and a
//! pooled [`EndpointDriver`], both over non-blocking std sockets.

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::time::Duration;

use bytes::Bytes;
use socket2::{Domain, Protocol, SockRef, Socket, Type};

use csend_core::wire::MAX_FRAME_SIZE;
use csend_services::{
    Accept, EndpointDriver, EndpointStatus, Receive, StreamTransport, TransportError,
};

// ── Shared socket helpers ─────────────────────────────────────────────────────

/// Map an io error onto the driver error vocabulary.
fn map_io(e: io::Error) -> TransportError {
    match e.kind() {
        io::ErrorKind::TimedOut => TransportError::TimedOut,
        io::ErrorKind::ConnectionRefused => TransportError::Refused,
        io::ErrorKind::NotConnected => TransportError::NotConnected,
        io::ErrorKind::ConnectionAborted => TransportError::Aborted,
        io::ErrorKind::AddrInUse => TransportError::Busy,
        _ => TransportError::Io(e),
    }
}

/// Non-blocking, address-reusing listener on `port`.
pub fn listen_socket(port: u16) -> Result<TcpListener, TransportError> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&bind_addr.into()).map_err(map_io)?;
    socket.listen(8)?;
    Ok(socket.into())
}

fn connect_stream(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, TransportError> {
    let stream = TcpStream::connect_timeout(&addr, timeout).map_err(map_io)?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

fn write_frame(
    stream: &mut TcpStream,
    bytes: &[u8],
    timeout: Duration,
) -> Result<(), TransportError> {
    stream.set_write_timeout(Some(timeout))?;
    stream.write_all(bytes).map_err(|e| match e.kind() {
        io::ErrorKind::WouldBlock => TransportError::TimedOut,
        _ => map_io(e),
    })?;
    stream.flush()?;
    Ok(())
}

fn read_frame(stream: &mut TcpStream, buf: &mut [u8]) -> Result<Receive, TransportError> {
    match stream.read(buf) {
        Ok(0) => Ok(Receive::Closed),
        Ok(n) => Ok(Receive::Data(Bytes::copy_from_slice(&buf[..n]))),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Receive::Pending),
        Err(e) => Err(map_io(e)),
    }
}

/// Graceful close sends FIN; abortive close sends RST via `SO_LINGER 0`.
fn close_stream(stream: TcpStream, graceful: bool) -> Result<(), TransportError> {
    if graceful {
        stream.shutdown(Shutdown::Write).map_err(map_io)
    } else {
        SockRef::from(&stream).set_linger(Some(Duration::ZERO))?;
        drop(stream);
        Ok(())
    }
}

fn inbound(stream: TcpStream) -> Result<TcpConnection, TransportError> {
    stream.set_nonblocking(true)?;
    Ok(TcpConnection::new(stream))
}

/// One TCP connection plus its read buffer.
pub struct TcpConnection {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl TcpConnection {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buf: vec![0u8; MAX_FRAME_SIZE],
        }
    }
}

// ── Single slot ───────────────────────────────────────────────────────────────

/// Stream driver for the single-slot machine. Holds no state of its own;
/// everything lives in the listener or connection handed to the machine.
#[derive(Debug, Default)]
pub struct TcpDriver;

impl StreamTransport for TcpDriver {
    type Listener = TcpListener;
    type Connection = TcpConnection;

    fn begin_listen(&mut self, port: u16) -> Result<TcpListener, TransportError> {
        listen_socket(port)
    }

    fn poll_accept(
        &mut self,
        listener: TcpListener,
    ) -> Result<Accept<TcpListener, TcpConnection>, TransportError> {
        match listener.accept() {
            // The listener is dropped here: one passive open, one connection.
            Ok((stream, from)) => Ok(Accept::Connected {
                conn: inbound(stream)?,
                from,
            }),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Accept::Pending(listener)),
            Err(e) => Err(map_io(e)),
        }
    }

    fn abort_listen(&mut self, listener: TcpListener) -> Result<(), TransportError> {
        drop(listener);
        Ok(())
    }

    fn connect(
        &mut self,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<TcpConnection, TransportError> {
        connect_stream(addr, timeout).map(TcpConnection::new)
    }

    fn send(
        &mut self,
        conn: &mut TcpConnection,
        bytes: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError> {
        write_frame(&mut conn.stream, bytes, timeout)
    }

    fn receive(&mut self, conn: &mut TcpConnection) -> Result<Receive, TransportError> {
        read_frame(&mut conn.stream, &mut conn.buf)
    }

    fn close(&mut self, conn: TcpConnection, graceful: bool) -> Result<(), TransportError> {
        close_stream(conn.stream, graceful)
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

// ── Pooled ────────────────────────────────────────────────────────────────────

/// A pooled data endpoint. Empty until an indication is accepted onto it
/// or an outbound connect fills it.
pub struct TcpEndpoint {
    conn: Option<TcpConnection>,
}

impl TcpEndpoint {
    fn conn(&mut self) -> Result<&mut TcpConnection, TransportError> {
        self.conn.as_mut().ok_or(TransportError::NotConnected)
    }
}

/// Endpoint driver for the pooled variant. The kernel completes accepts
/// before we see them, so endpoint creation and accept are ready at once.
#[derive(Debug, Default)]
pub struct PooledTcpDriver;

impl EndpointDriver for PooledTcpDriver {
    type Listener = TcpListener;
    type Indication = TcpStream;
    type Endpoint = TcpEndpoint;

    fn open_listener(&mut self, port: u16) -> Result<TcpListener, TransportError> {
        listen_socket(port)
    }

    fn poll_indication(
        &mut self,
        listener: &mut TcpListener,
    ) -> Result<Option<(TcpStream, SocketAddr)>, TransportError> {
        match listener.accept() {
            Ok((stream, from)) => Ok(Some((stream, from))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(map_io(e)),
        }
    }

    fn reject_indication(&mut self, _listener: &mut TcpListener, indication: TcpStream) {
        if let Err(e) = close_stream(indication, false) {
            tracing::debug!(error = %e, "rejecting connection failed");
        }
    }

    fn create_endpoint(&mut self) -> Result<TcpEndpoint, TransportError> {
        Ok(TcpEndpoint { conn: None })
    }

    fn poll_endpoint(
        &mut self,
        _endpoint: &mut TcpEndpoint,
    ) -> Result<EndpointStatus, TransportError> {
        Ok(EndpointStatus::Ready)
    }

    fn begin_accept(
        &mut self,
        _listener: &mut TcpListener,
        indication: TcpStream,
        endpoint: &mut TcpEndpoint,
    ) -> Result<(), TransportError> {
        endpoint.conn = Some(inbound(indication)?);
        Ok(())
    }

    fn connect(
        &mut self,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<TcpEndpoint, TransportError> {
        let conn = connect_stream(addr, timeout).map(TcpConnection::new)?;
        Ok(TcpEndpoint { conn: Some(conn) })
    }

    fn send(
        &mut self,
        endpoint: &mut TcpEndpoint,
        bytes: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError> {
        write_frame(&mut endpoint.conn()?.stream, bytes, timeout)
    }

    fn receive(&mut self, endpoint: &mut TcpEndpoint) -> Result<Receive, TransportError> {
        let conn = endpoint.conn()?;
        read_frame(&mut conn.stream, &mut conn.buf)
    }

    fn close(&mut self, endpoint: TcpEndpoint, graceful: bool) -> Result<(), TransportError> {
        match endpoint.conn {
            Some(conn) => close_stream(conn.stream, graceful),
            None => Ok(()),
        }
    }

    fn close_listener(&mut self, listener: TcpListener) -> Result<(), TransportError> {
        drop(listener);
        Ok(())
    }
}
