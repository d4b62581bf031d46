//! In-memory LAN for driving several nodes from one test thread.
//!
//! Every host shares one [`VirtualNet`]. Datagrams sent to the limited
//! broadcast address reach every socket bound to the destination port,
//! the sender's own included. Stream connections are pairs of byte-chunk
//! queues; each write arrives as exactly one chunk.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;

use csend_services::{
    Accept, Datagram, DatagramTransport, EndpointDriver, EndpointStatus, Receive, StreamTransport,
    TransportError,
};

// ── Shared network state ──────────────────────────────────────────────────────

#[derive(Default)]
struct Pipe {
    to_server: VecDeque<Bytes>,
    to_client: VecDeque<Bytes>,
    client_closed: bool,
    server_closed: bool,
}

#[derive(Default)]
struct NetState {
    inboxes: HashMap<SocketAddr, VecDeque<Datagram>>,
    listeners: HashMap<SocketAddr, VecDeque<(u64, SocketAddr)>>,
    pipes: HashMap<u64, Pipe>,
    next_conn: u64,
    next_port: u16,
}

impl NetState {
    /// The client went away before the connection was accepted.
    fn reset_backlog(&mut self, backlog: VecDeque<(u64, SocketAddr)>) {
        for (id, _) in backlog {
            if let Some(pipe) = self.pipes.get_mut(&id) {
                pipe.server_closed = true;
                pipe.to_server.clear();
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct VirtualNet {
    state: Rc<RefCell<NetState>>,
}

impl VirtualNet {
    pub fn new() -> Self {
        let net = Self::default();
        net.state.borrow_mut().next_port = 40000;
        net
    }

    pub fn host(&self, ip: &str) -> Host {
        Host {
            net: self.clone(),
            ip: ip.parse().expect("test address"),
        }
    }

    pub fn is_listening(&self, addr: SocketAddr) -> bool {
        self.state.borrow().listeners.contains_key(&addr)
    }
}

// ── Connections ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Server,
}

/// One end of a virtual stream connection.
#[derive(Debug)]
pub struct VConn {
    id: u64,
    side: Side,
}

#[derive(Debug)]
pub struct VListener {
    addr: SocketAddr,
}

/// A machine on the virtual LAN.
#[derive(Clone)]
pub struct Host {
    net: VirtualNet,
    ip: IpAddr,
}

impl Host {
    pub fn datagrams(&self, port: u16) -> VDatagrams {
        let local = SocketAddr::new(self.ip, port);
        self.net.state.borrow_mut().inboxes.entry(local).or_default();
        VDatagrams {
            net: self.net.clone(),
            local,
        }
    }

    pub fn streams(&self) -> VStreams {
        VStreams { host: self.clone() }
    }

    pub fn endpoints(&self) -> VEndpoints {
        VEndpoints { host: self.clone() }
    }

    fn listen(&self, port: u16) -> Result<VListener, TransportError> {
        let addr = SocketAddr::new(self.ip, port);
        let mut state = self.net.state.borrow_mut();
        if state.listeners.contains_key(&addr) {
            return Err(TransportError::Busy);
        }
        state.listeners.insert(addr, VecDeque::new());
        Ok(VListener { addr })
    }

    fn pop_backlog(
        &self,
        listener: &VListener,
    ) -> Result<Option<(u64, SocketAddr)>, TransportError> {
        let mut state = self.net.state.borrow_mut();
        let backlog = state
            .listeners
            .get_mut(&listener.addr)
            .ok_or(TransportError::NotConnected)?;
        Ok(backlog.pop_front())
    }

    fn unlisten(&self, listener: VListener) {
        let mut state = self.net.state.borrow_mut();
        if let Some(backlog) = state.listeners.remove(&listener.addr) {
            state.reset_backlog(backlog);
        }
    }

    /// Open a connection to `to`. Refused unless something listens there.
    pub fn connect(&self, to: SocketAddr) -> Result<VConn, TransportError> {
        let mut state = self.net.state.borrow_mut();
        if !state.listeners.contains_key(&to) {
            return Err(TransportError::Refused);
        }
        let id = state.next_conn;
        state.next_conn += 1;
        let port = state.next_port;
        state.next_port = state.next_port.wrapping_add(1).max(40000);
        state.pipes.insert(id, Pipe::default());
        if let Some(backlog) = state.listeners.get_mut(&to) {
            backlog.push_back((id, SocketAddr::new(self.ip, port)));
        }
        Ok(VConn {
            id,
            side: Side::Client,
        })
    }

    pub fn write(&self, conn: &mut VConn, bytes: &[u8]) -> Result<(), TransportError> {
        let mut state = self.net.state.borrow_mut();
        let pipe = state.pipes.get_mut(&conn.id).ok_or(TransportError::NotConnected)?;
        let (own_closed, peer_closed, queue) = match conn.side {
            Side::Client => (pipe.client_closed, pipe.server_closed, &mut pipe.to_server),
            Side::Server => (pipe.server_closed, pipe.client_closed, &mut pipe.to_client),
        };
        if own_closed {
            return Err(TransportError::NotConnected);
        }
        if peer_closed {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe).into());
        }
        queue.push_back(Bytes::copy_from_slice(bytes));
        Ok(())
    }

    pub fn read(&self, conn: &mut VConn) -> Result<Receive, TransportError> {
        let mut state = self.net.state.borrow_mut();
        let pipe = state.pipes.get_mut(&conn.id).ok_or(TransportError::NotConnected)?;
        let (peer_closed, queue) = match conn.side {
            Side::Client => (pipe.server_closed, &mut pipe.to_client),
            Side::Server => (pipe.client_closed, &mut pipe.to_server),
        };
        Ok(match queue.pop_front() {
            Some(chunk) => Receive::Data(chunk),
            None if peer_closed => Receive::Closed,
            None => Receive::Pending,
        })
    }

    /// Close our end. Data already written stays readable by the peer.
    pub fn close(&self, conn: VConn) -> Result<(), TransportError> {
        let mut state = self.net.state.borrow_mut();
        let pipe = state.pipes.get_mut(&conn.id).ok_or(TransportError::NotConnected)?;
        match conn.side {
            Side::Client => pipe.client_closed = true,
            Side::Server => pipe.server_closed = true,
        }
        let drained = pipe.to_client.is_empty() && pipe.to_server.is_empty();
        if pipe.client_closed && pipe.server_closed && drained {
            state.pipes.remove(&conn.id);
        }
        Ok(())
    }
}

// ── Datagrams ─────────────────────────────────────────────────────────────────

pub struct VDatagrams {
    net: VirtualNet,
    local: SocketAddr,
}

impl DatagramTransport for VDatagrams {
    fn send_datagram(&mut self, dest: SocketAddr, bytes: &[u8]) -> Result<(), TransportError> {
        let datagram = Datagram {
            bytes: Bytes::copy_from_slice(bytes),
            from: self.local,
        };
        let mut state = self.net.state.borrow_mut();
        if dest.ip() == IpAddr::V4(Ipv4Addr::BROADCAST) {
            for (addr, inbox) in state.inboxes.iter_mut() {
                if addr.port() == dest.port() {
                    inbox.push_back(datagram.clone());
                }
            }
        } else if let Some(inbox) = state.inboxes.get_mut(&dest) {
            inbox.push_back(datagram);
        }
        Ok(())
    }

    fn receive_datagram(&mut self) -> Result<Option<Datagram>, TransportError> {
        let mut state = self.net.state.borrow_mut();
        Ok(state.inboxes.get_mut(&self.local).and_then(VecDeque::pop_front))
    }
}

// ── Single-slot stream driver ─────────────────────────────────────────────────

pub struct VStreams {
    host: Host,
}

impl StreamTransport for VStreams {
    type Listener = VListener;
    type Connection = VConn;

    fn begin_listen(&mut self, port: u16) -> Result<VListener, TransportError> {
        self.host.listen(port)
    }

    fn poll_accept(
        &mut self,
        listener: VListener,
    ) -> Result<Accept<VListener, VConn>, TransportError> {
        match self.host.pop_backlog(&listener)? {
            Some((id, from)) => {
                // One passive open accepts one connection.
                self.host.unlisten(listener);
                Ok(Accept::Connected {
                    conn: VConn {
                        id,
                        side: Side::Server,
                    },
                    from,
                })
            }
            None => Ok(Accept::Pending(listener)),
        }
    }

    fn abort_listen(&mut self, listener: VListener) -> Result<(), TransportError> {
        self.host.unlisten(listener);
        Ok(())
    }

    fn connect(&mut self, addr: SocketAddr, _timeout: Duration) -> Result<VConn, TransportError> {
        self.host.connect(addr)
    }

    fn send(
        &mut self,
        conn: &mut VConn,
        bytes: &[u8],
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        self.host.write(conn, bytes)
    }

    fn receive(&mut self, conn: &mut VConn) -> Result<Receive, TransportError> {
        self.host.read(conn)
    }

    fn close(&mut self, conn: VConn, _graceful: bool) -> Result<(), TransportError> {
        self.host.close(conn)
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

// ── Pooled endpoint driver ────────────────────────────────────────────────────

pub struct VEndpoint {
    conn: Option<VConn>,
}

pub struct VEndpoints {
    host: Host,
}

impl EndpointDriver for VEndpoints {
    type Listener = VListener;
    type Indication = u64;
    type Endpoint = VEndpoint;

    fn open_listener(&mut self, port: u16) -> Result<VListener, TransportError> {
        self.host.listen(port)
    }

    fn poll_indication(
        &mut self,
        listener: &mut VListener,
    ) -> Result<Option<(u64, SocketAddr)>, TransportError> {
        self.host.pop_backlog(listener)
    }

    fn reject_indication(&mut self, _listener: &mut VListener, indication: u64) {
        let _ = self.host.close(VConn {
            id: indication,
            side: Side::Server,
        });
    }

    fn create_endpoint(&mut self) -> Result<VEndpoint, TransportError> {
        Ok(VEndpoint { conn: None })
    }

    fn poll_endpoint(
        &mut self,
        _endpoint: &mut VEndpoint,
    ) -> Result<EndpointStatus, TransportError> {
        Ok(EndpointStatus::Ready)
    }

    fn begin_accept(
        &mut self,
        _listener: &mut VListener,
        indication: u64,
        endpoint: &mut VEndpoint,
    ) -> Result<(), TransportError> {
        endpoint.conn = Some(VConn {
            id: indication,
            side: Side::Server,
        });
        Ok(())
    }

    fn connect(
        &mut self,
        addr: SocketAddr,
        _timeout: Duration,
    ) -> Result<VEndpoint, TransportError> {
        Ok(VEndpoint {
            conn: Some(self.host.connect(addr)?),
        })
    }

    fn send(
        &mut self,
        endpoint: &mut VEndpoint,
        bytes: &[u8],
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        let conn = endpoint.conn.as_mut().ok_or(TransportError::NotConnected)?;
        self.host.write(conn, bytes)
    }

    fn receive(&mut self, endpoint: &mut VEndpoint) -> Result<Receive, TransportError> {
        let conn = endpoint.conn.as_mut().ok_or(TransportError::NotConnected)?;
        self.host.read(conn)
    }

    fn close(&mut self, endpoint: VEndpoint, _graceful: bool) -> Result<(), TransportError> {
        match endpoint.conn {
            Some(conn) => self.host.close(conn),
            None => Ok(()),
        }
    }

    fn close_listener(&mut self, listener: VListener) -> Result<(), TransportError> {
        self.host.unlisten(listener);
        Ok(())
    }
}
