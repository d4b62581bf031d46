//! Network driver contract.
//!
//! The protocol engines never touch sockets. They are handed a driver that
//! implements one of the traits below: real sockets in the daemon, an
//! in-memory network in tests. Every call is non-blocking except `connect`
//! and `send`, which are bounded by the timeout they are given.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;

// ── Errors ────────────────────────────────────────────────────────────────────

/// How the engines react to a driver failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Resource conflict. Retry the same operation after a backoff.
    Transient,
    /// The resource is unusable. Tear it down and start over.
    Broken,
    /// The thing being closed or aborted is already gone.
    AlreadyClosed,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("resource busy (port in use or connection exists)")]
    Busy,
    #[error("not connected")]
    NotConnected,
    #[error("operation aborted")]
    Aborted,
    #[error("timed out")]
    TimedOut,
    #[error("connection refused")]
    Refused,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TransportError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TransportError::Busy => ErrorClass::Transient,
            TransportError::NotConnected | TransportError::Aborted => ErrorClass::AlreadyClosed,
            TransportError::TimedOut | TransportError::Refused => ErrorClass::Broken,
            TransportError::Io(e) => match e.kind() {
                io::ErrorKind::AddrInUse | io::ErrorKind::WouldBlock => ErrorClass::Transient,
                io::ErrorKind::NotConnected => ErrorClass::AlreadyClosed,
                _ => ErrorClass::Broken,
            },
        }
    }
}

// ── Datagrams ─────────────────────────────────────────────────────────────────

/// One received datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub bytes: Bytes,
    pub from: SocketAddr,
}

/// Broadcast-capable datagram socket used by discovery.
pub trait DatagramTransport {
    fn send_datagram(&mut self, dest: SocketAddr, bytes: &[u8]) -> Result<(), TransportError>;

    /// `Ok(None)` when nothing is waiting.
    fn receive_datagram(&mut self) -> Result<Option<Datagram>, TransportError>;
}

// ── Streams (single slot) ─────────────────────────────────────────────────────

/// Result of reading from a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Receive {
    /// One complete frame.
    Data(Bytes),
    /// Nothing available yet.
    Pending,
    /// The peer finished sending.
    Closed,
}

/// Result of polling a passive open.
pub enum Accept<L, C> {
    /// Still listening. The listener is handed back.
    Pending(L),
    /// The listener turned into a connection with `from`.
    Connected { conn: C, from: SocketAddr },
}

/// Stream driver for the single-slot machine.
///
/// A listener is a one-shot passive open: once a peer connects it becomes
/// that connection, and a new listen must be issued for the next one.
pub trait StreamTransport {
    type Listener;
    type Connection;

    fn begin_listen(&mut self, port: u16) -> Result<Self::Listener, TransportError>;

    fn poll_accept(
        &mut self,
        listener: Self::Listener,
    ) -> Result<Accept<Self::Listener, Self::Connection>, TransportError>;

    fn abort_listen(&mut self, listener: Self::Listener) -> Result<(), TransportError>;

    fn connect(
        &mut self,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<Self::Connection, TransportError>;

    fn send(
        &mut self,
        conn: &mut Self::Connection,
        bytes: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError>;

    fn receive(&mut self, conn: &mut Self::Connection) -> Result<Receive, TransportError>;

    /// Release a connection. `graceful = false` is an abortive close.
    fn close(&mut self, conn: Self::Connection, graceful: bool) -> Result<(), TransportError>;

    /// Drop every resource the driver holds and start clean.
    fn reset(&mut self) -> Result<(), TransportError>;
}

// ── Endpoints (pooled) ────────────────────────────────────────────────────────

/// Progress of an asynchronous endpoint operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointStatus {
    Pending,
    Ready,
}

/// Endpoint driver for the pooled variant.
///
/// A persistent listener reports connection indications. Each indication
/// is accepted onto a separately created data endpoint. Creation and
/// accept both complete asynchronously and are observed via
/// [`poll_endpoint`](EndpointDriver::poll_endpoint).
pub trait EndpointDriver {
    type Listener;
    type Indication;
    type Endpoint;

    fn open_listener(&mut self, port: u16) -> Result<Self::Listener, TransportError>;

    fn poll_indication(
        &mut self,
        listener: &mut Self::Listener,
    ) -> Result<Option<(Self::Indication, SocketAddr)>, TransportError>;

    fn reject_indication(&mut self, listener: &mut Self::Listener, indication: Self::Indication);

    /// Start creating a data endpoint.
    fn create_endpoint(&mut self) -> Result<Self::Endpoint, TransportError>;

    /// Ready once the last creation or accept on `endpoint` has completed.
    fn poll_endpoint(&mut self, endpoint: &mut Self::Endpoint)
        -> Result<EndpointStatus, TransportError>;

    /// Start accepting `indication` onto a ready endpoint.
    fn begin_accept(
        &mut self,
        listener: &mut Self::Listener,
        indication: Self::Indication,
        endpoint: &mut Self::Endpoint,
    ) -> Result<(), TransportError>;

    fn connect(
        &mut self,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<Self::Endpoint, TransportError>;

    fn send(
        &mut self,
        endpoint: &mut Self::Endpoint,
        bytes: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError>;

    fn receive(&mut self, endpoint: &mut Self::Endpoint) -> Result<Receive, TransportError>;

    fn close(&mut self, endpoint: Self::Endpoint, graceful: bool) -> Result<(), TransportError>;

    fn close_listener(&mut self, listener: Self::Listener) -> Result<(), TransportError>;
}
