//! Single-slot connection state machine.
//!
//! One stream resource is shared between receiving and sending:
//!
//! ```text
//! Idle → Listening → Accepting → Receiving → Closing → Idle
//! Idle → Connecting → Sending → Closing → Idle
//! ```
//!
//! The two paths are mutually exclusive. A send while listening aborts the
//! listen first; a send while an inbound session is open is rejected with
//! [`SendError::Busy`]. The machine is advanced by [`ConnectionMachine::tick`]
//! and never blocks there.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use csend_core::wire::MessageType;
use csend_core::Identity;

use crate::events::EventQueue;
use crate::messaging::{dispatch_frame, Dispatch, MessagingEngine, SendError};
use crate::peer::PeerTable;
use crate::timing::{clip_to_budget, Timings};
use crate::transport::{Accept, ErrorClass, Receive, StreamTransport, TransportError};

/// Upper bound on state transitions processed in one tick.
const MAX_STEPS_PER_TICK: usize = 16;

/// Observable role of the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Idle,
    Listening,
    Accepting,
    Receiving,
    /// Only held for the duration of a send call.
    Connecting,
    /// Only held for the duration of a send call.
    Sending,
    Closing,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Idle => "idle",
            Role::Listening => "listening",
            Role::Accepting => "accepting",
            Role::Receiving => "receiving",
            Role::Connecting => "connecting",
            Role::Sending => "sending",
            Role::Closing => "closing",
        };
        f.write_str(s)
    }
}

enum Slot<L, C> {
    Idle,
    Listening(L),
    /// Accepted, nothing read yet.
    Accepting {
        conn: C,
        peer: SocketAddr,
        last_activity: Instant,
    },
    Receiving {
        conn: C,
        peer: SocketAddr,
        last_activity: Instant,
    },
    Closing {
        conn: C,
        peer: SocketAddr,
        graceful: bool,
    },
}

impl<L, C> Slot<L, C> {
    fn role(&self) -> Role {
        match self {
            Slot::Idle => Role::Idle,
            Slot::Listening(_) => Role::Listening,
            Slot::Accepting { .. } => Role::Accepting,
            Slot::Receiving { .. } => Role::Receiving,
            Slot::Closing { .. } => Role::Closing,
        }
    }
}

/// Whether the tick loop should keep stepping.
#[derive(PartialEq, Eq)]
enum Flow {
    Continue,
    Yield,
}

pub struct ConnectionMachine<T: StreamTransport> {
    transport: T,
    identity: Identity,
    port: u16,
    timings: Timings,
    slot: Slot<T::Listener, T::Connection>,
    /// Earliest time the next listen may be issued.
    retry_deadline: Option<Instant>,
    consecutive_conflicts: u32,
    stopped: bool,
}

impl<T: StreamTransport> ConnectionMachine<T> {
    pub fn new(transport: T, identity: Identity, port: u16, timings: Timings) -> Self {
        Self {
            transport,
            identity,
            port,
            timings,
            slot: Slot::Idle,
            retry_deadline: None,
            consecutive_conflicts: 0,
            stopped: false,
        }
    }

    pub fn role(&self) -> Role {
        self.slot.role()
    }

    /// Remote address of the current inbound session, if any.
    pub fn peer_address(&self) -> Option<SocketAddr> {
        match &self.slot {
            Slot::Accepting { peer, .. }
            | Slot::Receiving { peer, .. }
            | Slot::Closing { peer, .. } => Some(*peer),
            Slot::Idle | Slot::Listening(_) => None,
        }
    }

    pub fn retry_deadline(&self) -> Option<Instant> {
        self.retry_deadline
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Advance the slot as far as it can go without blocking.
    pub fn tick(&mut self, now: Instant, peers: &mut PeerTable, events: &mut EventQueue) {
        if self.stopped {
            return;
        }
        for _ in 0..MAX_STEPS_PER_TICK {
            let slot = std::mem::replace(&mut self.slot, Slot::Idle);
            let before = slot.role();
            let (next, flow) = self.step(slot, now, peers, events);
            if next.role() != before {
                tracing::trace!(from = %before, to = %next.role(), "slot transition");
            }
            self.slot = next;
            if flow == Flow::Yield {
                break;
            }
        }
    }

    fn step(
        &mut self,
        slot: Slot<T::Listener, T::Connection>,
        now: Instant,
        peers: &mut PeerTable,
        events: &mut EventQueue,
    ) -> (Slot<T::Listener, T::Connection>, Flow) {
        match slot {
            Slot::Idle => (self.start_listen(now), Flow::Yield),
            Slot::Listening(listener) => self.poll_listener(listener, now),
            Slot::Accepting { conn, peer, last_activity } => {
                self.read_frame(conn, peer, last_activity, false, now, peers, events)
            }
            Slot::Receiving { conn, peer, last_activity } => {
                self.read_frame(conn, peer, last_activity, true, now, peers, events)
            }
            Slot::Closing { conn, peer, graceful } => {
                self.finish_close(conn, peer, graceful, now);
                (Slot::Idle, Flow::Yield)
            }
        }
    }

    // ── Inbound path ──────────────────────────────────────────────────────────

    fn start_listen(&mut self, now: Instant) -> Slot<T::Listener, T::Connection> {
        if self.retry_deadline.is_some_and(|deadline| now < deadline) {
            return Slot::Idle;
        }

        match self.transport.begin_listen(self.port) {
            Ok(listener) => {
                self.retry_deadline = None;
                self.consecutive_conflicts = 0;
                tracing::debug!(port = self.port, "listening");
                Slot::Listening(listener)
            }
            Err(e) => {
                self.listen_failed(e, now);
                Slot::Idle
            }
        }
    }

    fn listen_failed(&mut self, error: TransportError, now: Instant) {
        match error.class() {
            ErrorClass::Transient => {
                self.consecutive_conflicts += 1;
                if self.consecutive_conflicts >= self.timings.max_transient_retries {
                    tracing::warn!(
                        conflicts = self.consecutive_conflicts,
                        error = %error,
                        "listen keeps conflicting, resetting stream driver"
                    );
                    self.reset_driver(now);
                } else {
                    tracing::debug!(
                        conflicts = self.consecutive_conflicts,
                        error = %error,
                        "listen conflict, backing off"
                    );
                    self.retry_deadline = Some(now + self.timings.listen_retry_backoff);
                }
            }
            ErrorClass::Broken | ErrorClass::AlreadyClosed => {
                tracing::warn!(error = %error, "listen failed, resetting stream driver");
                self.reset_driver(now);
            }
        }
    }

    fn reset_driver(&mut self, now: Instant) {
        if let Err(e) = self.transport.reset() {
            tracing::error!(error = %e, "stream driver reset failed");
        }
        self.consecutive_conflicts = 0;
        self.retry_deadline = Some(now + self.timings.reset_backoff);
    }

    fn poll_listener(
        &mut self,
        listener: T::Listener,
        now: Instant,
    ) -> (Slot<T::Listener, T::Connection>, Flow) {
        match self.transport.poll_accept(listener) {
            Ok(Accept::Pending(listener)) => (Slot::Listening(listener), Flow::Yield),
            Ok(Accept::Connected { conn, from }) => {
                tracing::debug!(peer = %from, "inbound connection accepted");
                let slot = Slot::Accepting {
                    conn,
                    peer: from,
                    last_activity: now,
                };
                (slot, Flow::Continue)
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                self.listen_failed(e, now);
                (Slot::Idle, Flow::Yield)
            }
        }
    }

    fn read_frame(
        &mut self,
        mut conn: T::Connection,
        peer: SocketAddr,
        last_activity: Instant,
        received_any: bool,
        now: Instant,
        peers: &mut PeerTable,
        events: &mut EventQueue,
    ) -> (Slot<T::Listener, T::Connection>, Flow) {
        match self.transport.receive(&mut conn) {
            Ok(Receive::Data(bytes)) => {
                let next = match dispatch_frame(&bytes, peer.ip(), now, peers, events) {
                    Dispatch::Continue => Slot::Receiving {
                        conn,
                        peer,
                        last_activity: now,
                    },
                    Dispatch::Quit => Slot::Closing {
                        conn,
                        peer,
                        graceful: true,
                    },
                };
                (next, Flow::Continue)
            }
            Ok(Receive::Pending) => {
                let idle = now.saturating_duration_since(last_activity);
                if idle > self.timings.idle_receive_timeout {
                    tracing::debug!(peer = %peer, "inbound session idle, closing");
                    return (
                        Slot::Closing {
                            conn,
                            peer,
                            graceful: false,
                        },
                        Flow::Continue,
                    );
                }
                let slot = if received_any {
                    Slot::Receiving {
                        conn,
                        peer,
                        last_activity,
                    }
                } else {
                    Slot::Accepting {
                        conn,
                        peer,
                        last_activity,
                    }
                };
                (slot, Flow::Yield)
            }
            Ok(Receive::Closed) => (
                Slot::Closing {
                    conn,
                    peer,
                    graceful: true,
                },
                Flow::Continue,
            ),
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "receive failed");
                (
                    Slot::Closing {
                        conn,
                        peer,
                        graceful: false,
                    },
                    Flow::Continue,
                )
            }
        }
    }

    fn finish_close(
        &mut self,
        conn: T::Connection,
        peer: SocketAddr,
        graceful: bool,
        now: Instant,
    ) {
        match self.transport.close(conn, graceful) {
            Ok(()) => tracing::trace!(peer = %peer, graceful, "connection closed"),
            Err(e) if e.class() == ErrorClass::AlreadyClosed => {
                tracing::trace!(peer = %peer, "connection already closed")
            }
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "close failed, cooling down");
                self.retry_deadline = Some(now + self.timings.post_abort_cooldown);
            }
        }
    }

    // ── Outbound path ─────────────────────────────────────────────────────────

    /// Take the slot for an outbound message. Aborts a pending listen;
    /// refuses while an inbound session is open.
    fn claim_for_send(&mut self, now: Instant) -> Result<(), SendError> {
        match std::mem::replace(&mut self.slot, Slot::Idle) {
            Slot::Idle => Ok(()),
            Slot::Listening(listener) => match self.transport.abort_listen(listener) {
                Ok(()) => Ok(()),
                Err(e) if e.class() == ErrorClass::AlreadyClosed => Ok(()),
                Err(e) => {
                    tracing::warn!(error = %e, "could not abort listen for send");
                    self.retry_deadline = Some(now + self.timings.post_abort_cooldown);
                    Err(SendError::Busy)
                }
            },
            Slot::Closing { conn, peer, graceful } => {
                self.finish_close(conn, peer, graceful, now);
                Ok(())
            }
            busy @ (Slot::Accepting { .. } | Slot::Receiving { .. }) => {
                self.slot = busy;
                tracing::debug!(peer = ?self.peer_address(), "send refused, slot busy");
                Err(SendError::Busy)
            }
        }
    }

    /// Connect, write, close. The slot is left idle and listening resumes
    /// on the next tick.
    pub fn send(
        &mut self,
        to: IpAddr,
        msg_type: MessageType,
        payload: &str,
        now: Instant,
    ) -> Result<(), SendError> {
        self.deliver(to, msg_type, payload, None, now)
    }

    /// Send a `Quit` whose connect and write together fit in `budget`.
    pub fn send_quit(
        &mut self,
        to: IpAddr,
        budget: Duration,
        now: Instant,
    ) -> Result<(), SendError> {
        self.deliver(to, MessageType::Quit, "", Some(budget), now)
    }

    fn deliver(
        &mut self,
        to: IpAddr,
        msg_type: MessageType,
        payload: &str,
        budget: Option<Duration>,
        now: Instant,
    ) -> Result<(), SendError> {
        let started = Instant::now();
        let frame = self.identity.frame(msg_type, payload)?;
        self.claim_for_send(now)?;

        let addr = SocketAddr::new(to, self.port);
        let connect_timeout = clip_to_budget(self.timings.connect_timeout, budget, started)
            .ok_or(SendError::DeadlineExceeded)?;
        tracing::trace!(peer = %addr, role = %Role::Connecting, "slot transition");
        let mut conn = match self.transport.connect(addr, connect_timeout) {
            Ok(conn) => conn,
            Err(e) if msg_type == MessageType::Quit && e.class() == ErrorClass::Transient => {
                // The peer still holds our previous connection in teardown.
                tracing::debug!(
                    peer = %addr,
                    error = %e,
                    "quit hit an existing connection, treating as sent"
                );
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(peer = %addr, error = %e, "connect failed");
                return Err(SendError::Connect(e));
            }
        };

        let Some(send_timeout) = clip_to_budget(self.timings.send_timeout, budget, started) else {
            tracing::warn!(peer = %addr, "budget spent while connecting");
            self.finish_close(conn, addr, false, now);
            return Err(SendError::DeadlineExceeded);
        };
        tracing::trace!(peer = %addr, role = %Role::Sending, "slot transition");
        let result = self
            .transport
            .send(&mut conn, &frame, send_timeout)
            .map_err(SendError::Write);
        if let Err(e) = &result {
            tracing::warn!(peer = %addr, error = %e, "send failed");
        }

        // Quit closes abortively; the process is about to go away.
        let graceful = result.is_ok() && msg_type != MessageType::Quit;
        self.finish_close(conn, addr, graceful, now);

        if result.is_ok() {
            tracing::debug!(
                peer = %addr,
                msg_type = %msg_type,
                bytes = frame.len(),
                "message sent"
            );
        }
        result
    }

    /// Abort whatever the slot holds and stop listening.
    pub fn shutdown(&mut self) {
        self.stopped = true;
        match std::mem::replace(&mut self.slot, Slot::Idle) {
            Slot::Idle => {}
            Slot::Listening(listener) => {
                if let Err(e) = self.transport.abort_listen(listener) {
                    if e.class() != ErrorClass::AlreadyClosed {
                        tracing::warn!(error = %e, "abort listen on shutdown failed");
                    }
                }
            }
            Slot::Accepting { conn, peer, .. }
            | Slot::Receiving { conn, peer, .. }
            | Slot::Closing { conn, peer, .. } => {
                if let Err(e) = self.transport.close(conn, false) {
                    if e.class() != ErrorClass::AlreadyClosed {
                        tracing::warn!(peer = %peer, error = %e, "abort on shutdown failed");
                    }
                }
            }
        }
    }
}

impl<T: StreamTransport> MessagingEngine for ConnectionMachine<T> {
    fn tick(&mut self, now: Instant, peers: &mut PeerTable, events: &mut EventQueue) {
        ConnectionMachine::tick(self, now, peers, events)
    }

    fn send(
        &mut self,
        to: IpAddr,
        msg_type: MessageType,
        payload: &str,
        now: Instant,
    ) -> Result<(), SendError> {
        ConnectionMachine::send(self, to, msg_type, payload, now)
    }

    fn send_quit(&mut self, to: IpAddr, budget: Duration, now: Instant) -> Result<(), SendError> {
        ConnectionMachine::send_quit(self, to, budget, now)
    }

    fn shutdown(&mut self) {
        ConnectionMachine::shutdown(self)
    }
}
