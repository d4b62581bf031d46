//! Pooled, event-driven connection handling.
//!
//! A persistent listener only collects connection indications. Each
//! indication waits in a bounded queue until a free data endpoint slot can
//! take it:
//!
//! ```text
//! Idle → Creating → Accepting → Connected → Idle
//! ```
//!
//! Outbound sends open their own endpoint and never disturb the listener,
//! so there is no busy state on this path.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use csend_core::wire::MessageType;
use csend_core::Identity;

use crate::events::EventQueue;
use crate::messaging::{dispatch_frame, Dispatch, MessagingEngine, SendError};
use crate::peer::PeerTable;
use crate::timing::{clip_to_budget, Timings, POOL_SIZE};
use crate::transport::{EndpointDriver, EndpointStatus, ErrorClass, Receive, TransportError};

/// Indications waiting for a free slot. Further ones are rejected.
pub const INDICATION_QUEUE_CAPACITY: usize = 8;

/// Frames read from one endpoint per tick.
const MAX_FRAMES_PER_TICK: usize = 8;

/// Observable state of one pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Creating,
    Accepting,
    Connected,
}

enum PoolSlot<I, E> {
    Idle,
    Creating {
        endpoint: E,
        indication: I,
        peer: SocketAddr,
        since: Instant,
    },
    Accepting {
        endpoint: E,
        peer: SocketAddr,
        since: Instant,
    },
    Connected {
        endpoint: E,
        peer: SocketAddr,
        last_activity: Instant,
    },
}

impl<I, E> PoolSlot<I, E> {
    fn state(&self) -> SlotState {
        match self {
            PoolSlot::Idle => SlotState::Idle,
            PoolSlot::Creating { .. } => SlotState::Creating,
            PoolSlot::Accepting { .. } => SlotState::Accepting,
            PoolSlot::Connected { .. } => SlotState::Connected,
        }
    }
}

enum ListenerState<L> {
    Closed { retry_at: Option<Instant> },
    Open(L),
}

pub struct ConnectionPool<D: EndpointDriver> {
    driver: D,
    identity: Identity,
    port: u16,
    timings: Timings,
    listener: ListenerState<D::Listener>,
    pending: VecDeque<(D::Indication, SocketAddr)>,
    slots: Vec<PoolSlot<D::Indication, D::Endpoint>>,
    /// Transient listener failures in a row, across opens and polls.
    consecutive_conflicts: u32,
    stopped: bool,
}

impl<D: EndpointDriver> ConnectionPool<D> {
    pub fn new(driver: D, identity: Identity, port: u16, timings: Timings) -> Self {
        Self::with_size(driver, identity, port, timings, POOL_SIZE)
    }

    pub fn with_size(
        driver: D,
        identity: Identity,
        port: u16,
        timings: Timings,
        size: usize,
    ) -> Self {
        Self {
            driver,
            identity,
            port,
            timings,
            listener: ListenerState::Closed { retry_at: None },
            pending: VecDeque::with_capacity(INDICATION_QUEUE_CAPACITY),
            slots: (0..size).map(|_| PoolSlot::Idle).collect(),
            consecutive_conflicts: 0,
            stopped: false,
        }
    }

    pub fn slot_states(&self) -> Vec<SlotState> {
        self.slots.iter().map(PoolSlot::state).collect()
    }

    pub fn is_listening(&self) -> bool {
        matches!(self.listener, ListenerState::Open(_))
    }

    pub fn queued_indications(&self) -> usize {
        self.pending.len()
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn tick(&mut self, now: Instant, peers: &mut PeerTable, events: &mut EventQueue) {
        if self.stopped {
            return;
        }
        self.ensure_listener(now);
        self.collect_indications(now);
        self.sweep_stale(now);
        self.assign_pending(now);
        for i in 0..self.slots.len() {
            let slot = std::mem::replace(&mut self.slots[i], PoolSlot::Idle);
            self.slots[i] = self.advance(slot, now, peers, events);
        }
    }

    // ── Listener ──────────────────────────────────────────────────────────────

    fn ensure_listener(&mut self, now: Instant) {
        let ListenerState::Closed { retry_at } = self.listener else {
            return;
        };
        if retry_at.is_some_and(|at| now < at) {
            return;
        }
        match self.driver.open_listener(self.port) {
            Ok(listener) => {
                tracing::debug!(port = self.port, "pool listener open");
                self.consecutive_conflicts = 0;
                self.listener = ListenerState::Open(listener);
            }
            Err(e) => {
                let escalate =
                    e.class() != ErrorClass::Transient || self.conflict_limit_reached();
                let backoff = if escalate {
                    self.consecutive_conflicts = 0;
                    self.timings.reset_backoff
                } else {
                    self.timings.listen_retry_backoff
                };
                tracing::warn!(
                    error = %e,
                    backoff_ms = backoff.as_millis() as u64,
                    "pool listener open failed"
                );
                self.listener = ListenerState::Closed {
                    retry_at: Some(now + backoff),
                };
            }
        }
    }

    /// Count one more transient failure. True once the run is long enough
    /// to treat the listener as broken.
    fn conflict_limit_reached(&mut self) -> bool {
        self.consecutive_conflicts += 1;
        self.consecutive_conflicts >= self.timings.max_transient_retries
    }

    fn collect_indications(&mut self, now: Instant) {
        let ListenerState::Open(listener) = &mut self.listener else {
            return;
        };
        loop {
            match self.driver.poll_indication(listener) {
                Ok(Some((indication, peer))) => {
                    if self.pending.len() >= INDICATION_QUEUE_CAPACITY {
                        tracing::warn!(peer = %peer, "indication queue full, rejecting");
                        self.driver.reject_indication(listener, indication);
                    } else {
                        tracing::trace!(peer = %peer, "connection indication queued");
                        self.pending.push_back((indication, peer));
                    }
                }
                Ok(None) => {
                    self.consecutive_conflicts = 0;
                    return;
                }
                Err(e) if e.class() == ErrorClass::Transient => {
                    if self.conflict_limit_reached() {
                        tracing::warn!(
                            error = %e,
                            conflicts = self.consecutive_conflicts,
                            "indication polls keep conflicting, recreating listener"
                        );
                        self.recreate_listener(now);
                    } else {
                        tracing::debug!(
                            error = %e,
                            conflicts = self.consecutive_conflicts,
                            "indication poll conflict"
                        );
                    }
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "pool listener broken, recreating after backoff");
                    self.recreate_listener(now);
                    return;
                }
            }
        }
    }

    fn recreate_listener(&mut self, now: Instant) {
        self.consecutive_conflicts = 0;
        let old = std::mem::replace(
            &mut self.listener,
            ListenerState::Closed {
                retry_at: Some(now + self.timings.reset_backoff),
            },
        );
        if let ListenerState::Open(mut listener) = old {
            // Queued indications belong to the dead listener.
            for (indication, _) in self.pending.drain(..) {
                self.driver.reject_indication(&mut listener, indication);
            }
            if let Err(e) = self.driver.close_listener(listener) {
                tracing::debug!(error = %e, "closing broken listener failed");
            }
        }
    }

    // ── Slots ─────────────────────────────────────────────────────────────────

    fn sweep_stale(&mut self, now: Instant) {
        for i in 0..self.slots.len() {
            let stale = match &self.slots[i] {
                PoolSlot::Creating { since, .. } | PoolSlot::Accepting { since, .. } => {
                    now.saturating_duration_since(*since) > self.timings.stale_operation_timeout
                }
                PoolSlot::Idle | PoolSlot::Connected { .. } => false,
            };
            if !stale {
                continue;
            }
            match std::mem::replace(&mut self.slots[i], PoolSlot::Idle) {
                PoolSlot::Creating { endpoint, indication, peer, .. } => {
                    tracing::warn!(slot = i, peer = %peer, "endpoint creation stalled, reclaiming");
                    self.reject(indication);
                    self.release(endpoint, peer, false);
                }
                PoolSlot::Accepting { endpoint, peer, .. } => {
                    tracing::warn!(slot = i, peer = %peer, "accept stalled, reclaiming");
                    self.release(endpoint, peer, false);
                }
                other => self.slots[i] = other,
            }
        }
    }

    fn assign_pending(&mut self, now: Instant) {
        for i in 0..self.slots.len() {
            if !matches!(self.slots[i], PoolSlot::Idle) {
                continue;
            }
            let Some((indication, peer)) = self.pending.pop_front() else {
                return;
            };
            match self.driver.create_endpoint() {
                Ok(endpoint) => {
                    tracing::trace!(slot = i, peer = %peer, "creating endpoint");
                    self.slots[i] = PoolSlot::Creating {
                        endpoint,
                        indication,
                        peer,
                        since: now,
                    };
                }
                Err(e) => {
                    tracing::warn!(peer = %peer, error = %e, "endpoint creation failed, rejecting");
                    self.reject(indication);
                }
            }
        }
    }

    fn advance(
        &mut self,
        slot: PoolSlot<D::Indication, D::Endpoint>,
        now: Instant,
        peers: &mut PeerTable,
        events: &mut EventQueue,
    ) -> PoolSlot<D::Indication, D::Endpoint> {
        match slot {
            PoolSlot::Idle => PoolSlot::Idle,
            PoolSlot::Creating { mut endpoint, indication, peer, since } => {
                match self.driver.poll_endpoint(&mut endpoint) {
                    Ok(EndpointStatus::Pending) => PoolSlot::Creating {
                        endpoint,
                        indication,
                        peer,
                        since,
                    },
                    Ok(EndpointStatus::Ready) => self.begin_accept(endpoint, indication, peer, now),
                    Err(e) => {
                        tracing::warn!(peer = %peer, error = %e, "endpoint creation failed");
                        self.reject(indication);
                        self.release(endpoint, peer, false);
                        PoolSlot::Idle
                    }
                }
            }
            PoolSlot::Accepting { mut endpoint, peer, since } => {
                match self.driver.poll_endpoint(&mut endpoint) {
                    Ok(EndpointStatus::Pending) => PoolSlot::Accepting { endpoint, peer, since },
                    Ok(EndpointStatus::Ready) => {
                        tracing::debug!(peer = %peer, "inbound connection accepted");
                        self.read_frames(endpoint, peer, now, now, peers, events)
                    }
                    Err(e) => {
                        tracing::warn!(peer = %peer, error = %e, "accept failed");
                        self.release(endpoint, peer, false);
                        PoolSlot::Idle
                    }
                }
            }
            PoolSlot::Connected { endpoint, peer, last_activity } => {
                self.read_frames(endpoint, peer, last_activity, now, peers, events)
            }
        }
    }

    fn begin_accept(
        &mut self,
        mut endpoint: D::Endpoint,
        indication: D::Indication,
        peer: SocketAddr,
        now: Instant,
    ) -> PoolSlot<D::Indication, D::Endpoint> {
        let result = match &mut self.listener {
            ListenerState::Open(listener) => {
                self.driver.begin_accept(listener, indication, &mut endpoint)
            }
            // Listener went away while the endpoint was being created.
            ListenerState::Closed { .. } => Err(TransportError::NotConnected),
        };
        match result {
            Ok(()) => PoolSlot::Accepting {
                endpoint,
                peer,
                since: now,
            },
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "begin accept failed");
                self.release(endpoint, peer, false);
                PoolSlot::Idle
            }
        }
    }

    fn read_frames(
        &mut self,
        mut endpoint: D::Endpoint,
        peer: SocketAddr,
        mut last_activity: Instant,
        now: Instant,
        peers: &mut PeerTable,
        events: &mut EventQueue,
    ) -> PoolSlot<D::Indication, D::Endpoint> {
        for _ in 0..MAX_FRAMES_PER_TICK {
            match self.driver.receive(&mut endpoint) {
                Ok(Receive::Data(bytes)) => {
                    last_activity = now;
                    if dispatch_frame(&bytes, peer.ip(), now, peers, events) == Dispatch::Quit {
                        self.release(endpoint, peer, true);
                        return PoolSlot::Idle;
                    }
                }
                Ok(Receive::Pending) => break,
                Ok(Receive::Closed) => {
                    self.release(endpoint, peer, true);
                    return PoolSlot::Idle;
                }
                Err(e) => {
                    tracing::warn!(peer = %peer, error = %e, "receive failed");
                    self.release(endpoint, peer, false);
                    return PoolSlot::Idle;
                }
            }
        }

        if now.saturating_duration_since(last_activity) > self.timings.idle_receive_timeout {
            tracing::debug!(peer = %peer, "inbound session idle, closing");
            self.release(endpoint, peer, false);
            return PoolSlot::Idle;
        }
        PoolSlot::Connected {
            endpoint,
            peer,
            last_activity,
        }
    }

    fn reject(&mut self, indication: D::Indication) {
        match &mut self.listener {
            ListenerState::Open(listener) => self.driver.reject_indication(listener, indication),
            ListenerState::Closed { .. } => drop(indication),
        }
    }

    /// Close an endpoint. The slot is free afterwards whatever the outcome.
    fn release(&mut self, endpoint: D::Endpoint, peer: SocketAddr, graceful: bool) {
        match self.driver.close(endpoint, graceful) {
            Ok(()) => tracing::trace!(peer = %peer, graceful, "endpoint closed"),
            Err(e) if e.class() == ErrorClass::AlreadyClosed => {}
            Err(e) => tracing::warn!(peer = %peer, error = %e, "endpoint close failed"),
        }
    }

    // ── Outbound ──────────────────────────────────────────────────────────────

    pub fn send(
        &mut self,
        to: IpAddr,
        msg_type: MessageType,
        payload: &str,
        _now: Instant,
    ) -> Result<(), SendError> {
        self.deliver(to, msg_type, payload, None)
    }

    /// Send a `Quit` whose connect and write together fit in `budget`.
    pub fn send_quit(
        &mut self,
        to: IpAddr,
        budget: Duration,
        _now: Instant,
    ) -> Result<(), SendError> {
        self.deliver(to, MessageType::Quit, "", Some(budget))
    }

    fn deliver(
        &mut self,
        to: IpAddr,
        msg_type: MessageType,
        payload: &str,
        budget: Option<Duration>,
    ) -> Result<(), SendError> {
        let started = Instant::now();
        let frame = self.identity.frame(msg_type, payload)?;
        let addr = SocketAddr::new(to, self.port);

        let connect_timeout = clip_to_budget(self.timings.connect_timeout, budget, started)
            .ok_or(SendError::DeadlineExceeded)?;
        let mut endpoint = match self.driver.connect(addr, connect_timeout) {
            Ok(endpoint) => endpoint,
            Err(e) if msg_type == MessageType::Quit && e.class() == ErrorClass::Transient => {
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
            self.release(endpoint, addr, false);
            return Err(SendError::DeadlineExceeded);
        };
        let result = self
            .driver
            .send(&mut endpoint, &frame, send_timeout)
            .map_err(SendError::Write);
        if let Err(e) = &result {
            tracing::warn!(peer = %addr, error = %e, "send failed");
        }
        let graceful = result.is_ok() && msg_type != MessageType::Quit;
        self.release(endpoint, addr, graceful);

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

    pub fn shutdown(&mut self) {
        self.stopped = true;
        for i in 0..self.slots.len() {
            match std::mem::replace(&mut self.slots[i], PoolSlot::Idle) {
                PoolSlot::Idle => {}
                PoolSlot::Creating { endpoint, indication, peer, .. } => {
                    self.reject(indication);
                    self.release(endpoint, peer, false);
                }
                PoolSlot::Accepting { endpoint, peer, .. }
                | PoolSlot::Connected { endpoint, peer, .. } => self.release(endpoint, peer, false),
            }
        }
        let closed = ListenerState::Closed { retry_at: None };
        let listener = std::mem::replace(&mut self.listener, closed);
        if let ListenerState::Open(mut listener) = listener {
            for (indication, _) in self.pending.drain(..) {
                self.driver.reject_indication(&mut listener, indication);
            }
            if let Err(e) = self.driver.close_listener(listener) {
                tracing::debug!(error = %e, "closing listener on shutdown failed");
            }
        }
    }
}

impl<D: EndpointDriver> MessagingEngine for ConnectionPool<D> {
    fn tick(&mut self, now: Instant, peers: &mut PeerTable, events: &mut EventQueue) {
        ConnectionPool::tick(self, now, peers, events)
    }

    fn send(
        &mut self,
        to: IpAddr,
        msg_type: MessageType,
        payload: &str,
        now: Instant,
    ) -> Result<(), SendError> {
        ConnectionPool::send(self, to, msg_type, payload, now)
    }

    fn send_quit(&mut self, to: IpAddr, budget: Duration, now: Instant) -> Result<(), SendError> {
        ConnectionPool::send_quit(self, to, budget, now)
    }

    fn shutdown(&mut self) {
        ConnectionPool::shutdown(self)
    }
}
