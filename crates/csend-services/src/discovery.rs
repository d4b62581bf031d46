//! Discovery: periodic broadcast and handling of inbound discovery
//! datagrams.
//!
//! Every `DISCOVERY_INTERVAL` the node broadcasts a `DISCOVERY` frame. A
//! peer receiving it records the sender and answers with a unicast
//! `DISCOVERY_RESPONSE`. Responses are recorded but never answered.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use csend_core::wire::{self, MessageType, DISCOVERY_INTERVAL_SECS};
use csend_core::Identity;

use crate::events::EventQueue;
use crate::peer::{PeerTable, Upsert};
use crate::transport::DatagramTransport;

/// What handling one datagram produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketOutcome {
    /// Send a `DISCOVERY_RESPONSE` here.
    pub respond_to: Option<SocketAddr>,
    /// A new peer entered the table.
    pub peer_added: bool,
}

pub struct DiscoveryEngine {
    identity: Identity,
    broadcast: SocketAddr,
    interval: Duration,
    last_broadcast: Option<Instant>,
}

impl DiscoveryEngine {
    pub fn new(identity: Identity, broadcast: SocketAddr) -> Self {
        Self {
            identity,
            broadcast,
            interval: Duration::from_secs(DISCOVERY_INTERVAL_SECS),
            last_broadcast: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn broadcast_addr(&self) -> SocketAddr {
        self.broadcast
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// True when nothing has been broadcast yet or the interval elapsed.
    pub fn broadcast_due(&self, now: Instant) -> bool {
        self.last_broadcast
            .map_or(true, |last| now.saturating_duration_since(last) >= self.interval)
    }

    /// Record a successful broadcast. Failed sends leave the timer alone so
    /// the next tick tries again.
    pub fn mark_broadcast(&mut self, now: Instant) {
        self.last_broadcast = Some(now);
    }

    pub fn discovery_frame(&self) -> Result<Vec<u8>, wire::WireError> {
        self.identity.frame(MessageType::Discovery, "")
    }

    pub fn response_frame(&self) -> Result<Vec<u8>, wire::WireError> {
        self.identity.frame(MessageType::DiscoveryResponse, "")
    }

    fn is_self(&self, from: IpAddr) -> bool {
        from == self.identity.address
    }

    /// Apply one datagram to the peer table without doing any I/O.
    pub fn handle_packet(
        &self,
        bytes: &[u8],
        from: SocketAddr,
        now: Instant,
        peers: &mut PeerTable,
    ) -> PacketOutcome {
        if self.is_self(from.ip()) {
            tracing::trace!("ignoring own discovery datagram");
            return PacketOutcome::default();
        }

        let envelope = match wire::decode(bytes) {
            Ok(env) => env,
            Err(e) => {
                tracing::debug!(peer = %from, error = %e, "discarding malformed datagram");
                return PacketOutcome::default();
            }
        };

        let respond_to = match envelope.msg_type {
            MessageType::Discovery => Some(from),
            MessageType::DiscoveryResponse => None,
            MessageType::Text | MessageType::Quit => {
                tracing::debug!(
                    peer = %from,
                    msg_type = %envelope.msg_type,
                    "stream message on discovery socket ignored"
                );
                return PacketOutcome::default();
            }
        };

        let peer_added = match peers.upsert(from.ip(), &envelope.sender_name, now) {
            Ok(Upsert::Added) => {
                tracing::info!(peer = %from.ip(), name = %envelope.sender_name, "peer discovered");
                true
            }
            Ok(Upsert::Updated) => false,
            Err(e) => {
                tracing::warn!(peer = %from.ip(), error = %e, "discovered peer not recorded");
                false
            }
        };

        PacketOutcome {
            respond_to,
            peer_added,
        }
    }

    /// Handle one datagram and send any response it calls for.
    pub fn on_packet<D: DatagramTransport>(
        &self,
        transport: &mut D,
        bytes: &[u8],
        from: SocketAddr,
        now: Instant,
        peers: &mut PeerTable,
        events: &mut EventQueue,
    ) {
        let outcome = self.handle_packet(bytes, from, now, peers);
        if let Some(dest) = outcome.respond_to {
            self.respond(transport, dest);
        }
        if outcome.peer_added {
            events.peers_changed();
        }
    }

    fn respond<D: DatagramTransport>(&self, transport: &mut D, dest: SocketAddr) {
        let frame = match self.response_frame() {
            Ok(f) => f,
            Err(e) => {
                tracing::error!(error = %e, "cannot encode discovery response");
                return;
            }
        };
        match transport.send_datagram(dest, &frame) {
            Ok(()) => tracing::trace!(peer = %dest, "discovery response sent"),
            Err(e) => tracing::warn!(peer = %dest, error = %e, "discovery response failed"),
        }
    }

    /// Broadcast when due, then drain every waiting datagram.
    pub fn tick<D: DatagramTransport>(
        &mut self,
        now: Instant,
        transport: &mut D,
        peers: &mut PeerTable,
        events: &mut EventQueue,
    ) {
        if self.broadcast_due(now) {
            match self.discovery_frame() {
                Ok(frame) => match transport.send_datagram(self.broadcast, &frame) {
                    Ok(()) => {
                        self.mark_broadcast(now);
                        tracing::trace!(dest = %self.broadcast, "discovery broadcast sent");
                    }
                    Err(e) => tracing::warn!(error = %e, "discovery broadcast failed"),
                },
                Err(e) => tracing::error!(error = %e, "cannot encode discovery broadcast"),
            }
        }

        loop {
            match transport.receive_datagram() {
                Ok(Some(datagram)) => {
                    self.on_packet(transport, &datagram.bytes, datagram.from, now, peers, events)
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "discovery receive failed");
                    break;
                }
            }
        }
    }
}
