//! Node: one chat participant driven by a cooperative tick.
//!
//! Owns the peer table, discovery engine, datagram driver and a messaging
//! engine. Nothing here spawns threads or blocks outside the bounded
//! connect/send calls of the messaging engine, so several nodes can share
//! one thread.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use csend_core::wire::{
    MessageType, DISCOVERY_INTERVAL_SECS, DISCOVERY_PORT, MAX_PEERS, PEER_TIMEOUT_SECS,
};
use csend_core::Identity;

use crate::discovery::DiscoveryEngine;
use crate::events::{EventQueue, NodeEvent, ShellEvents};
use crate::messaging::{MessagingEngine, SendError};
use crate::peer::PeerTable;
use crate::timing::QUIT_BROADCAST_DEADLINE;
use crate::transport::DatagramTransport;

/// Node construction parameters.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub peer_capacity: usize,
    pub peer_timeout: Duration,
    pub discovery_interval: Duration,
    /// Where discovery broadcasts go.
    pub broadcast: SocketAddr,
    pub quit_deadline: Duration,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            peer_capacity: MAX_PEERS,
            peer_timeout: Duration::from_secs(PEER_TIMEOUT_SECS),
            discovery_interval: Duration::from_secs(DISCOVERY_INTERVAL_SECS),
            broadcast: SocketAddr::from(([255, 255, 255, 255], DISCOVERY_PORT)),
            quit_deadline: QUIT_BROADCAST_DEADLINE,
        }
    }
}

pub struct Node<D: DatagramTransport, M: MessagingEngine> {
    peers: PeerTable,
    discovery: DiscoveryEngine,
    datagrams: D,
    messaging: M,
    events: EventQueue,
    peer_timeout: Duration,
    quit_deadline: Duration,
}

impl<D: DatagramTransport, M: MessagingEngine> Node<D, M> {
    pub fn new(identity: Identity, options: NodeOptions, datagrams: D, messaging: M) -> Self {
        let discovery = DiscoveryEngine::new(identity, options.broadcast)
            .with_interval(options.discovery_interval);
        Self {
            peers: PeerTable::new(options.peer_capacity),
            discovery,
            datagrams,
            messaging,
            events: EventQueue::new(),
            peer_timeout: options.peer_timeout,
            quit_deadline: options.quit_deadline,
        }
    }

    pub fn identity(&self) -> &Identity {
        self.discovery.identity()
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn messaging(&self) -> &M {
        &self.messaging
    }

    pub fn messaging_mut(&mut self) -> &mut M {
        &mut self.messaging
    }

    pub fn datagrams_mut(&mut self) -> &mut D {
        &mut self.datagrams
    }

    /// One driver tick: expire peers, run discovery, run messaging, then
    /// emit at most one peer-list change.
    pub fn tick(&mut self, now: Instant) {
        if self.peers.prune_expired(now, self.peer_timeout) > 0 {
            self.events.peers_changed();
        }
        self.discovery
            .tick(now, &mut self.datagrams, &mut self.peers, &mut self.events);
        self.messaging.tick(now, &mut self.peers, &mut self.events);
        self.events.flush_peer_change();
    }

    pub fn send_text(&mut self, to: IpAddr, text: &str, now: Instant) -> Result<(), SendError> {
        self.messaging.send(to, MessageType::Text, text, now)
    }

    /// Send to the peer at 1-based `index` in the active list.
    pub fn send_to_index(
        &mut self,
        index: usize,
        text: &str,
        now: Instant,
    ) -> Result<(), SendError> {
        let peer = self
            .peers
            .get_by_index(index)
            .ok_or(SendError::UnknownPeerIndex(index))?;
        self.send_text(peer.address, text, now)
    }

    /// Send `text` to every active peer. One failure does not stop the rest.
    pub fn broadcast_text(
        &mut self,
        text: &str,
        now: Instant,
    ) -> Vec<(IpAddr, Result<(), SendError>)> {
        self.active_addresses()
            .into_iter()
            .map(|addr| {
                let result = self.send_text(addr, text, now);
                if let Err(e) = &result {
                    tracing::warn!(peer = %addr, error = %e, "broadcast send failed");
                }
                (addr, result)
            })
            .collect()
    }

    /// Abort in-flight connections, then tell every active peer we are
    /// leaving. The whole round is bounded by the quit deadline: each send
    /// gets only the time still left, and peers not reached in time are
    /// skipped.
    pub fn shutdown(&mut self) -> Vec<(IpAddr, Result<(), SendError>)> {
        self.messaging.shutdown();

        let deadline = Instant::now() + self.quit_deadline;
        let targets = self.active_addresses();
        tracing::info!(peers = targets.len(), "sending quit to active peers");

        targets
            .into_iter()
            .map(|addr| {
                let now = Instant::now();
                let result = match deadline.checked_duration_since(now) {
                    Some(left) if !left.is_zero() => self.messaging.send_quit(addr, left, now),
                    _ => Err(SendError::DeadlineExceeded),
                };
                if let Err(e) = &result {
                    tracing::warn!(peer = %addr, error = %e, "quit not delivered");
                }
                (addr, result)
            })
            .collect()
    }

    fn active_addresses(&self) -> Vec<IpAddr> {
        self.peers.list_active().into_iter().map(|p| p.address).collect()
    }

    pub fn drain_events(&mut self) -> Vec<NodeEvent> {
        self.events.drain()
    }

    /// Hand pending events to the shell.
    pub fn deliver<S: ShellEvents>(&mut self, shell: &mut S) {
        for event in self.events.drain() {
            match event {
                NodeEvent::PeerListChanged => {
                    shell.on_peer_list_changed(&self.peers.list_active())
                }
                NodeEvent::TextMessage { from, name, text } => {
                    shell.on_text_message(from, &name, &text)
                }
            }
        }
    }
}
