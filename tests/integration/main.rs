//! csend integration test harness.
//!
//! Whole nodes run against the in-memory LAN in `infra`: real discovery,
//! peer tables and connection engines, with virtual sockets underneath.
//! Time is passed explicitly, so expiry and backoff need no sleeping.
//!
//!   cargo test --test integration
//!
//! Each test builds its own network; tests share no state.

use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use csend_core::wire::MESSAGING_PORT;
use csend_core::Identity;
use csend_services::{
    ConnectionMachine, ConnectionPool, DatagramTransport, MessagingEngine, Node, NodeEvent,
    NodeOptions, PeerRecord, ShellEvents, Timings,
};

mod infra;

pub use infra::*;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const ALICE: &str = "10.0.0.1";
pub const BOB: &str = "10.0.0.2";
pub const CAROL: &str = "10.0.0.3";

pub type SlotNode = Node<VDatagrams, ConnectionMachine<VStreams>>;
pub type PoolNode = Node<VDatagrams, ConnectionPool<VEndpoints>>;

pub fn ip(addr: &str) -> IpAddr {
    addr.parse().unwrap()
}

/// Where `addr` accepts chat connections.
pub fn messaging_addr(addr: &str) -> SocketAddr {
    SocketAddr::new(ip(addr), MESSAGING_PORT)
}

fn identity(addr: &str, name: &str) -> Identity {
    Identity::new(name, ip(addr)).unwrap()
}

pub fn slot_node_with(net: &VirtualNet, addr: &str, name: &str, options: NodeOptions) -> SlotNode {
    let host = net.host(addr);
    let id = identity(addr, name);
    let machine =
        ConnectionMachine::new(host.streams(), id.clone(), MESSAGING_PORT, Timings::default());
    let datagrams = host.datagrams(options.broadcast.port());
    Node::new(id, options, datagrams, machine)
}

pub fn slot_node(net: &VirtualNet, addr: &str, name: &str) -> SlotNode {
    slot_node_with(net, addr, name, NodeOptions::default())
}

pub fn pool_node(net: &VirtualNet, addr: &str, name: &str) -> PoolNode {
    let host = net.host(addr);
    let id = identity(addr, name);
    let pool =
        ConnectionPool::new(host.endpoints(), id.clone(), MESSAGING_PORT, Timings::default());
    let options = NodeOptions::default();
    let datagrams = host.datagrams(options.broadcast.port());
    Node::new(id, options, datagrams, pool)
}

/// Tick every node in order, `rounds` times, all at `now`.
pub fn run_rounds<D: DatagramTransport, M: MessagingEngine>(
    nodes: &mut [&mut Node<D, M>],
    rounds: usize,
    now: Instant,
) {
    for _ in 0..rounds {
        for node in nodes.iter_mut() {
            node.tick(now);
        }
    }
}

/// Text messages among `events`, as (sender, name, text).
pub fn texts(events: &[NodeEvent]) -> Vec<(IpAddr, String, String)> {
    events
        .iter()
        .filter_map(|e| match e {
            NodeEvent::TextMessage { from, name, text } => {
                Some((*from, name.clone(), text.clone()))
            }
            NodeEvent::PeerListChanged => None,
        })
        .collect()
}

/// Shell that remembers what it was shown.
#[derive(Default)]
pub struct Transcript {
    pub peer_lists: Vec<Vec<PeerRecord>>,
    pub messages: Vec<(IpAddr, String, String)>,
}

impl ShellEvents for Transcript {
    fn on_peer_list_changed(&mut self, active: &[PeerRecord]) {
        self.peer_lists.push(active.to_vec());
    }

    fn on_text_message(&mut self, from: IpAddr, name: &str, text: &str) {
        self.messages.push((from, name.to_string(), text.to_string()));
    }
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

mod discovery;
mod messaging;
mod pooled;
