//! Events raised by the protocol engines for the application shell.

use std::collections::VecDeque;
use std::net::IpAddr;

use crate::peer::PeerRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// The set of active peers changed since the last flush.
    PeerListChanged,
    TextMessage {
        from: IpAddr,
        name: String,
        text: String,
    },
}

/// Shell callbacks. Implemented by whatever renders the chat.
pub trait ShellEvents {
    fn on_peer_list_changed(&mut self, active: &[PeerRecord]);
    fn on_text_message(&mut self, from: IpAddr, name: &str, text: &str);
}

/// Pending events. Peer-set changes are coalesced into one event per flush.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: VecDeque<NodeEvent>,
    peers_changed: bool,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note that the peer set changed. Emitted on the next flush.
    pub fn peers_changed(&mut self) {
        self.peers_changed = true;
    }

    pub fn push_text(&mut self, from: IpAddr, name: impl Into<String>, text: impl Into<String>) {
        self.events.push_back(NodeEvent::TextMessage {
            from,
            name: name.into(),
            text: text.into(),
        });
    }

    /// Turn a pending peer-set change into a single event.
    pub fn flush_peer_change(&mut self) {
        if std::mem::take(&mut self.peers_changed) {
            self.events.push_back(NodeEvent::PeerListChanged);
        }
    }

    pub fn drain(&mut self) -> Vec<NodeEvent> {
        self.events.drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && !self.peers_changed
    }
}
