//! Stream-side message handling shared by every connection model.
//!
//! [`dispatch_frame`] applies one received frame to the peer table and the
//! event queue. [`MessagingEngine`] is the seam between the node and its
//! connection machine.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use csend_core::wire::{self, MessageType, WireError};

use crate::events::EventQueue;
use crate::peer::{PeerTable, Upsert};
use crate::transport::TransportError;

/// What the reader should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Continue,
    /// The peer said goodbye. Close the connection.
    Quit,
}

/// Decode and act on one frame received from `from`.
///
/// `Text` upserts the sender, keyed on the transport address, and raises a
/// message event. `Quit` only deactivates the sender; a goodbye from a
/// peer we never knew changes nothing. Discovery types have no business on
/// a stream and are ignored after the sender is upserted. Malformed frames
/// are logged and dropped.
pub fn dispatch_frame(
    bytes: &[u8],
    from: IpAddr,
    now: Instant,
    peers: &mut PeerTable,
    events: &mut EventQueue,
) -> Dispatch {
    let envelope = match wire::decode(bytes) {
        Ok(env) => env,
        Err(e) => {
            tracing::warn!(peer = %from, error = %e, "discarding malformed frame");
            return Dispatch::Continue;
        }
    };

    if envelope.msg_type == MessageType::Quit {
        tracing::info!(peer = %from, name = %envelope.sender_name, "peer quit");
        if peers.deactivate(from) {
            events.peers_changed();
        }
        return Dispatch::Quit;
    }

    match peers.upsert(from, &envelope.sender_name, now) {
        Ok(Upsert::Added) => events.peers_changed(),
        Ok(Upsert::Updated) => {}
        Err(e) => tracing::warn!(peer = %from, error = %e, "sender not recorded"),
    }

    if envelope.msg_type == MessageType::Text {
        tracing::debug!(
            peer = %from,
            name = %envelope.sender_name,
            bytes = envelope.payload.len(),
            "text received"
        );
        events.push_text(from, envelope.sender_name, envelope.payload);
    } else {
        tracing::debug!(
            peer = %from,
            msg_type = %envelope.msg_type,
            "discovery frame on stream ignored"
        );
    }
    Dispatch::Continue
}

// ── Sending ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The connection slot is carrying an inbound session.
    #[error("connection busy with an inbound session")]
    Busy,
    #[error("no active peer at index {0}")]
    UnknownPeerIndex(usize),
    #[error("could not encode message: {0}")]
    Encode(#[from] WireError),
    #[error("connect failed: {0}")]
    Connect(TransportError),
    #[error("write failed: {0}")]
    Write(TransportError),
    #[error("quit deadline passed before this peer was reached")]
    DeadlineExceeded,
}

/// A connection model that moves stream traffic.
pub trait MessagingEngine {
    /// Advance inbound handling. Never blocks.
    fn tick(&mut self, now: Instant, peers: &mut PeerTable, events: &mut EventQueue);

    /// Deliver one message to `to`. Connect and write are bounded by the
    /// engine's timeouts.
    fn send(
        &mut self,
        to: IpAddr,
        msg_type: MessageType,
        payload: &str,
        now: Instant,
    ) -> Result<(), SendError>;

    /// Deliver a `Quit` to `to`, spending at most `budget` on connect and
    /// write together.
    fn send_quit(&mut self, to: IpAddr, budget: Duration, now: Instant) -> Result<(), SendError>;

    /// Abort in-flight operations and stop listening. Sends still work.
    fn shutdown(&mut self);
}
