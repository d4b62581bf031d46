//! csend wire format: the flat envelope carried by every datagram and
//! every stream connection.
//!
//! ```text
//! TYPE|name@address|payload
//! ```
//!
//! Fields are separated by a single reserved byte (`|`). There is no
//! escaping: `name` and `address` must not contain the delimiter, while the
//! payload may contain it freely since everything after the second delimiter
//! is taken verbatim. UDP and TCP use identical framing.

use std::fmt;
use std::str::FromStr;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Field delimiter byte.
pub const FIELD_DELIMITER: u8 = b'|';

/// Separator between the sender's name and address in the second field.
pub const ADDRESS_SEPARATOR: char = '@';

/// Address recorded when a sender token carries no `@address` part.
pub const UNKNOWN_ADDRESS: &str = "unknown";

/// Maximum encoded frame size in bytes, including all delimiters.
/// Oversized frames are a caller error and are never put on the wire.
pub const MAX_FRAME_SIZE: usize = 1024;

/// TCP port on which peers accept message connections.
pub const MESSAGING_PORT: u16 = 8080;

/// UDP port on which discovery broadcasts and responses travel.
pub const DISCOVERY_PORT: u16 = 8081;

/// Seconds between discovery broadcasts.
pub const DISCOVERY_INTERVAL_SECS: u64 = 10;

/// Seconds without a sighting before a peer is evicted from the table.
pub const PEER_TIMEOUT_SECS: u64 = 30;

/// Number of peer table slots.
pub const MAX_PEERS: usize = 10;

// ── Message type ──────────────────────────────────────────────────────────────

/// The four message kinds understood by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Broadcast "who is there" announcement.
    Discovery,
    /// Unicast reply to a `Discovery`. Never answered, to avoid reply storms.
    DiscoveryResponse,
    /// Chat text, carried over a stream connection.
    Text,
    /// The sender is leaving; receivers deactivate it.
    Quit,
}

impl MessageType {
    /// The on-wire token for this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Discovery => "DISCOVERY",
            MessageType::DiscoveryResponse => "DISCOVERY_RESPONSE",
            MessageType::Text => "TEXT",
            MessageType::Quit => "QUIT",
        }
    }

    /// Discovery traffic belongs on the datagram channel only.
    pub fn is_discovery(&self) -> bool {
        matches!(self, MessageType::Discovery | MessageType::DiscoveryResponse)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DISCOVERY" => Ok(MessageType::Discovery),
            "DISCOVERY_RESPONSE" => Ok(MessageType::DiscoveryResponse),
            "TEXT" => Ok(MessageType::Text),
            "QUIT" => Ok(MessageType::Quit),
            other => Err(WireError::UnknownMessageType(other.to_string())),
        }
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// A decoded wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub msg_type: MessageType,
    pub sender_name: String,
    /// Address the sender claims for itself. Attached even when the
    /// transport already knows where the frame came from.
    pub sender_address: String,
    pub payload: String,
}

impl Envelope {
    pub fn new(
        msg_type: MessageType,
        sender_name: impl Into<String>,
        sender_address: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            msg_type,
            sender_name: sender_name.into(),
            sender_address: sender_address.into(),
            payload: payload.into(),
        }
    }

    /// Encode this envelope. See [`encode`].
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        encode(
            self.msg_type,
            &self.sender_name,
            &self.sender_address,
            &self.payload,
        )
    }

    /// True when the sender token carried no address.
    pub fn has_unknown_address(&self) -> bool {
        self.sender_address == UNKNOWN_ADDRESS
    }
}

// ── Codec ─────────────────────────────────────────────────────────────────────

/// Build `TYPE|sender@address|payload`.
///
/// Fails when `sender_name` or `sender_address` contains the field
/// delimiter, when `sender_address` contains `@` (it would break the
/// last-`@` split on decode), when any field holds a NUL byte (decode
/// strips trailing NULs), or when the frame would exceed [`MAX_FRAME_SIZE`].
pub fn encode(
    msg_type: MessageType,
    sender_name: &str,
    sender_address: &str,
    payload: &str,
) -> Result<Vec<u8>, WireError> {
    let delimiter = FIELD_DELIMITER as char;
    if sender_name.contains(delimiter) {
        return Err(WireError::DelimiterInField("sender_name"));
    }
    if sender_address.contains(delimiter) {
        return Err(WireError::DelimiterInField("sender_address"));
    }
    if sender_address.contains(ADDRESS_SEPARATOR) {
        return Err(WireError::SeparatorInAddress(sender_address.to_string()));
    }
    for (field, value) in [
        ("sender_name", sender_name),
        ("sender_address", sender_address),
        ("payload", payload),
    ] {
        if value.contains('\0') {
            return Err(WireError::NulInField(field));
        }
    }

    let type_token = msg_type.as_str();
    let len =
        type_token.len() + 1 + sender_name.len() + 1 + sender_address.len() + 1 + payload.len();
    if len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge(len));
    }

    let mut frame = Vec::with_capacity(len);
    frame.extend_from_slice(type_token.as_bytes());
    frame.push(FIELD_DELIMITER);
    frame.extend_from_slice(sender_name.as_bytes());
    frame.push(ADDRESS_SEPARATOR as u8);
    frame.extend_from_slice(sender_address.as_bytes());
    frame.push(FIELD_DELIMITER);
    frame.extend_from_slice(payload.as_bytes());
    Ok(frame)
}

/// Parse a received frame.
///
/// Only the first two delimiters split fields; the payload keeps any further
/// delimiters. A sender token without `@` is accepted with
/// [`UNKNOWN_ADDRESS`]. Trailing NUL bytes (C peers send their terminator)
/// are ignored. Non-UTF-8 bytes are replaced rather than rejected.
pub fn decode(bytes: &[u8]) -> Result<Envelope, WireError> {
    let end = bytes
        .iter()
        .rposition(|&b| b != 0)
        .map(|i| i + 1)
        .unwrap_or(0);
    let bytes = &bytes[..end];

    let mut fields = bytes.splitn(3, |&b| b == FIELD_DELIMITER);
    let type_field = fields.next().unwrap_or_default();
    let (sender_field, payload_field) = match (fields.next(), fields.next()) {
        (Some(sender), Some(payload)) => (sender, payload),
        _ => return Err(WireError::MissingDelimiter),
    };

    let msg_type: MessageType = String::from_utf8_lossy(type_field).parse()?;
    let sender = String::from_utf8_lossy(sender_field);
    let (sender_name, sender_address) = match sender.rsplit_once(ADDRESS_SEPARATOR) {
        Some((name, address)) => (name.to_string(), address.to_string()),
        None => (sender.into_owned(), UNKNOWN_ADDRESS.to_string()),
    };

    Ok(Envelope {
        msg_type,
        sender_name,
        sender_address,
        payload: String::from_utf8_lossy(payload_field).into_owned(),
    })
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors raised while encoding or decoding frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame has fewer than two '|' delimiters")]
    MissingDelimiter,

    #[error("unknown message type: {0:?}")]
    UnknownMessageType(String),

    #[error("{0} contains the field delimiter '|'")]
    DelimiterInField(&'static str),

    #[error("sender address {0:?} contains '@'")]
    SeparatorInAddress(String),

    #[error("{0} contains a NUL byte")]
    NulInField(&'static str),

    #[error("encoded frame of {0} bytes exceeds maximum {}", MAX_FRAME_SIZE)]
    FrameTooLarge(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
