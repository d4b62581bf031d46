//! Local node identity: the name and address stamped on every outgoing frame.

use std::net::IpAddr;

use crate::wire::{self, MessageType, WireError, FIELD_DELIMITER};

/// Who this node claims to be on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    pub address: IpAddr,
}

impl Identity {
    /// Fails when the username cannot be carried in the sender field.
    pub fn new(username: impl Into<String>, address: IpAddr) -> Result<Self, WireError> {
        let username = username.into();
        if username.contains(FIELD_DELIMITER as char) {
            return Err(WireError::DelimiterInField("sender_name"));
        }
        if username.contains('\0') {
            return Err(WireError::NulInField("sender_name"));
        }
        Ok(Self { username, address })
    }

    /// Encode a frame sent by this node.
    pub fn frame(&self, msg_type: MessageType, payload: &str) -> Result<Vec<u8>, WireError> {
        wire::encode(msg_type, &self.username, &self.address.to_string(), payload)
    }
}
