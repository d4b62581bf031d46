//! csend-core — wire format, identity, and configuration.
//! All other csend crates depend on this one.

pub mod config;
pub mod identity;
pub mod wire;

pub use config::{ConfigError, CsendConfig, Scheduler};
pub use identity::Identity;
pub use wire::{decode, encode, Envelope, MessageType, WireError};
