//! csend-services — the protocol engines: peer table, discovery, and the
//! connection machines, all written against the driver traits in
//! [`transport`].

pub mod connection;
pub mod discovery;
pub mod events;
pub mod messaging;
pub mod node;
pub mod peer;
pub mod pool;
pub mod timing;
pub mod transport;

pub use connection::{ConnectionMachine, Role};
pub use discovery::{DiscoveryEngine, PacketOutcome};
pub use events::{EventQueue, NodeEvent, ShellEvents};
pub use messaging::{dispatch_frame, Dispatch, MessagingEngine, SendError};
pub use node::{Node, NodeOptions};
pub use peer::{PeerRecord, PeerTable, PeerTableError, SharedPeerTable, Upsert};
pub use pool::{ConnectionPool, SlotState};
pub use timing::Timings;
pub use transport::{
    Accept, Datagram, DatagramTransport, EndpointDriver, EndpointStatus, ErrorClass, Receive,
    StreamTransport, TransportError,
};
