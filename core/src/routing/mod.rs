//! Multi-hop message routing
//!
//! Messages are addressed end to end and carried hop by hop in MSG frames.
//! Each node looks up the next hop in its routing table, suppresses repeats
//! per sender, and hands messages addressed to it to the listener on the
//! message's port.

pub mod discovery;
pub mod forward;
pub mod listener;
pub mod message;
pub mod router;
pub mod table;

use crate::transport::TransportError;
use crate::NodeId;
use thiserror::Error;

pub use discovery::{DiscoveryHook, NoDiscovery};
pub use listener::{Listener, MAX_LISTENERS};
pub use message::{Message, Port, MAX_MSG_PAYLOAD, MAX_MSG_SIZE};
pub use router::{Peer, Router};
pub use table::{line_routes, RouteMatrix, RoutingTable};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouterError {
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(NodeId),
    #[error("Payload of {len} bytes exceeds maximum {max}")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("Message queue full")]
    QueueFull,
    #[error("Port {0} already has a listener")]
    DuplicatePort(Port),
    #[error("Listener table full")]
    ListenerTableFull,
    #[error("Invalid node id: {0}")]
    InvalidNodeId(NodeId),
    #[error("Malformed message of {0} bytes")]
    MalformedMessage(usize),
    #[error("Timed out")]
    Timeout,
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}
