// Meshfence Core: sensor node network stack
//
// Three layers over a lossy broadcast radio:
//   transport  one-hop frames, ACK with bounded retry, neighbor table
//   routing    addressed messages, next-hop forwarding, port listeners
//   rpc        request/reply calls layered on routed messages
//   mping      message ping reporting link RSSI both ways

pub mod config;
pub mod mping;
pub mod node;
pub mod nodelist;
pub mod queue;
pub mod radio;
pub mod routing;
pub mod rpc;
pub mod transport;

use thiserror::Error;

pub use config::{ConfigError, StackConfig};
pub use mping::{MessagePing, MpingError, Pong};
pub use node::Node;
pub use radio::{Radio, RadioError, RxBuffer, SimMedium, SimRadio};
pub use routing::{DiscoveryHook, Listener, Message, Port, Router, RouterError, RoutingTable};
pub use rpc::{Procedure, ProcedureTable, RpcClient, RpcEndpoint, RpcError, RpcServer};
pub use transport::{Frame, FrameType, Transport, TransportError, TxFlags, TxHandle};

// ============================================================================
// NODE IDENTIFIERS
// ============================================================================

/// One-byte node address as carried in every frame header
pub type NodeId = u8;

/// Number of addressable nodes; valid ids are `1..MAX_NODES`
pub const MAX_NODES: usize = 6;

/// Destination that every node accepts
pub const BROADCAST_NODE_ID: NodeId = 0xff;

/// Reserved id meaning "no node" (empty route, unset field)
pub const INVALID_NODE_ID: NodeId = 0;

pub const MAX_NEIGHBORS: usize = MAX_NODES;
pub const MAX_PEERS: usize = MAX_NODES;

/// Maximum number of forwarders recorded in a frame path
pub const MAX_PATH_LEN: usize = 6;

/// Attempts the transport makes for one unicast frame
pub const MAX_PKT_SEND_ATTEMPTS: u8 = 3;

/// Attempts the router makes for one message
pub const MAX_MSG_SEND_ATTEMPTS: u8 = 3;

/// True for ids that name a real node (not broadcast, not invalid)
pub fn is_valid_node_id(id: NodeId) -> bool {
    id != INVALID_NODE_ID && (id as usize) < MAX_NODES
}

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StackError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Router error: {0}")]
    Router(#[from] RouterError),
}

// ============================================================================
// LOGGING
// ============================================================================

/// Install a formatting subscriber filtered by `RUST_LOG` (idempotent)
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}
