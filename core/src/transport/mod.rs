// Transport module: reliable one-hop frames over the radio

pub mod frame;
pub mod manager;
pub mod neighbor;

use crate::radio::RadioError;
use crate::NodeId;
use thiserror::Error;

pub use frame::{Frame, FrameError, FrameType, HEADER_LEN, MAX_FRAME_LEN, MAX_FRAME_PAYLOAD};
pub use manager::{SlotState, Transport};
pub use neighbor::Neighbor;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Invalid destination: {0}")]
    InvalidDestination(NodeId),
    #[error("Transmit queue full")]
    QueueFull,
    #[error("Reap violation for handle {handle}: {reason}")]
    ReapViolation { handle: u8, reason: &'static str },
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Radio error: {0}")]
    Radio(#[from] RadioError),
}

/// Submission options for `Transport::send`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxFlags(u8);

impl TxFlags {
    /// Fire and forget: the slot is dequeued as soon as transmission ends
    pub const NONE: TxFlags = TxFlags(0);
    /// Signal completion and hold the slot until the owner reaps it
    pub const NOTIFY: TxFlags = TxFlags(1);

    pub fn contains(self, other: TxFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Handle to a submitted frame; carries the frame's transport seq
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxHandle(pub(crate) u8);

impl TxHandle {
    pub fn seq(&self) -> u8 {
        self.0
    }
}

impl std::fmt::Display for TxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}
