//! Outbound message pool
//!
//! Every message the router transmits, local or forwarded, occupies one entry
//! until it is delivered to the next hop or runs out of attempts.

use crate::transport::{Frame, TxHandle};
use crate::{NodeId, INVALID_NODE_ID};
use rand::Rng;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardState {
    Free,
    Alloced,
    Ready,
    Sent,
}

#[derive(Debug, Clone)]
pub struct ForwardEntry {
    pub state: ForwardState,
    pub frame: Frame,
    pub sender: NodeId,
    pub recipient: NodeId,
    pub seq: u8,
    pub attempt: u8,
    pub next_attempt: Instant,
    /// `None` while the transport has not accepted the frame
    pub tx_handle: Option<TxHandle>,
    pub next_hop: NodeId,
}

impl ForwardEntry {
    fn free() -> Self {
        Self {
            state: ForwardState::Free,
            frame: Frame::default(),
            sender: INVALID_NODE_ID,
            recipient: INVALID_NODE_ID,
            seq: 0,
            attempt: 0,
            next_attempt: Instant::now(),
            tx_handle: None,
            next_hop: INVALID_NODE_ID,
        }
    }
}

pub struct ForwardPool {
    entries: Vec<ForwardEntry>,
    msg_seq: u8,
}

impl ForwardPool {
    pub fn new(size: usize) -> Self {
        Self {
            entries: (0..size).map(|_| ForwardEntry::free()).collect(),
            msg_seq: rand::thread_rng().gen(),
        }
    }

    /// Sequence for the next locally originated message; never zero
    pub fn next_seq(&mut self) -> u8 {
        self.msg_seq = self.msg_seq.wrapping_add(1);
        if self.msg_seq == 0 {
            self.msg_seq = 1;
        }
        self.msg_seq
    }

    /// Claim a free entry
    pub fn alloc(&mut self) -> Option<usize> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.state == ForwardState::Free)?;
        let entry = &mut self.entries[idx];
        *entry = ForwardEntry::free();
        entry.state = ForwardState::Alloced;
        Some(idx)
    }

    pub fn release(&mut self, idx: usize) {
        if let Some(entry) = self.entries.get_mut(idx) {
            *entry = ForwardEntry::free();
        }
    }

    pub fn get(&self, idx: usize) -> Option<&ForwardEntry> {
        self.entries.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut ForwardEntry> {
        self.entries.get_mut(idx)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn in_use(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state != ForwardState::Free)
            .count()
    }
}
