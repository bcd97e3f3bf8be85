//! Packet transport
//!
//! Owns the outbound slot queue, the ACK expectation and the neighbor table.
//! Two tasks drive it: `run_tx` works through the slot queue one head at a
//! time, `run_rx` admits received buffers and hands accepted frames to the
//! inbound queue read by the router.

use super::frame::{Frame, FrameType, HDR_DEST, HDR_SRC, HEADER_LEN};
use super::neighbor::Neighbor;
use super::{TransportError, TxFlags, TxHandle};
use crate::config::StackConfig;
use crate::nodelist::NodeList;
use crate::queue::{ring, Consumer, Producer};
use crate::radio::{Radio, RadioError, RxBuffer};
use crate::{NodeId, BROADCAST_NODE_ID, MAX_NEIGHBORS, MAX_PKT_SEND_ATTEMPTS};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};

/// Lifecycle of an outbound slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    None,
    Sent,
    Failed,
    Ok,
    Reaped,
}

impl SlotState {
    fn is_complete(self) -> bool {
        matches!(self, SlotState::Ok | SlotState::Failed)
    }
}

struct TxSlot {
    frame: Frame,
    flags: TxFlags,
    state: SlotState,
}

struct TxQueue {
    slots: VecDeque<TxSlot>,
    seq: u8,
}

impl TxQueue {
    fn next_seq(&mut self) -> u8 {
        self.seq = self.seq.wrapping_add(1);
        if self.seq == 0 {
            self.seq = 1;
        }
        self.seq
    }

    fn head_mut(&mut self, handle: u8) -> Option<&mut TxSlot> {
        self.slots.front_mut().filter(|slot| slot.frame.seq == handle)
    }
}

/// The single outstanding ACK expectation of the tx task
#[derive(Default)]
struct AckState {
    armed: bool,
    acked: bool,
    dest: NodeId,
    seq: u8,
}

pub struct Transport {
    node_id: NodeId,
    config: StackConfig,
    radio: Arc<dyn Radio>,
    tx_queue: Mutex<TxQueue>,
    ack: Mutex<AckState>,
    topology_mask: AtomicU32,
    neighbors: Mutex<NodeList<Neighbor>>,
    inbound_tx: Producer<Frame>,
    inbound_rx: Consumer<Frame>,
    tx_signal: Notify,
    ack_signal: Notify,
    tx_reaped: Notify,
    tx_done: Notify,
    pkt_received: Notify,
}

impl Transport {
    pub fn new(config: &StackConfig, radio: Arc<dyn Radio>) -> Self {
        let (inbound_tx, inbound_rx) = ring(config.rcv_queue_size);
        Self {
            node_id: config.node_id,
            config: config.clone(),
            radio,
            tx_queue: Mutex::new(TxQueue {
                slots: VecDeque::with_capacity(config.tx_queue_size),
                seq: rand::thread_rng().gen(),
            }),
            ack: Mutex::new(AckState::default()),
            topology_mask: AtomicU32::new(config.topology_mask),
            neighbors: Mutex::new(NodeList::new("neighbors", MAX_NEIGHBORS)),
            inbound_tx,
            inbound_rx,
            tx_signal: Notify::new(),
            ack_signal: Notify::new(),
            tx_reaped: Notify::new(),
            tx_done: Notify::new(),
            pkt_received: Notify::new(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    // ========================================================================
    // SUBMIT / REAP
    // ========================================================================

    /// Queue a frame for transmission and return its handle
    pub fn send(&self, mut frame: Frame, flags: TxFlags) -> Result<TxHandle, TransportError> {
        if frame.dest == self.node_id {
            warn!(node = self.node_id, "refusing frame addressed to self");
            return Err(TransportError::InvalidDestination(frame.dest));
        }

        let seq = {
            let mut queue = self.tx_queue.lock();
            if queue.slots.len() >= self.config.tx_queue_size {
                debug!(node = self.node_id, "tx queue full");
                return Err(TransportError::QueueFull);
            }
            let seq = queue.next_seq();
            frame.seq = seq;
            debug!(
                node = self.node_id,
                "queued {:?} seq {} for {}", frame.frame_type, seq, frame.dest
            );
            queue.slots.push_back(TxSlot {
                frame,
                flags,
                state: SlotState::None,
            });
            seq
        };

        self.tx_signal.notify_one();
        Ok(TxHandle(seq))
    }

    /// True when `handle` is at the queue head and its transmission finished
    pub fn is_done(&self, handle: TxHandle) -> bool {
        let queue = self.tx_queue.lock();
        match queue.slots.front() {
            None => {
                error!(node = self.node_id, "is_done({}) on empty tx queue", handle);
                false
            }
            Some(slot) => slot.frame.seq == handle.0 && slot.state.is_complete(),
        }
    }

    /// Release a completed slot; returns whether the frame was delivered
    ///
    /// Only the queue head can be reaped, only once, and only after
    /// `is_done` reported it complete.
    pub fn reap(&self, handle: TxHandle) -> Result<bool, TransportError> {
        let result = {
            let mut queue = self.tx_queue.lock();
            if queue.slots.is_empty() {
                Err("tx queue empty")
            } else {
                match queue.head_mut(handle.0) {
                    None => Err("not at queue head"),
                    Some(slot) if !slot.state.is_complete() => Err("transmission not complete"),
                    Some(slot) => {
                        let ok = slot.state == SlotState::Ok;
                        slot.state = SlotState::Reaped;
                        Ok(ok)
                    }
                }
            }
        };

        match result {
            Ok(ok) => {
                debug!(node = self.node_id, "reaped {} ok={}", handle, ok);
                self.tx_reaped.notify_one();
                Ok(ok)
            }
            Err(reason) => {
                error!(node = self.node_id, "reap({}) violation: {}", handle, reason);
                Err(TransportError::ReapViolation {
                    handle: handle.0,
                    reason,
                })
            }
        }
    }

    /// Wait for a NOTIFY submission to finish and reap it
    ///
    /// For callers driving the transport directly. The router runs its own
    /// reap sweep instead.
    pub async fn completion(&self, handle: TxHandle) -> Result<bool, TransportError> {
        loop {
            match self.slot_state(handle) {
                None => {
                    return Err(TransportError::ReapViolation {
                        handle: handle.0,
                        reason: "unknown handle",
                    })
                }
                Some(_) if self.is_done(handle) => return self.reap(handle),
                Some(_) => self.tx_done.notified().await,
            }
        }
    }

    pub fn slot_state(&self, handle: TxHandle) -> Option<SlotState> {
        self.tx_queue
            .lock()
            .slots
            .iter()
            .find(|slot| slot.frame.seq == handle.0)
            .map(|slot| slot.state)
    }

    pub fn pending(&self) -> usize {
        self.tx_queue.lock().slots.len()
    }

    /// Raised when a NOTIFY slot completes
    pub fn tx_done(&self) -> &Notify {
        &self.tx_done
    }

    // ========================================================================
    // RECEIVE QUEUE
    // ========================================================================

    /// Next accepted inbound frame, if any
    pub fn receive(&self) -> Option<Frame> {
        self.inbound_rx.pop()
    }

    /// Raised when a frame lands in the inbound queue
    pub fn pkt_received(&self) -> &Notify {
        &self.pkt_received
    }

    // ========================================================================
    // TX TASK
    // ========================================================================

    /// Transmit direct, bypassing the slot queue (used for ACKs)
    pub async fn tx_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        let wire = frame.to_wire(self.node_id);
        trace!(node = self.node_id, "tx {}", hex::encode(&wire));
        self.radio.transmit(&wire).await?;
        Ok(())
    }

    pub async fn run_tx(&self) {
        info!(node = self.node_id, "transport tx task started");
        loop {
            let Some((frame, flags)) = self.start_head() else {
                self.tx_signal.notified().await;
                continue;
            };

            let delivered = self.transmit_with_retry(&frame).await;
            let state = if delivered {
                SlotState::Ok
            } else {
                SlotState::Failed
            };
            self.set_head_state(frame.seq, state);
            debug!(
                node = self.node_id,
                "seq {} to {} finished: {:?}", frame.seq, frame.dest, state
            );

            if flags.contains(TxFlags::NOTIFY) {
                self.tx_done.notify_one();
                while !self.head_reaped(frame.seq) {
                    self.tx_reaped.notified().await;
                }
            }
            self.tx_queue.lock().slots.pop_front();
        }
    }

    fn start_head(&self) -> Option<(Frame, TxFlags)> {
        let mut queue = self.tx_queue.lock();
        let slot = queue.slots.front_mut()?;
        if slot.state != SlotState::None {
            return None;
        }
        slot.state = SlotState::Sent;
        Some((slot.frame.clone(), slot.flags))
    }

    fn set_head_state(&self, seq: u8, state: SlotState) {
        if let Some(slot) = self.tx_queue.lock().head_mut(seq) {
            slot.state = state;
        }
    }

    fn head_reaped(&self, seq: u8) -> bool {
        self.tx_queue
            .lock()
            .head_mut(seq)
            .map_or(true, |slot| slot.state == SlotState::Reaped)
    }

    async fn transmit_with_retry(&self, frame: &Frame) -> bool {
        if !self.reachable(frame.dest) {
            debug!(
                node = self.node_id,
                "{} masked unreachable, discarding seq {}", frame.dest, frame.seq
            );
            return true;
        }

        let broadcast = frame.dest == BROADCAST_NODE_ID;
        let wire = frame.to_wire(self.node_id);

        for attempt in 1..=MAX_PKT_SEND_ATTEMPTS {
            if !broadcast {
                self.arm_ack(frame.dest, frame.seq);
            }
            trace!(node = self.node_id, "tx {}", hex::encode(&wire));
            if let Err(e) = self.radio.transmit(&wire).await {
                warn!(
                    node = self.node_id,
                    "radio transmit failed on attempt {}: {}", attempt, e
                );
                continue;
            }
            if broadcast {
                return true;
            }

            let deadline = Instant::now() + self.config.pkt_ack_timeout();
            if self.wait_ack(deadline).await {
                self.disarm_ack();
                return true;
            }
            debug!(
                node = self.node_id,
                "no ack from {} for seq {} (attempt {}/{})",
                frame.dest,
                frame.seq,
                attempt,
                MAX_PKT_SEND_ATTEMPTS
            );
        }

        self.disarm_ack();
        warn!(
            node = self.node_id,
            "seq {} to {} failed after {} attempts", frame.seq, frame.dest, MAX_PKT_SEND_ATTEMPTS
        );
        false
    }

    fn arm_ack(&self, dest: NodeId, seq: u8) {
        *self.ack.lock() = AckState {
            armed: true,
            acked: false,
            dest,
            seq,
        };
    }

    fn disarm_ack(&self) {
        self.ack.lock().armed = false;
    }

    fn acked(&self) -> bool {
        let ack = self.ack.lock();
        ack.armed && ack.acked
    }

    async fn wait_ack(&self, deadline: Instant) -> bool {
        loop {
            if self.acked() {
                return true;
            }
            tokio::select! {
                _ = self.ack_signal.notified() => {}
                _ = sleep_until(deadline) => return self.acked(),
            }
        }
    }

    // ========================================================================
    // RX TASK
    // ========================================================================

    pub async fn run_rx(&self) {
        info!(node = self.node_id, "transport rx task started");
        loop {
            match self.radio.receive().await {
                Ok(buf) => self.handle_rx(buf).await,
                Err(RadioError::Closed) => {
                    warn!(node = self.node_id, "radio closed, rx task exiting");
                    return;
                }
                Err(e) => warn!(node = self.node_id, "radio receive error: {}", e),
            }
        }
    }

    async fn handle_rx(&self, buf: RxBuffer) {
        let RxBuffer { data, rssi } = buf;

        if rssi < self.config.rssi_threshold {
            trace!(node = self.node_id, "dropping frame at rssi {}", rssi);
            return;
        }
        if data.len() < HEADER_LEN {
            debug!(node = self.node_id, "dropping runt frame of {} bytes", data.len());
            return;
        }
        let src = data[HDR_SRC];
        if !self.reachable(src) {
            trace!(node = self.node_id, "dropping frame from masked node {}", src);
            return;
        }
        let dest = data[HDR_DEST];
        if dest != self.node_id && dest != BROADCAST_NODE_ID {
            return;
        }

        let frame = match Frame::from_bytes(&data, rssi) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(node = self.node_id, "undecodable frame from {}: {}", src, e);
                return;
            }
        };
        trace!(node = self.node_id, "rx {}", hex::encode(&data));

        if frame.frame_type == FrameType::Ack {
            self.handle_ack(&frame);
            return;
        }

        if frame.dest == self.node_id {
            if let Err(e) = self.tx_frame(&Frame::ack(frame.src, frame.seq)).await {
                warn!(node = self.node_id, "failed to ack seq {} from {}: {}", frame.seq, src, e);
            }
        }

        let last_seq = {
            let avg_count = self.config.rssi_avg_count;
            let mut neighbors = self.neighbors.lock();
            neighbors
                .find_or_insert_with(src, || Neighbor::new(src))
                .update(frame.seq, rssi, avg_count)
        };
        if last_seq == frame.seq {
            debug!(node = self.node_id, "duplicate seq {} from {}", frame.seq, src);
            return;
        }

        debug!(
            node = self.node_id,
            "received {:?} seq {} from {}", frame.frame_type, frame.seq, src
        );
        if self.inbound_tx.push(frame).is_err() {
            warn!(node = self.node_id, "receive queue full, dropping frame from {}", src);
            return;
        }
        self.pkt_received.notify_one();
    }

    fn handle_ack(&self, frame: &Frame) {
        let matched = {
            let mut ack = self.ack.lock();
            let matched = ack.armed && !ack.acked && ack.dest == frame.src && ack.seq == frame.seq;
            if matched {
                ack.acked = true;
            }
            matched
        };
        if matched {
            trace!(node = self.node_id, "ack for seq {} from {}", frame.seq, frame.src);
            self.ack_signal.notify_one();
        } else {
            warn!(
                node = self.node_id,
                "unexpected ack seq {} from {}", frame.seq, frame.src
            );
        }
    }

    // ========================================================================
    // NEIGHBORS & TOPOLOGY
    // ========================================================================

    pub fn neighbors(&self) -> Vec<Neighbor> {
        self.neighbors.lock().iter().cloned().collect()
    }

    pub fn neighbor_ids(&self) -> Vec<NodeId> {
        self.neighbors.lock().ids().collect()
    }

    pub fn neighbor(&self, id: NodeId) -> Option<Neighbor> {
        self.neighbors.lock().find(id).cloned()
    }

    pub fn add_neighbor(&self, id: NodeId) {
        self.neighbors
            .lock()
            .find_or_insert_with(id, || Neighbor::new(id));
    }

    pub fn clear_neighbors(&self) {
        self.neighbors.lock().clear();
    }

    /// Ids outside the mask width (broadcast included) are always reachable
    pub fn reachable(&self, id: NodeId) -> bool {
        if id as u32 >= u32::BITS {
            return true;
        }
        self.topology_mask.load(Ordering::Relaxed) & (1 << id) == 0
    }

    pub fn set_reachable(&self, id: NodeId, reachable: bool) {
        if id as u32 >= u32::BITS {
            return;
        }
        if reachable {
            self.topology_mask.fetch_and(!(1 << id), Ordering::Relaxed);
        } else {
            self.topology_mask.fetch_or(1 << id, Ordering::Relaxed);
        }
    }

    pub fn set_all_reachable(&self, reachable: bool) {
        let mask = if reachable { 0 } else { u32::MAX };
        self.topology_mask.store(mask, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::SimMedium;

    fn transport(medium: &SimMedium, id: NodeId) -> Transport {
        Transport::new(&StackConfig::for_node(id), Arc::new(medium.attach(id)))
    }

    #[test]
    fn test_send_rejects_self_destination() {
        let medium = SimMedium::new();
        let t = transport(&medium, 1);
        let err = t.send(Frame::new(FrameType::Msg, 1), TxFlags::NONE).unwrap_err();
        assert_eq!(err, TransportError::InvalidDestination(1));
    }

    #[test]
    fn test_send_assigns_nonzero_unique_seqs() {
        let medium = SimMedium::new();
        let t = transport(&medium, 1);
        let mut seen = Vec::new();
        for _ in 0..6 {
            let h = t.send(Frame::new(FrameType::Msg, 2), TxFlags::NONE).unwrap();
            assert_ne!(h.seq(), 0);
            assert!(!seen.contains(&h.seq()));
            seen.push(h.seq());
        }
        assert_eq!(
            t.send(Frame::new(FrameType::Msg, 2), TxFlags::NONE),
            Err(TransportError::QueueFull)
        );
    }

    #[test]
    fn test_seq_skips_zero_on_wrap() {
        let mut queue = TxQueue {
            slots: VecDeque::new(),
            seq: 0xfe,
        };
        assert_eq!(queue.next_seq(), 0xff);
        assert_eq!(queue.next_seq(), 1);
    }

    #[test]
    fn test_reap_discipline() {
        let medium = SimMedium::new();
        let t = transport(&medium, 1);

        let ghost = TxHandle(9);
        assert!(!t.is_done(ghost));
        assert!(matches!(t.reap(ghost), Err(TransportError::ReapViolation { .. })));

        let h = t.send(Frame::new(FrameType::Msg, 2), TxFlags::NOTIFY).unwrap();
        assert!(!t.is_done(h));
        // still queued, not transmitted
        assert_eq!(
            t.reap(h),
            Err(TransportError::ReapViolation {
                handle: h.seq(),
                reason: "transmission not complete"
            })
        );
    }

    #[test]
    fn test_topology_mask() {
        let medium = SimMedium::new();
        let t = transport(&medium, 1);
        assert!(t.reachable(3));
        t.set_reachable(3, false);
        assert!(!t.reachable(3));
        assert!(t.reachable(BROADCAST_NODE_ID));
        t.set_all_reachable(false);
        assert!(!t.reachable(2));
        assert!(t.reachable(BROADCAST_NODE_ID));
        t.set_all_reachable(true);
        assert!(t.reachable(3));
    }

    #[test]
    fn test_neighbor_table() {
        let medium = SimMedium::new();
        let t = transport(&medium, 1);
        t.add_neighbor(2);
        t.add_neighbor(2);
        t.add_neighbor(3);
        assert_eq!(t.neighbors().len(), 2);
        assert!(t.neighbor(3).is_some());
        t.clear_neighbors();
        assert!(t.neighbor_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_completes_without_ack() {
        let medium = SimMedium::new();
        let t = Arc::new(transport(&medium, 1));
        let listener = medium.attach(2);

        let runner = Arc::clone(&t);
        let task = tokio::spawn(async move { runner.run_tx().await });

        let h = t
            .send(Frame::new(FrameType::Routes, BROADCAST_NODE_ID), TxFlags::NOTIFY)
            .unwrap();
        assert_eq!(t.completion(h).await, Ok(true));

        let heard = listener.receive().await.unwrap();
        let frame = Frame::from_bytes(&heard.data, heard.rssi).unwrap();
        assert_eq!(frame.src, 1);
        assert_eq!(frame.dest, BROADCAST_NODE_ID);
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_unicast_fails_after_attempts() {
        let medium = SimMedium::new();
        let t = Arc::new(transport(&medium, 1));
        let silent = medium.attach(2);

        let runner = Arc::clone(&t);
        let task = tokio::spawn(async move { runner.run_tx().await });

        let h = t.send(Frame::new(FrameType::Msg, 2), TxFlags::NOTIFY).unwrap();
        assert_eq!(t.completion(h).await, Ok(false));

        let mut transmissions = 0;
        while silent.try_receive().is_some() {
            transmissions += 1;
        }
        assert_eq!(transmissions, MAX_PKT_SEND_ATTEMPTS as usize);
        while t.pending() > 0 {
            tokio::task::yield_now().await;
        }
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_masked_destination_discarded_as_sent() {
        let medium = SimMedium::new();
        let t = Arc::new(transport(&medium, 1));
        let peer = medium.attach(2);
        t.set_reachable(2, false);

        let runner = Arc::clone(&t);
        let task = tokio::spawn(async move { runner.run_tx().await });

        let h = t.send(Frame::new(FrameType::Msg, 2), TxFlags::NOTIFY).unwrap();
        assert_eq!(t.completion(h).await, Ok(true));
        assert!(peer.try_receive().is_none());
        task.abort();
    }
}
