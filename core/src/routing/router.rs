//! Router task and message API
//!
//! The router owns the outbound message pool, the routing table, the peer
//! table used for duplicate suppression and the listener table. `run` is the
//! router task: it reaps finished transmissions, submits ready messages to
//! the transport, dispatches inbound frames, then sleeps until something
//! changes.

use super::discovery::{DiscoveryHook, NoDiscovery};
use super::forward::{ForwardPool, ForwardState};
use super::listener::{Delivery, Listener, ListenerTable};
use super::message::{Message, Port};
use super::table::{decode_routes, encode_routes, RouteMatrix, RoutingTable};
use super::RouterError;
use crate::config::StackConfig;
use crate::nodelist::{NodeEntry, NodeList};
use crate::transport::{Frame, FrameType, Transport, TransportError, TxFlags};
use crate::{
    is_valid_node_id, NodeId, BROADCAST_NODE_ID, MAX_MSG_SEND_ATTEMPTS, MAX_PATH_LEN, MAX_PEERS,
};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Last message sequence accepted from a sender
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: NodeId,
    pub seq: u8,
}

impl NodeEntry for Peer {
    fn id(&self) -> NodeId {
        self.id
    }
}

#[derive(Default)]
struct PingState {
    expected: Option<u8>,
    answered: bool,
}

struct PendingPong {
    due: Instant,
    dest: NodeId,
    token: u8,
}

pub struct Router {
    node_id: NodeId,
    config: StackConfig,
    transport: Arc<Transport>,
    routes: Mutex<RoutingTable>,
    peers: Mutex<NodeList<Peer>>,
    pool: Mutex<ForwardPool>,
    listeners: Mutex<ListenerTable>,
    discovery: Arc<dyn DiscoveryHook>,
    tx_msg: Notify,
    ping: Mutex<PingState>,
    pong_signal: Notify,
    pending_pongs: Mutex<Vec<PendingPong>>,
}

impl Router {
    pub fn new(config: &StackConfig, transport: Arc<Transport>) -> Self {
        Self::with_discovery(config, transport, Arc::new(NoDiscovery))
    }

    pub fn with_discovery(
        config: &StackConfig,
        transport: Arc<Transport>,
        discovery: Arc<dyn DiscoveryHook>,
    ) -> Self {
        Self {
            node_id: config.node_id,
            config: config.clone(),
            transport,
            routes: Mutex::new(RoutingTable::new()),
            peers: Mutex::new(NodeList::new("peers", MAX_PEERS)),
            pool: Mutex::new(ForwardPool::new(config.tx_msg_queue_size)),
            listeners: Mutex::new(ListenerTable::new()),
            discovery,
            tx_msg: Notify::new(),
            ping: Mutex::new(PingState::default()),
            pong_signal: Notify::new(),
            pending_pongs: Mutex::new(Vec::new()),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    // ========================================================================
    // MESSAGE API
    // ========================================================================

    /// Queue a message for delivery to `msg.recipient`
    ///
    /// Returns once the message is queued. Delivery failures past the first
    /// hop are not reported back.
    pub fn send_message(&self, msg: Message) -> Result<(), RouterError> {
        let recipient = msg.recipient;
        if !(is_valid_node_id(recipient) || recipient == BROADCAST_NODE_ID)
            || recipient == self.node_id
        {
            error!(node = self.node_id, "invalid recipient {}", recipient);
            return Err(RouterError::InvalidRecipient(recipient));
        }

        {
            let mut pool = self.pool.lock();
            let Some(idx) = pool.alloc() else {
                warn!(node = self.node_id, "msg dropped: tx msg queue full");
                return Err(RouterError::QueueFull);
            };
            let seq = pool.next_seq();
            let msg = Message {
                sender: self.node_id,
                seq,
                ..msg
            };
            let frame = match Frame::with_payload(FrameType::Msg, recipient, &msg.encode()) {
                Ok(frame) => frame,
                Err(e) => {
                    pool.release(idx);
                    return Err(TransportError::from(e).into());
                }
            };
            if let Some(entry) = pool.get_mut(idx) {
                entry.frame = frame;
                entry.sender = self.node_id;
                entry.recipient = recipient;
                entry.seq = seq;
                entry.state = ForwardState::Ready;
            }
            debug!(
                node = self.node_id,
                "enqueue msg to {} seq {} port {}", recipient, seq, msg.port
            );
        }

        self.tx_msg.notify_one();
        Ok(())
    }

    /// Convenience wrapper building the message from parts
    pub fn send(
        &self,
        recipient: NodeId,
        port: Port,
        msg_type: u8,
        payload: &[u8],
    ) -> Result<(), RouterError> {
        self.send_message(Message::new(recipient, port, msg_type, payload)?)
    }

    /// Claim `port`; the returned listener starts inactive
    pub fn register_listener(&self, port: Port, capacity: usize) -> Result<Listener, RouterError> {
        let result = self.listeners.lock().register(self.node_id, port, capacity);
        match &result {
            Ok(_) => info!(node = self.node_id, "registered listener: port {}", port),
            Err(e) => error!(node = self.node_id, "register listener on port {}: {}", port, e),
        }
        result
    }

    // ========================================================================
    // ROUTES
    // ========================================================================

    pub fn install_routes(&self, matrix: &RouteMatrix, version: u8) {
        self.routes.lock().install(matrix, self.node_id, version);
        info!(node = self.node_id, "installed routes ver {}", version);
    }

    /// Flood a route set to the network; the local table is not changed
    pub fn broadcast_routes(&self, matrix: &RouteMatrix, version: u8) -> Result<(), RouterError> {
        let frame = Frame::with_payload(
            FrameType::Routes,
            BROADCAST_NODE_ID,
            &encode_routes(matrix, version),
        )
        .map_err(TransportError::from)?;
        self.transport.send(frame, TxFlags::NONE)?;
        info!(node = self.node_id, "broadcasting routes ver {}", version);
        Ok(())
    }

    pub fn set_route(&self, dest: NodeId, next_hop: NodeId) -> Result<(), RouterError> {
        self.routes.lock().set_route(dest, next_hop)
    }

    pub fn clear_route(&self, dest: NodeId) -> Result<(), RouterError> {
        self.routes.lock().clear_route(dest)
    }

    pub fn set_all_routes(&self, next_hop: NodeId) -> Result<(), RouterError> {
        self.routes.lock().set_all(next_hop)
    }

    pub fn clear_all_routes(&self) {
        self.routes.lock().clear_all();
    }

    pub fn routes(&self) -> RoutingTable {
        *self.routes.lock()
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.peers.lock().iter().cloned().collect()
    }

    /// Messages currently occupying the outbound pool
    pub fn queued_messages(&self) -> usize {
        self.pool.lock().in_use()
    }

    // ========================================================================
    // LINK PING
    // ========================================================================

    /// Ping a neighbor and wait for its pong
    pub async fn ping(&self, dest: NodeId, token: u8, timeout: Duration) -> Result<(), RouterError> {
        *self.ping.lock() = PingState {
            expected: Some(token),
            answered: false,
        };
        let frame =
            Frame::with_payload(FrameType::Ping, dest, &[token]).map_err(TransportError::from)?;
        self.transport.send(frame, TxFlags::NONE)?;
        info!(node = self.node_id, "sent ping to {} token {}", dest, token);

        let deadline = Instant::now() + timeout;
        loop {
            if self.take_pong() {
                return Ok(());
            }
            tokio::select! {
                _ = self.pong_signal.notified() => {}
                _ = sleep_until(deadline) => {
                    if self.take_pong() {
                        return Ok(());
                    }
                    self.ping.lock().expected = None;
                    warn!(node = self.node_id, "ping to {} timed out", dest);
                    return Err(RouterError::Timeout);
                }
            }
        }
    }

    fn take_pong(&self) -> bool {
        let mut ping = self.ping.lock();
        if ping.answered {
            *ping = PingState::default();
            true
        } else {
            false
        }
    }

    fn handle_ping(&self, frame: &Frame) {
        let Some(&token) = frame.payload.first() else {
            warn!(node = self.node_id, "ping pkt too short");
            return;
        };
        debug!(node = self.node_id, "got ping from {} token {}", frame.src, token);
        self.pending_pongs.lock().push(PendingPong {
            due: Instant::now() + self.config.pong_delay(),
            dest: frame.src,
            token,
        });
    }

    fn handle_pong(&self, frame: &Frame) {
        let Some(&token) = frame.payload.first() else {
            warn!(node = self.node_id, "pong pkt too short");
            return;
        };
        let matched = {
            let mut ping = self.ping.lock();
            let matched = ping.expected == Some(token);
            if matched {
                ping.answered = true;
            }
            matched
        };
        if matched {
            info!(node = self.node_id, "pong from {} token {}", frame.src, token);
            self.pong_signal.notify_one();
        } else {
            warn!(node = self.node_id, "pong with unexpected token {}", token);
        }
    }

    /// Send pongs that have waited out the pong delay; returns the next due time
    fn send_due_pongs(&self) -> Option<Instant> {
        let now = Instant::now();
        let due: Vec<PendingPong> = {
            let mut pending = self.pending_pongs.lock();
            let (due, waiting): (Vec<PendingPong>, Vec<PendingPong>) =
                pending.drain(..).partition(|p| p.due <= now);
            *pending = waiting;
            due
        };

        for pong in due {
            let sent = Frame::with_payload(FrameType::Pong, pong.dest, &[pong.token])
                .map_err(TransportError::from)
                .and_then(|frame| self.transport.send(frame, TxFlags::NONE));
            match sent {
                Ok(_) => debug!(node = self.node_id, "sent pong to {} token {}", pong.dest, pong.token),
                Err(e) => warn!(node = self.node_id, "failed to send pong: {}", e),
            }
        }

        self.pending_pongs.lock().iter().map(|p| p.due).min()
    }

    // ========================================================================
    // ROUTER TASK
    // ========================================================================

    pub async fn run(&self) {
        info!(node = self.node_id, "router task started");
        loop {
            let reap_deadline = self.reap_sweep();
            self.process_ready();
            while let Some(frame) = self.transport.receive() {
                self.handle_frame(frame);
            }
            let pong_deadline = self.send_due_pongs();

            let deadline = match (reap_deadline, pong_deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            let idle = async {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = self.transport.pkt_received().notified() => {}
                _ = self.tx_msg.notified() => {}
                _ = self.transport.tx_done().notified() => {}
                _ = idle => {}
            }
        }
    }

    /// Collect finished transmissions; returns the earliest pending retry
    fn reap_sweep(&self) -> Option<Instant> {
        let now = Instant::now();
        let mut next_event: Option<Instant> = None;
        let mut heal = Vec::new();

        {
            let mut pool = self.pool.lock();
            for idx in 0..pool.len() {
                let Some(entry) = pool.get_mut(idx) else {
                    continue;
                };
                if entry.state != ForwardState::Sent {
                    continue;
                }

                let outcome = match entry.tx_handle {
                    Some(handle) => {
                        if !self.transport.is_done(handle) {
                            continue;
                        }
                        let reaped = self.transport.reap(handle);
                        match Outcome::after_reap(&reaped) {
                            Some(Outcome::Release) => {
                                debug!(node = self.node_id, "msg tx succeeded: seq {}", entry.seq);
                                Outcome::Release
                            }
                            Some(Outcome::Retry) => {
                                warn!(node = self.node_id, "msg tx failed: seq {}", entry.seq);
                                if self.config.heal_routes {
                                    heal.push((entry.recipient, entry.next_hop));
                                }
                                Outcome::Retry
                            }
                            None => {
                                // entry stays Sent with its handle
                                error!(
                                    node = self.node_id,
                                    "msg seq {}: entry kept after {:?}", entry.seq, reaped
                                );
                                continue;
                            }
                        }
                    }
                    None if entry.next_attempt <= now => {
                        debug!(node = self.node_id, "msg tx expired: seq {}", entry.seq);
                        Outcome::Retry
                    }
                    None => {
                        next_event = Some(match next_event {
                            Some(t) => t.min(entry.next_attempt),
                            None => entry.next_attempt,
                        });
                        continue;
                    }
                };

                match outcome {
                    Outcome::Retry if entry.attempt < MAX_MSG_SEND_ATTEMPTS => {
                        entry.state = ForwardState::Ready;
                    }
                    _ => {
                        debug!(node = self.node_id, "releasing msg tx: seq {}", entry.seq);
                        pool.release(idx);
                    }
                }
            }
        }

        for (recipient, failed_hop) in heal {
            self.heal_route(recipient, failed_hop);
        }
        next_event
    }

    fn process_ready(&self) {
        let routes = self.routes();
        let len = self.pool.lock().len();

        for idx in 0..len {
            let frame = {
                let mut pool = self.pool.lock();
                let Some(entry) = pool.get_mut(idx) else {
                    continue;
                };
                if entry.state != ForwardState::Ready {
                    continue;
                }
                entry.attempt += 1;
                entry.next_attempt = Instant::now() + self.config.tx_msg_retry_delay();
                entry.tx_handle = None;

                let next_hop = if entry.recipient == BROADCAST_NODE_ID {
                    Some(BROADCAST_NODE_ID)
                } else {
                    routes.next_hop(entry.recipient)
                };
                let Some(next_hop) = next_hop else {
                    warn!(
                        node = self.node_id,
                        "no route: {} --> {} [{}]", entry.sender, entry.recipient, entry.seq
                    );
                    pool.release(idx);
                    continue;
                };

                debug!(
                    node = self.node_id,
                    "relaying msg: {} -> {} --> {} (attempt {})",
                    entry.sender,
                    next_hop,
                    entry.recipient,
                    entry.attempt
                );
                entry.next_hop = next_hop;
                entry.frame.dest = next_hop;
                entry.frame.clone()
            };

            let submitted = self.transport.send(frame, TxFlags::NOTIFY);

            let mut pool = self.pool.lock();
            if let Some(entry) = pool.get_mut(idx) {
                match submitted {
                    Ok(handle) => entry.tx_handle = Some(handle),
                    Err(e) => warn!(
                        node = self.node_id,
                        "transport rejected msg seq {}: {}", entry.seq, e
                    ),
                }
                entry.state = ForwardState::Sent;
            }
        }
    }

    fn heal_route(&self, recipient: NodeId, failed_hop: NodeId) {
        if !is_valid_node_id(recipient) {
            return;
        }
        let candidates: Vec<NodeId> = self
            .transport
            .neighbor_ids()
            .into_iter()
            .filter(|&id| id != failed_hop && is_valid_node_id(id))
            .collect();

        match candidates.choose(&mut rand::thread_rng()) {
            Some(&next_hop) => {
                if self.routes.lock().set_route(recipient, next_hop).is_ok() {
                    info!(
                        node = self.node_id,
                        "healed route to {} via {} (was {})", recipient, next_hop, failed_hop
                    );
                }
            }
            None => warn!(
                node = self.node_id,
                "no alt routes to {} (-{})", recipient, failed_hop
            ),
        }
    }

    // ========================================================================
    // INBOUND FRAMES
    // ========================================================================

    pub(crate) fn handle_frame(&self, frame: Frame) {
        debug!(
            node = self.node_id,
            "handle {:?} [{}] {} -> {}", frame.frame_type, frame.seq, frame.src, frame.dest
        );
        match frame.frame_type {
            FrameType::Msg => self.handle_msg(frame),
            FrameType::Routes => self.handle_routes(frame),
            FrameType::Ping => self.handle_ping(&frame),
            FrameType::Pong => self.handle_pong(&frame),
            FrameType::DiscoverRequest | FrameType::DiscoverResponse => {
                self.discovery.handle_frame(&frame)
            }
            FrameType::Ack | FrameType::Invalid => {
                warn!(node = self.node_id, "unexpected {:?} frame", frame.frame_type)
            }
        }
    }

    fn handle_msg(&self, frame: Frame) {
        let msg = match Message::decode(&frame.payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(node = self.node_id, "dropped msg pkt: {}", e);
                return;
            }
        };

        if msg.recipient == self.node_id || msg.recipient == BROADCAST_NODE_ID {
            self.deliver_local(msg);
        } else if msg.sender == self.node_id {
            debug!(
                node = self.node_id,
                "dropped msg: returned to sender: {} --> {} seq {}", msg.sender, msg.recipient, msg.seq
            );
        } else if frame.hops as usize >= MAX_PATH_LEN {
            debug!(
                node = self.node_id,
                "dropped msg: max hops reached: {} --> {} seq {}", msg.sender, msg.recipient, msg.seq
            );
        } else {
            self.forward(frame, &msg);
        }
    }

    fn deliver_local(&self, msg: Message) {
        {
            let mut peers = self.peers.lock();
            let peer = peers.find_or_insert_with(msg.sender, || Peer {
                id: msg.sender,
                seq: 0,
            });
            if peer.seq == msg.seq {
                debug!(node = self.node_id, "msg dropped: duplicate seq {}", msg.seq);
                return;
            }
            peer.seq = msg.seq;
        }

        let (sender, port, seq) = (msg.sender, msg.port, msg.seq);
        match self.listeners.lock().deliver(msg) {
            Delivery::Delivered => debug!(
                node = self.node_id,
                "delivered msg {} [{}] to port {}", sender, seq, port
            ),
            Delivery::NoListener => warn!(node = self.node_id, "no listener on port {}", port),
            Delivery::QueueFull => warn!(
                node = self.node_id,
                "dropped msg: listener queue full: port {}", port
            ),
        }
    }

    fn forward(&self, frame: Frame, msg: &Message) {
        {
            let mut pool = self.pool.lock();
            let Some(idx) = pool.alloc() else {
                warn!(node = self.node_id, "fwd msg dropped: tx msg queue full");
                return;
            };
            if let Some(entry) = pool.get_mut(idx) {
                entry.frame = frame;
                entry.sender = msg.sender;
                entry.recipient = msg.recipient;
                entry.seq = msg.seq;
                entry.state = ForwardState::Ready;
            }
        }
        debug!(
            node = self.node_id,
            "enqueued msg for fwd: {} --> {} seq {}", msg.sender, msg.recipient, msg.seq
        );
        self.tx_msg.notify_one();
    }

    fn handle_routes(&self, mut frame: Frame) {
        let (version, matrix) = match decode_routes(&frame.payload) {
            Ok(routes) => routes,
            Err(e) => {
                warn!(node = self.node_id, "dropped routes pkt: {}", e);
                return;
            }
        };

        {
            let mut routes = self.routes.lock();
            if !routes.is_newer(version) {
                debug!(
                    node = self.node_id,
                    "ignored routes ver {}: have {}", version, routes.version()
                );
                return;
            }
            routes.install(&matrix, self.node_id, version);
        }
        self.discovery.reset();
        info!(node = self.node_id, "installed routes ver {} from {}", version, frame.src);

        frame.dest = BROADCAST_NODE_ID;
        if let Err(e) = self.transport.send(frame, TxFlags::NONE) {
            warn!(node = self.node_id, "failed to rebroadcast routes: {}", e);
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Release,
    Retry,
}

impl Outcome {
    /// What to do with a pool entry after reaping its transmission. A reap
    /// error is a transport contract violation and yields no outcome.
    fn after_reap(reaped: &Result<bool, TransportError>) -> Option<Self> {
        match reaped {
            Ok(true) => Some(Outcome::Release),
            Ok(false) => Some(Outcome::Retry),
            Err(_) => None,
        }
    }
}
