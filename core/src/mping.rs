//! Message-layer ping
//!
//! PING and PONG are ordinary routed messages on `PORT_PING`, so a round trip
//! exercises the whole forwarding path. A pong carries the RSSI the responder
//! hears the pinger at. That is only known between one-hop neighbors and
//! reads 0 otherwise.
//!
//! Pong payload: `TOKEN(1) RSSI(2, little endian)`.

use crate::routing::{Listener, Message, Port, Router, RouterError};
use crate::NodeId;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

pub const PORT_PING: Port = 12;

pub const MSG_TYPE_PING: u8 = 1;
pub const MSG_TYPE_PONG: u8 = 2;

pub const MSG_PING_TOKEN: usize = 0;
pub const MSG_PONG_TOKEN: usize = 0;
pub const MSG_PONG_RSSI: usize = 1;
pub const MSG_PONG_RSSI_LEN: usize = 2;

const PONG_LEN: usize = MSG_PONG_RSSI + MSG_PONG_RSSI_LEN;
const PING_QUEUE_SIZE: usize = 2;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MpingError {
    #[error("Ping already in progress")]
    InProgress,
    #[error("Token 0 is reserved")]
    InvalidToken,
    #[error("Router error: {0}")]
    Router(#[from] RouterError),
}

/// Answer to the ping in progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pong {
    pub from: NodeId,
    pub token: u8,
    /// How strongly the responder hears us
    pub ping_rssi: u16,
    /// How strongly we hear the responder
    pub pong_rssi: u16,
}

#[derive(Default)]
struct PingState {
    expected: Option<u8>,
    last_ping: Option<Instant>,
    pong: Option<Pong>,
}

/// Ping client and responder on one node
///
/// `serve_forever` must run for pings to be answered and for pongs and
/// expiries to be seen.
pub struct MessagePing {
    router: Arc<Router>,
    listener: Listener,
    pong_delay: Duration,
    period: Duration,
    state: Mutex<PingState>,
    /// Wakes the serve loop so it picks up a new expiry deadline
    kick: Notify,
    pong_signal: Notify,
}

impl MessagePing {
    /// `period` is both the periodic ping interval and how long a ping may
    /// stay unanswered
    pub fn new(
        router: Arc<Router>,
        pong_delay: Duration,
        period: Duration,
    ) -> Result<Self, MpingError> {
        let listener = router.register_listener(PORT_PING, PING_QUEUE_SIZE)?;
        listener.activate();
        Ok(Self {
            router,
            listener,
            pong_delay,
            period,
            state: Mutex::new(PingState::default()),
            kick: Notify::new(),
            pong_signal: Notify::new(),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.router.node_id()
    }

    pub fn in_progress(&self) -> bool {
        self.state.lock().expected.is_some()
    }

    /// Send a ping; the answer shows up through `wait_pong`
    pub fn ping(&self, recipient: NodeId, token: u8) -> Result<(), MpingError> {
        let node = self.node_id();
        if token == 0 {
            return Err(MpingError::InvalidToken);
        }
        {
            let mut state = self.state.lock();
            if state.expected.is_some() {
                warn!(node = node, "ping in progress");
                return Err(MpingError::InProgress);
            }
            state.expected = Some(token);
            state.last_ping = Some(Instant::now());
            state.pong = None;
        }

        info!(node = node, "sending ping to {} token {}", recipient, token);
        if let Err(e) = self.router.send(recipient, PORT_PING, MSG_TYPE_PING, &[token]) {
            warn!(node = node, "ping send failed: {}", e);
            self.cancel();
            return Err(e.into());
        }

        self.kick.notify_one();
        Ok(())
    }

    /// Give up on the ping in progress
    pub fn cancel(&self) {
        self.state.lock().expected = None;
    }

    pub fn take_pong(&self) -> Option<Pong> {
        self.state.lock().pong.take()
    }

    /// Wait for the pong to the current ping until `deadline`
    pub async fn wait_pong(&self, deadline: Instant) -> Option<Pong> {
        loop {
            if let Some(pong) = self.take_pong() {
                return Some(pong);
            }
            tokio::select! {
                _ = self.pong_signal.notified() => {}
                _ = sleep_until(deadline) => return self.take_pong(),
            }
        }
    }

    /// Handle queued messages, then expire an unanswered ping
    ///
    /// Returns the expiry deadline of a ping still waiting for its pong.
    pub async fn serve(&self) -> Option<Instant> {
        while let Some(msg) = self.listener.try_recv() {
            self.handle_msg(msg).await;
        }

        let mut state = self.state.lock();
        let (Some(token), Some(sent)) = (state.expected, state.last_ping) else {
            return None;
        };
        let expires = sent + self.period;
        if Instant::now() < expires {
            return Some(expires);
        }
        warn!(node = self.node_id(), "ping with token {} timed out", token);
        state.expected = None;
        None
    }

    pub async fn serve_forever(&self) {
        info!(node = self.node_id(), "mping: serving on port {}", PORT_PING);
        loop {
            let expires = self.serve().await;
            let idle = async {
                match expires {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = self.listener.notified() => {}
                _ = self.kick.notified() => {}
                _ = idle => {}
            }
        }
    }

    /// Ping `recipient` once per period with a fresh token
    ///
    /// A round is skipped while the previous ping is still out.
    pub async fn run_periodic(&self, recipient: NodeId) {
        let node = self.node_id();
        info!(node = node, "periodic ping to {} every {:?}", recipient, self.period);
        let mut token: u8 = 0;
        loop {
            if !self.in_progress() {
                token = next_token(token);
                if let Err(e) = self.ping(recipient, token) {
                    warn!(node = node, "periodic ping failed: {}", e);
                }
            }
            sleep(self.period).await;
        }
    }

    async fn handle_msg(&self, msg: Message) {
        debug!(
            node = self.node_id(),
            "received msg from {} type {}", msg.sender, msg.msg_type
        );
        match msg.msg_type {
            MSG_TYPE_PING => self.handle_ping(&msg).await,
            MSG_TYPE_PONG => self.handle_pong(&msg),
            other => warn!(node = self.node_id(), "unexpected msg type {}", other),
        }
    }

    async fn handle_ping(&self, msg: &Message) {
        let node = self.node_id();
        let Some(&token) = msg.payload.get(MSG_PING_TOKEN) else {
            warn!(node = node, "runt ping from {}", msg.sender);
            return;
        };

        sleep(self.pong_delay).await;

        let rssi = self.neighbor_rssi(msg.sender);
        debug!(
            node = node,
            "ping from {} token {}, sending pong rssi {}", msg.sender, token, rssi
        );
        if let Err(e) = self
            .router
            .send(msg.sender, PORT_PING, MSG_TYPE_PONG, &encode_pong(token, rssi))
        {
            warn!(node = node, "failed to send pong to {}: {}", msg.sender, e);
        }
    }

    fn handle_pong(&self, msg: &Message) {
        let node = self.node_id();
        let Some((token, ping_rssi)) = decode_pong(&msg.payload) else {
            warn!(node = node, "runt pong from {}", msg.sender);
            return;
        };
        let pong_rssi = self.neighbor_rssi(msg.sender);

        let pong = {
            let mut state = self.state.lock();
            if state.expected != Some(token) {
                warn!(
                    node = node,
                    "pong with unexpected token: {}/{:?}", token, state.expected
                );
                return;
            }
            let pong = Pong {
                from: msg.sender,
                token,
                ping_rssi,
                pong_rssi,
            };
            state.expected = None;
            state.pong = Some(pong);
            pong
        };

        info!(
            node = node,
            "pong from {} token {} rssi ping/pong {}/{}",
            pong.from,
            pong.token,
            pong.ping_rssi,
            pong.pong_rssi
        );
        self.pong_signal.notify_one();
    }

    fn neighbor_rssi(&self, id: NodeId) -> u16 {
        self.router
            .transport()
            .neighbor(id)
            .map_or(0, |neighbor| neighbor.rssi as u16)
    }
}

/// Tokens run 1..=255 and wrap past 0
fn next_token(token: u8) -> u8 {
    match token.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}

fn encode_pong(token: u8, rssi: u16) -> [u8; PONG_LEN] {
    let mut payload = [0u8; PONG_LEN];
    payload[MSG_PONG_TOKEN] = token;
    payload[MSG_PONG_RSSI..].copy_from_slice(&rssi.to_le_bytes());
    payload
}

fn decode_pong(payload: &[u8]) -> Option<(u8, u16)> {
    if payload.len() < PONG_LEN {
        return None;
    }
    let rssi = u16::from_le_bytes([payload[MSG_PONG_RSSI], payload[MSG_PONG_RSSI + 1]]);
    Some((payload[MSG_PONG_TOKEN], rssi))
}
