//! RPC client
//!
//! One listener per client, active only while a call is in flight. Replies
//! are matched on (proc id, seq); anything else found in the queue is stale
//! and gets discarded.

use super::{
    encode_envelope, RpcError, RpcMsgType, MAX_RPC_BODY, RPC_CLIENT_QUEUE_SIZE, RPC_HEADER_LEN,
    RPC_PROC_ID, RPC_SEQ,
};
use crate::routing::{Listener, Message, Port, Router};
use crate::NodeId;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

pub struct RpcClient {
    name: String,
    router: Arc<Router>,
    listener: Listener,
    seq: u8,
}

/// Keeps the client listener active for the lifetime of a call
struct ActiveGuard<'a>(&'a Listener);

impl<'a> ActiveGuard<'a> {
    fn new(listener: &'a Listener) -> Self {
        listener.activate();
        Self(listener)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.deactivate();
    }
}

impl RpcClient {
    pub fn new(router: Arc<Router>, name: impl Into<String>, port: Port) -> Result<Self, RpcError> {
        let listener = router.register_listener(port, RPC_CLIENT_QUEUE_SIZE)?;
        Ok(Self {
            name: name.into(),
            router,
            listener,
            seq: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> Port {
        self.listener.port()
    }

    /// Node this client calls from
    pub fn node_id(&self) -> NodeId {
        self.router.node_id()
    }

    /// Call procedure `proc_id` on the server at `(node, port)`
    ///
    /// On success the reply body is copied into `reply` and its length
    /// returned.
    pub async fn call(
        &mut self,
        node: NodeId,
        port: Port,
        proc_id: u8,
        timeout: Duration,
        request: &[u8],
        reply: &mut [u8],
    ) -> Result<usize, RpcError> {
        if request.len() > MAX_RPC_BODY {
            warn!(
                node = self.router.node_id(),
                "{}: req too big: {}/{}",
                self.name,
                request.len(),
                MAX_RPC_BODY
            );
            return Err(RpcError::RequestTooLarge {
                len: request.len(),
                max: MAX_RPC_BODY,
            });
        }

        self.seq = self.seq.wrapping_add(1);
        let seq = self.seq;
        let deadline = Instant::now() + timeout;

        debug!(
            node = self.router.node_id(),
            "{}: req {}:{}:{} seq {}", self.name, node, port, proc_id, seq
        );
        let envelope = encode_envelope(proc_id, seq, self.listener.port(), request);
        self.router
            .send(node, port, RpcMsgType::Request.as_u8(), &envelope)?;

        let _active = ActiveGuard::new(&self.listener);
        loop {
            while let Some(msg) = self.listener.try_recv() {
                if let Some(result) = self.match_reply(&msg, proc_id, seq, reply) {
                    return result;
                }
            }
            tokio::select! {
                _ = self.listener.notified() => {}
                _ = sleep_until(deadline) => break,
            }
        }

        warn!(
            node = self.router.node_id(),
            "{}: req {}:{}:{} seq {} timed out", self.name, node, port, proc_id, seq
        );
        Err(RpcError::Timeout)
    }

    /// `None` when the message does not answer the current call
    fn match_reply(
        &self,
        msg: &Message,
        proc_id: u8,
        seq: u8,
        reply: &mut [u8],
    ) -> Option<Result<usize, RpcError>> {
        let node = self.router.node_id();
        if msg.payload.len() < RPC_HEADER_LEN {
            warn!(node = node, "{}: discarding runt reply from {}", self.name, msg.sender);
            return None;
        }
        let (reply_id, reply_seq) = (msg.payload[RPC_PROC_ID], msg.payload[RPC_SEQ]);
        if reply_id != proc_id || reply_seq != seq {
            warn!(
                node = node,
                "{}: discarding stale reply id {}/{} seq {}/{}",
                self.name,
                reply_id,
                proc_id,
                reply_seq,
                seq
            );
            return None;
        }

        match RpcMsgType::from_u8(msg.msg_type) {
            RpcMsgType::Reply => {
                let body = &msg.payload[RPC_HEADER_LEN..];
                if body.len() > reply.len() {
                    warn!(
                        node = node,
                        "{}: reply too big: {}/{}",
                        self.name,
                        body.len(),
                        reply.len()
                    );
                    return Some(Err(RpcError::ReplyTooLarge {
                        len: body.len(),
                        max: reply.len(),
                    }));
                }
                reply[..body.len()].copy_from_slice(body);
                debug!(node = node, "{}: reply len {}", self.name, body.len());
                Some(Ok(body.len()))
            }
            RpcMsgType::Error => {
                warn!(node = node, "{}: error reply from {}", self.name, msg.sender);
                Some(Err(RpcError::RemoteError))
            }
            _ => {
                warn!(
                    node = node,
                    "{}: discarding msg of unexpected type {}", self.name, msg.msg_type
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StackConfig;
    use crate::radio::SimMedium;
    use crate::transport::Transport;

    fn client() -> (SimMedium, RpcClient) {
        let medium = SimMedium::new();
        let config = StackConfig::for_node(1);
        let transport = Arc::new(Transport::new(&config, Arc::new(medium.attach(1))));
        let router = Arc::new(Router::new(&config, transport));
        let client = RpcClient::new(router, "test", 20).unwrap();
        (medium, client)
    }

    fn reply_msg(msg_type: RpcMsgType, proc_id: u8, seq: u8, body: &[u8]) -> Message {
        let mut msg = Message::new(1, 20, msg_type.as_u8(), &encode_envelope(proc_id, seq, 0, body))
            .unwrap();
        msg.sender = 2;
        msg
    }

    #[tokio::test]
    async fn test_request_too_large() {
        let (_medium, mut client) = client();
        let mut reply = [0u8; 4];
        let err = client
            .call(2, 10, 1, Duration::from_secs(1), &[0; MAX_RPC_BODY + 1], &mut reply)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RpcError::RequestTooLarge {
                len: MAX_RPC_BODY + 1,
                max: MAX_RPC_BODY
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_deactivates_listener() {
        let (_medium, mut client) = client();
        let mut reply = [0u8; 4];
        let err = client
            .call(2, 10, 1, Duration::from_millis(500), &[1], &mut reply)
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::Timeout);
        assert!(!client.listener.is_active());
    }

    #[test]
    fn test_match_reply() {
        let (_medium, client) = client();
        let mut reply = [0u8; 2];

        let ok = reply_msg(RpcMsgType::Reply, 3, 5, &[9, 8]);
        assert_eq!(client.match_reply(&ok, 3, 5, &mut reply), Some(Ok(2)));
        assert_eq!(reply, [9, 8]);

        let stale = reply_msg(RpcMsgType::Reply, 3, 4, &[1]);
        assert_eq!(client.match_reply(&stale, 3, 5, &mut reply), None);

        let stale_error = reply_msg(RpcMsgType::Error, 3, 4, &[]);
        assert_eq!(client.match_reply(&stale_error, 3, 5, &mut reply), None);

        let error = reply_msg(RpcMsgType::Error, 3, 5, &[]);
        assert_eq!(
            client.match_reply(&error, 3, 5, &mut reply),
            Some(Err(RpcError::RemoteError))
        );

        let big = reply_msg(RpcMsgType::Reply, 3, 5, &[1, 2, 3]);
        assert_eq!(
            client.match_reply(&big, 3, 5, &mut reply),
            Some(Err(RpcError::ReplyTooLarge { len: 3, max: 2 }))
        );

        let request = reply_msg(RpcMsgType::Request, 3, 5, &[]);
        assert_eq!(client.match_reply(&request, 3, 5, &mut reply), None);
    }
}
