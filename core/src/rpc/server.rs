//! RPC server and procedure dispatch

use super::{
    encode_envelope, ProcError, RpcError, RpcMsgType, MAX_RPC_BODY, RPC_HEADER_LEN, RPC_PROC_ID,
    RPC_REPLY_PORT, RPC_SEQ, RPC_SERVER_QUEUE_SIZE,
};
use crate::routing::{Listener, Message, Port, Router};
use crate::NodeId;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A procedure callable over RPC
#[async_trait]
pub trait Procedure: Send + Sync {
    fn name(&self) -> &str;

    /// Handle one request; write the reply body into `reply` and return its
    /// length
    async fn call(
        &self,
        requester: NodeId,
        request: &[u8],
        reply: &mut [u8],
    ) -> Result<usize, ProcError>;
}

/// Procedures served by one server, keyed by procedure id
#[derive(Clone, Default)]
pub struct ProcedureTable {
    procs: BTreeMap<u8, Arc<dyn Procedure>>,
}

impl ProcedureTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: u8, procedure: Arc<dyn Procedure>) -> Self {
        self.procs.insert(id, procedure);
        self
    }

    pub fn get(&self, id: u8) -> Option<&Arc<dyn Procedure>> {
        self.procs.get(&id)
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }
}

pub struct RpcServer {
    name: String,
    router: Arc<Router>,
    listener: Listener,
    procs: ProcedureTable,
}

impl RpcServer {
    pub fn new(
        router: Arc<Router>,
        name: impl Into<String>,
        port: Port,
        procs: ProcedureTable,
    ) -> Result<Self, RpcError> {
        let listener = router.register_listener(port, RPC_SERVER_QUEUE_SIZE)?;
        Ok(Self {
            name: name.into(),
            router,
            listener,
            procs,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> Port {
        self.listener.port()
    }

    pub fn activate(&self) {
        self.listener.activate();
    }

    pub fn deactivate(&self) {
        self.listener.deactivate();
    }

    /// Wait until a request may be queued
    pub async fn wait(&self) {
        self.listener.notified().await
    }

    /// Handle every queued request; returns how many were handled
    pub async fn serve(&self) -> usize {
        let mut served = 0;
        while let Some(msg) = self.listener.try_recv() {
            self.handle_request(msg).await;
            served += 1;
        }
        served
    }

    pub async fn serve_forever(&self) {
        info!(
            node = self.router.node_id(),
            "{}: serving on port {}",
            self.name,
            self.port()
        );
        loop {
            self.serve().await;
            self.wait().await;
        }
    }

    async fn handle_request(&self, msg: Message) {
        let node = self.router.node_id();
        if RpcMsgType::from_u8(msg.msg_type) != RpcMsgType::Request {
            warn!(node = node, "{}: unexpected msg type {}", self.name, msg.msg_type);
            return;
        }
        if msg.payload.len() < RPC_HEADER_LEN {
            warn!(node = node, "{}: runt request from {}", self.name, msg.sender);
            return;
        }

        let proc_id = msg.payload[RPC_PROC_ID];
        let seq = msg.payload[RPC_SEQ];
        let reply_port = msg.payload[RPC_REPLY_PORT];
        let request = &msg.payload[RPC_HEADER_LEN..];

        let mut reply = [0u8; MAX_RPC_BODY];
        let outcome = match self.procs.get(proc_id) {
            Some(procedure) => {
                debug!(
                    node = node,
                    "{}: {} [{}] from {} seq {}",
                    self.name,
                    procedure.name(),
                    proc_id,
                    msg.sender,
                    seq
                );
                procedure.call(msg.sender, request, &mut reply).await
            }
            None => Err(ProcError::UnknownProcedure(proc_id)),
        };

        let (msg_type, body) = match outcome {
            Ok(len) if len <= reply.len() => (RpcMsgType::Reply, &reply[..len]),
            Ok(len) => {
                warn!(node = node, "{}: proc {} reported bad length {}", self.name, proc_id, len);
                (RpcMsgType::Error, &reply[..0])
            }
            Err(e) => {
                warn!(node = node, "{}: proc {} failed: {}", self.name, proc_id, e);
                (RpcMsgType::Error, &reply[..0])
            }
        };

        let envelope = encode_envelope(proc_id, seq, 0, body);
        if let Err(e) = self
            .router
            .send(msg.sender, reply_port, msg_type.as_u8(), &envelope)
        {
            warn!(node = node, "{}: failed to send reply to {}: {}", self.name, msg.sender, e);
        }
    }
}
