//! Ping service: the simplest end-to-end check of the RPC path

use super::{ProcError, Procedure, ProcedureTable, RpcClient, RpcEndpoint, RpcError};
use crate::routing::{Port, Router};
use crate::NodeId;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub const RPC_PING: u8 = 1;

pub const PORT_RPC_SERVER_PING: Port = 10;
pub const PORT_RPC_CLIENT_PING: Port = 11;

const PING_LEN: usize = 1;

/// Echoes the one-byte token after a processing delay
pub struct PingProcedure {
    delay: Duration,
}

impl PingProcedure {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Procedure for PingProcedure {
    fn name(&self) -> &str {
        "ping"
    }

    async fn call(
        &self,
        _requester: NodeId,
        request: &[u8],
        reply: &mut [u8],
    ) -> Result<usize, ProcError> {
        if request.len() != PING_LEN {
            return Err(ProcError::InvalidRequest(format!(
                "length {}/{}",
                request.len(),
                PING_LEN
            )));
        }
        if reply.len() < PING_LEN {
            return Err(ProcError::ReplyBufferTooSmall {
                need: PING_LEN,
                have: reply.len(),
            });
        }

        tokio::time::sleep(self.delay).await;
        reply[0] = request[0];
        Ok(PING_LEN)
    }
}

/// Ping endpoint on the standard ping ports
pub fn ping_endpoint(router: Arc<Router>, pong_delay: Duration) -> Result<RpcEndpoint, RpcError> {
    let procs = ProcedureTable::new().with(RPC_PING, Arc::new(PingProcedure::new(pong_delay)));
    RpcEndpoint::new(
        router,
        "ping",
        PORT_RPC_SERVER_PING,
        PORT_RPC_CLIENT_PING,
        procs,
    )
}

/// Ping `node`'s ping server and check that the token comes back
pub async fn rpc_ping(
    client: &mut RpcClient,
    node: NodeId,
    token: u8,
    timeout: Duration,
) -> Result<(), RpcError> {
    let mut reply = [0u8; PING_LEN];
    let len = client
        .call(node, PORT_RPC_SERVER_PING, RPC_PING, timeout, &[token], &mut reply)
        .await?;

    if len != PING_LEN {
        warn!(node = client.node_id(), "ping reply of unexpected length {}", len);
        return Err(RpcError::UnexpectedReply(format!("length {}", len)));
    }
    if reply[0] != token {
        warn!(
            node = client.node_id(),
            "unexpected token in ping reply from {}: {}/{}", node, reply[0], token
        );
        return Err(RpcError::UnexpectedReply(format!("token {}", reply[0])));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ping_procedure_echoes_token() {
        let ping = PingProcedure::new(Duration::from_secs(1));
        let mut reply = [0u8; 4];
        assert_eq!(ping.call(2, &[0x07], &mut reply).await, Ok(1));
        assert_eq!(reply[0], 0x07);
    }

    #[tokio::test]
    async fn test_ping_procedure_rejects_bad_requests() {
        let ping = PingProcedure::new(Duration::ZERO);
        let mut reply = [0u8; 1];
        assert!(matches!(
            ping.call(2, &[1, 2], &mut reply).await,
            Err(ProcError::InvalidRequest(_))
        ));
        let mut empty: [u8; 0] = [];
        assert_eq!(
            ping.call(2, &[1], &mut empty).await,
            Err(ProcError::ReplyBufferTooSmall { need: 1, have: 0 })
        );
    }
}
