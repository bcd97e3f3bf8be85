// RPC module: request/reply calls over routed messages
//
// Envelope carried in the message payload:
//   PROC_ID(1) SEQ(1) REPLY_PORT(1) | BODY
// The message type says whether it is a request, a reply, or an error reply.
// Error replies carry no body.

pub mod client;
pub mod endpoint;
pub mod ping;
pub mod server;

use crate::routing::{RouterError, MAX_MSG_PAYLOAD};
use thiserror::Error;

pub use client::RpcClient;
pub use endpoint::RpcEndpoint;
pub use ping::{
    ping_endpoint, rpc_ping, PingProcedure, PORT_RPC_CLIENT_PING, PORT_RPC_SERVER_PING, RPC_PING,
};
pub use server::{Procedure, ProcedureTable, RpcServer};

pub const RPC_PROC_ID: usize = 0;
pub const RPC_SEQ: usize = 1;
pub const RPC_REPLY_PORT: usize = 2;
pub const RPC_HEADER_LEN: usize = 3;

pub const MAX_RPC_BODY: usize = MAX_MSG_PAYLOAD - RPC_HEADER_LEN;

pub const RPC_CLIENT_QUEUE_SIZE: usize = 2;
pub const RPC_SERVER_QUEUE_SIZE: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RpcMsgType {
    Invalid = 0,
    Request = 1,
    Reply = 2,
    Error = 3,
}

impl RpcMsgType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => RpcMsgType::Request,
            2 => RpcMsgType::Reply,
            3 => RpcMsgType::Error,
            _ => RpcMsgType::Invalid,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("Request of {len} bytes exceeds maximum {max}")]
    RequestTooLarge { len: usize, max: usize },
    #[error("Reply of {len} bytes does not fit buffer of {max}")]
    ReplyTooLarge { len: usize, max: usize },
    #[error("RPC timed out")]
    Timeout,
    #[error("Remote procedure failed")]
    RemoteError,
    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),
    #[error("Router error: {0}")]
    Router(#[from] RouterError),
}

/// Reasons a procedure refuses a request; the caller only sees `RemoteError`
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProcError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Reply buffer too small: need {need}, have {have}")]
    ReplyBufferTooSmall { need: usize, have: usize },
    #[error("Unknown procedure {0}")]
    UnknownProcedure(u8),
    #[error("Procedure failed: {0}")]
    Failed(String),
}

/// Build an envelope: header followed by `body`
pub(crate) fn encode_envelope(proc_id: u8, seq: u8, reply_port: u8, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RPC_HEADER_LEN + body.len());
    buf.extend_from_slice(&[proc_id, seq, reply_port]);
    buf.extend_from_slice(body);
    buf
}
