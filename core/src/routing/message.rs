//! Routed message envelope
//!
//! A message rides in the payload of a MSG frame:
//! `SENDER RECIPIENT SEQ PORT TYPE | PAYLOAD`.

use super::RouterError;
use crate::NodeId;

pub type Port = u8;

pub const MSG_SENDER: usize = 0;
pub const MSG_RECIPIENT: usize = 1;
pub const MSG_SEQ: usize = 2;
pub const MSG_PORT: usize = 3;
pub const MSG_TYPE: usize = 4;
pub const MSG_HEADER_LEN: usize = 5;

pub const MAX_MSG_SIZE: usize = 64;
pub const MAX_MSG_PAYLOAD: usize = MAX_MSG_SIZE - MSG_HEADER_LEN;

pub type MsgPayload = heapless::Vec<u8, MAX_MSG_PAYLOAD>;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub sender: NodeId,
    pub recipient: NodeId,
    /// Sender's message sequence, assigned by the router on send
    pub seq: u8,
    pub port: Port,
    pub msg_type: u8,
    pub payload: MsgPayload,
}

impl Message {
    pub fn new(
        recipient: NodeId,
        port: Port,
        msg_type: u8,
        payload: &[u8],
    ) -> Result<Self, RouterError> {
        let payload = MsgPayload::from_slice(payload).map_err(|_| RouterError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_MSG_PAYLOAD,
        })?;
        Ok(Self {
            recipient,
            port,
            msg_type,
            payload,
            ..Self::default()
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MSG_HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&[self.sender, self.recipient, self.seq, self.port, self.msg_type]);
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, RouterError> {
        if data.len() < MSG_HEADER_LEN {
            return Err(RouterError::MalformedMessage(data.len()));
        }
        let body = &data[MSG_HEADER_LEN..];
        let payload = MsgPayload::from_slice(body).map_err(|_| RouterError::PayloadTooLarge {
            len: body.len(),
            max: MAX_MSG_PAYLOAD,
        })?;
        Ok(Self {
            sender: data[MSG_SENDER],
            recipient: data[MSG_RECIPIENT],
            seq: data[MSG_SEQ],
            port: data[MSG_PORT],
            msg_type: data[MSG_TYPE],
            payload,
        })
    }
}
