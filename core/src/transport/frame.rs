/// Radio frame: the unit the transport puts on the air
///
/// Format (11-byte header):
/// [1 byte]  frame type
/// [1 byte]  src      last transmitter, stamped at send time
/// [1 byte]  dest     receiving node or broadcast
/// [1 byte]  seq      sender's transport sequence
/// [1 byte]  hops     number of transmissions so far
/// [6 bytes] path     ids of the first `min(hops, 6)` transmitters
/// [N bytes] payload  up to 65 bytes

use crate::radio::RADIO_MTU;
use crate::{NodeId, INVALID_NODE_ID, MAX_PATH_LEN};
use thiserror::Error;

pub const HDR_TYPE: usize = 0;
pub const HDR_SRC: usize = 1;
pub const HDR_DEST: usize = 2;
pub const HDR_SEQ: usize = 3;
pub const HDR_HOPS: usize = 4;
pub const HDR_PATH: usize = 5;
pub const HDR_PATH_LEN: usize = 6;

pub const HEADER_LEN: usize = HDR_PATH + HDR_PATH_LEN;
pub const MAX_FRAME_LEN: usize = RADIO_MTU;
pub const MAX_FRAME_PAYLOAD: usize = MAX_FRAME_LEN - HEADER_LEN;

pub type Path = heapless::Vec<NodeId, MAX_PATH_LEN>;
pub type FramePayload = heapless::Vec<u8, MAX_FRAME_PAYLOAD>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame too short: need {need} bytes, got {got}")]
    TooShort { need: usize, got: usize },
    #[error("Frame of {0} bytes exceeds maximum frame length")]
    TooLong(usize),
    #[error("Invalid frame type: {0}")]
    InvalidFrameType(u8),
    #[error("Payload of {len} bytes exceeds maximum {max}")]
    PayloadTooLarge { len: usize, max: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum FrameType {
    #[default]
    Invalid = 0,
    Ack = 1,
    Ping = 2,
    Pong = 3,
    DiscoverRequest = 4,
    DiscoverResponse = 5,
    Msg = 6,
    Routes = 7,
}

impl FrameType {
    pub fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value {
            0 => Ok(FrameType::Invalid),
            1 => Ok(FrameType::Ack),
            2 => Ok(FrameType::Ping),
            3 => Ok(FrameType::Pong),
            4 => Ok(FrameType::DiscoverRequest),
            5 => Ok(FrameType::DiscoverResponse),
            6 => Ok(FrameType::Msg),
            7 => Ok(FrameType::Routes),
            other => Err(FrameError::InvalidFrameType(other)),
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame {
    pub frame_type: FrameType,
    pub src: NodeId,
    pub dest: NodeId,
    pub seq: u8,
    pub hops: u8,
    pub path: Path,
    pub payload: FramePayload,
    /// Signal strength this frame was received at (0 for outbound frames)
    pub rssi: u8,
}

impl Frame {
    pub fn new(frame_type: FrameType, dest: NodeId) -> Self {
        Self {
            frame_type,
            dest,
            ..Self::default()
        }
    }

    pub fn with_payload(
        frame_type: FrameType,
        dest: NodeId,
        payload: &[u8],
    ) -> Result<Self, FrameError> {
        let mut frame = Self::new(frame_type, dest);
        frame.set_payload(payload)?;
        Ok(frame)
    }

    /// Acknowledgement for the frame `seq` received from `dest`
    pub fn ack(dest: NodeId, seq: u8) -> Self {
        Self {
            frame_type: FrameType::Ack,
            dest,
            seq,
            ..Self::default()
        }
    }

    pub fn set_payload(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        self.payload = FramePayload::from_slice(payload).map_err(|_| FrameError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_FRAME_PAYLOAD,
        })?;
        Ok(())
    }

    /// Node that originally put this frame on the air
    pub fn origin(&self) -> NodeId {
        self.path.first().copied().unwrap_or(self.src)
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Serialize the frame exactly as it stands
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![INVALID_NODE_ID; HEADER_LEN];
        buf[HDR_TYPE] = self.frame_type.as_u8();
        buf[HDR_SRC] = self.src;
        buf[HDR_DEST] = self.dest;
        buf[HDR_SEQ] = self.seq;
        buf[HDR_HOPS] = self.hops;
        buf[HDR_PATH..HDR_PATH + self.path.len()].copy_from_slice(&self.path);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Serialize with the transmission stamps applied by `transmitter`
    ///
    /// The stored frame is left untouched so every retry carries the same
    /// stamps.
    pub fn to_wire(&self, transmitter: NodeId) -> Vec<u8> {
        let mut stamped = self.clone();
        stamped.src = transmitter;
        if (stamped.hops as usize) < MAX_PATH_LEN {
            // path holds exactly min(hops, MAX_PATH_LEN) entries
            let _ = stamped.path.push(transmitter);
        }
        stamped.hops = stamped.hops.saturating_add(1);
        stamped.to_bytes()
    }

    pub fn from_bytes(data: &[u8], rssi: u8) -> Result<Self, FrameError> {
        if data.len() < HEADER_LEN {
            return Err(FrameError::TooShort {
                need: HEADER_LEN,
                got: data.len(),
            });
        }
        if data.len() > MAX_FRAME_LEN {
            return Err(FrameError::TooLong(data.len()));
        }

        let frame_type = FrameType::from_u8(data[HDR_TYPE])?;
        let hops = data[HDR_HOPS];
        let path_len = (hops as usize).min(HDR_PATH_LEN);
        let path = Path::from_slice(&data[HDR_PATH..HDR_PATH + path_len])
            .map_err(|_| FrameError::TooShort {
                need: HDR_PATH + path_len,
                got: data.len(),
            })?;
        let payload = FramePayload::from_slice(&data[HEADER_LEN..]).map_err(|_| {
            FrameError::PayloadTooLarge {
                len: data.len() - HEADER_LEN,
                max: MAX_FRAME_PAYLOAD,
            }
        })?;

        Ok(Self {
            frame_type,
            src: data[HDR_SRC],
            dest: data[HDR_DEST],
            seq: data[HDR_SEQ],
            hops,
            path,
            payload,
            rssi,
        })
    }
}
