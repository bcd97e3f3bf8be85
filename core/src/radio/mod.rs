// Radio driver seam
//
// The transport only needs two operations from the radio: put a buffer on the
// air and wait for the next received buffer. Hardware drivers implement
// `Radio`; tests and the simulator use `SimMedium`.

pub mod sim;

use async_trait::async_trait;
use thiserror::Error;

pub use sim::{LinkQuality, SimMedium, SimRadio, Transmission};

/// Largest buffer the radio can carry in one transmission
pub const RADIO_MTU: usize = 76;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RadioError {
    #[error("Radio closed")]
    Closed,
    #[error("Buffer of {0} bytes exceeds radio MTU")]
    TooLong(usize),
    #[error("Transmit failed: {0}")]
    TransmitFailed(String),
}

/// One received buffer with the signal strength it arrived at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxBuffer {
    pub data: Vec<u8>,
    pub rssi: u8,
}

/// Half-duplex broadcast radio
#[async_trait]
pub trait Radio: Send + Sync + 'static {
    /// Transmit one buffer; returns once it is on the air
    async fn transmit(&self, data: &[u8]) -> Result<(), RadioError>;

    /// Wait for the next received buffer
    async fn receive(&self) -> Result<RxBuffer, RadioError>;
}
