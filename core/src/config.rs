// Stack configuration
//
// One StackConfig per node. Loaded from JSON; every field has a default so a
// file only needs to name what it overrides.

use crate::{is_valid_node_id, NodeId};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(String),
    #[error("Failed to parse config: {0}")]
    Parse(String),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    /// This node's address
    pub node_id: NodeId,

    /// Frames received below this RSSI are dropped
    pub rssi_threshold: u8,

    /// Bit `n` set means node `n` is treated as unreachable (bench topologies)
    pub topology_mask: u32,

    /// Window of the neighbor RSSI running average
    pub rssi_avg_count: u8,

    /// How long the transport waits for an ACK per attempt
    pub pkt_ack_timeout_ms: u64,

    /// Delay before the router retries a message whose transmission stalled
    pub tx_msg_retry_delay_ms: u64,

    /// Processing delay before answering a ping
    pub pong_delay_ms: u64,

    /// Interval between periodic message pings; an unanswered ping expires
    /// after one period
    pub ping_period_ms: u64,

    /// Replace a failed next hop with a random neighbor
    pub heal_routes: bool,

    /// Outbound frame slots in the transport
    pub tx_queue_size: usize,

    /// Inbound frames waiting for the router
    pub rcv_queue_size: usize,

    /// Forwarding entries in the router
    pub tx_msg_queue_size: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            rssi_threshold: 0,
            topology_mask: 0,
            rssi_avg_count: 5,
            pkt_ack_timeout_ms: 2000,
            tx_msg_retry_delay_ms: 2000,
            pong_delay_ms: 1000,
            ping_period_ms: 5000,
            heal_routes: false,
            tx_queue_size: 6,
            rcv_queue_size: 4,
            tx_msg_queue_size: 4,
        }
    }
}

impl StackConfig {
    /// Default config for the given node
    pub fn for_node(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: StackConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_json_str(&contents)
    }

    pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_node_id(self.node_id) {
            return Err(ConfigError::Invalid(format!(
                "node_id {} is not a valid node id",
                self.node_id
            )));
        }
        if self.ping_period_ms == 0 {
            return Err(ConfigError::Invalid("ping_period_ms must be non-zero".into()));
        }
        if self.rssi_avg_count == 0 {
            return Err(ConfigError::Invalid("rssi_avg_count must be at least 1".into()));
        }
        for (name, size) in [
            ("tx_queue_size", self.tx_queue_size),
            ("rcv_queue_size", self.rcv_queue_size),
            ("tx_msg_queue_size", self.tx_msg_queue_size),
        ] {
            if size == 0 {
                return Err(ConfigError::Invalid(format!("{} must be non-zero", name)));
            }
        }
        Ok(())
    }

    pub fn pkt_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.pkt_ack_timeout_ms)
    }

    pub fn tx_msg_retry_delay(&self) -> Duration {
        Duration::from_millis(self.tx_msg_retry_delay_ms)
    }

    pub fn pong_delay(&self) -> Duration {
        Duration::from_millis(self.pong_delay_ms)
    }

    pub fn ping_period(&self) -> Duration {
        Duration::from_millis(self.ping_period_ms)
    }
}
