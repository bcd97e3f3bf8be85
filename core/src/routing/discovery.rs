//! Seam for a topology discovery procedure
//!
//! Discovery itself lives outside the router. The router calls `reset` when a
//! newer route set arrives and hands discovery frames to `handle_frame`.

use crate::transport::Frame;
use tracing::debug;

pub trait DiscoveryHook: Send + Sync {
    /// Forget any in-progress discovery round
    fn reset(&self) {}

    /// A DISCOVER_REQUEST or DISCOVER_RESPONSE frame arrived
    fn handle_frame(&self, frame: &Frame) {
        debug!(
            "ignoring {:?} from {}: no discovery procedure",
            frame.frame_type, frame.src
        );
    }
}

/// Discovery disabled: frames are ignored
pub struct NoDiscovery;

impl DiscoveryHook for NoDiscovery {}
