//! Next-hop routing table
//!
//! One next hop per destination plus the version of the route set it came
//! from. Route sets are distributed as a full `MAX_NODES x MAX_NODES` matrix;
//! each node keeps only its own row.

use super::RouterError;
use crate::{is_valid_node_id, NodeId, INVALID_NODE_ID, MAX_NODES};

/// `matrix[node][dest]` is the next hop from `node` toward `dest`
pub type RouteMatrix = [[NodeId; MAX_NODES]; MAX_NODES];

pub const ROUTES_VERSION: usize = 0;
pub const ROUTES_MATRIX: usize = 1;
pub const ROUTES_PAYLOAD_LEN: usize = ROUTES_MATRIX + MAX_NODES * MAX_NODES;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RoutingTable {
    routes: [NodeId; MAX_NODES],
    version: u8,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    /// Next hop toward `dest`, if one is known
    pub fn next_hop(&self, dest: NodeId) -> Option<NodeId> {
        if !is_valid_node_id(dest) {
            return None;
        }
        Some(self.routes[dest as usize]).filter(|hop| is_valid_node_id(*hop))
    }

    pub fn set_route(&mut self, dest: NodeId, next_hop: NodeId) -> Result<(), RouterError> {
        check_id(dest)?;
        check_id(next_hop)?;
        self.routes[dest as usize] = next_hop;
        Ok(())
    }

    pub fn clear_route(&mut self, dest: NodeId) -> Result<(), RouterError> {
        check_id(dest)?;
        self.routes[dest as usize] = INVALID_NODE_ID;
        Ok(())
    }

    /// Route every destination through `next_hop`
    pub fn set_all(&mut self, next_hop: NodeId) -> Result<(), RouterError> {
        check_id(next_hop)?;
        for dest in 1..MAX_NODES {
            self.routes[dest] = next_hop;
        }
        Ok(())
    }

    pub fn clear_all(&mut self) {
        self.routes = [INVALID_NODE_ID; MAX_NODES];
    }

    /// Take `node`'s row of a distributed route set
    pub fn install(&mut self, matrix: &RouteMatrix, node: NodeId, version: u8) {
        if let Some(row) = matrix.get(node as usize) {
            self.routes = *row;
        }
        self.version = version;
    }

    /// Serial-number comparison over the u8 space.
    ///
    /// `version` is newer when `version - current` (wrapping) falls in
    /// `1..128`, so anything up to 127 steps ahead is accepted across the
    /// wrap and anything 128 or more steps ahead counts as old. With the
    /// table at 5, version 6 and 132 are newer while 133, 200 and 5 itself
    /// are not.
    pub fn is_newer(&self, version: u8) -> bool {
        let delta = version.wrapping_sub(self.version);
        delta != 0 && delta < 0x80
    }

    /// `(dest, next_hop)` pairs for every known route
    pub fn entries(&self) -> impl Iterator<Item = (NodeId, NodeId)> + '_ {
        (1..MAX_NODES as NodeId).filter_map(|dest| self.next_hop(dest).map(|hop| (dest, hop)))
    }
}

fn check_id(id: NodeId) -> Result<(), RouterError> {
    if is_valid_node_id(id) {
        Ok(())
    } else {
        Err(RouterError::InvalidNodeId(id))
    }
}

/// Routes for a line of nodes: toward ids later in `ids` go right, earlier
/// ones go left
pub fn line_routes(ids: &[NodeId]) -> RouteMatrix {
    let mut matrix: RouteMatrix = [[INVALID_NODE_ID; MAX_NODES]; MAX_NODES];
    for (pos, &node) in ids.iter().enumerate() {
        for (other, &dest) in ids.iter().enumerate() {
            if other > pos {
                matrix[node as usize][dest as usize] = ids[pos + 1];
            } else if other < pos {
                matrix[node as usize][dest as usize] = ids[pos - 1];
            }
        }
    }
    matrix
}

pub fn encode_routes(matrix: &RouteMatrix, version: u8) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ROUTES_PAYLOAD_LEN);
    buf.push(version);
    for row in matrix {
        buf.extend_from_slice(row);
    }
    buf
}

pub fn decode_routes(payload: &[u8]) -> Result<(u8, RouteMatrix), RouterError> {
    if payload.len() < ROUTES_PAYLOAD_LEN {
        return Err(RouterError::MalformedMessage(payload.len()));
    }
    let mut matrix = [[INVALID_NODE_ID; MAX_NODES]; MAX_NODES];
    for (node, row) in matrix.iter_mut().enumerate() {
        let start = ROUTES_MATRIX + node * MAX_NODES;
        row.copy_from_slice(&payload[start..start + MAX_NODES]);
    }
    Ok((payload[ROUTES_VERSION], matrix))
}
