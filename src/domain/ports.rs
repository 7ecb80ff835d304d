//! Domain Ports - Core trait definitions for the connection cache
//!
//! These traits define the boundaries between the per-shard registry and the
//! collaborators it consumes: the placement policy that decides which shard
//! owns a peer, and the transport that actually talks to the peer.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::str::FromStr;

// =============================================================================
// Identifiers
// =============================================================================

/// Identifier of a cluster peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub i32);

impl NodeId {
    pub fn new(id: i32) -> Self {
        Self(id)
    }

    pub fn get(&self) -> i32 {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for NodeId {
    fn from(id: i32) -> Self {
        Self(id)
    }
}

impl FromStr for NodeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<i32>()
            .map(NodeId)
            .map_err(|e| Error::Configuration(format!("Invalid node id '{}': {}", s, e)))
    }
}

/// Index of an execution shard, in `0..shard_count`
pub type ShardId = usize;

// =============================================================================
// Shard Ownership Port
// =============================================================================

/// Decides which shard owns the connection state of a peer.
///
/// Implementations must be pure: the same node always maps to the same shard
/// for the lifetime of a given shard count.
pub trait ShardPolicy: Send + Sync + 'static {
    /// Shard that owns `node`
    fn shard_for(&self, node: NodeId) -> ShardId;

    /// Number of shards the policy places nodes onto
    fn shard_count(&self) -> usize;
}

// =============================================================================
// Transport Port
// =============================================================================

/// A logical, self-healing connection to one peer.
///
/// The registry only ever builds a transport and, on drain, asks it to stop.
/// Everything in between (dialing, retry, I/O) belongs to the implementation.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Value describing how to reach the peer
    type Config: Send + 'static;

    /// Construct a transport from its configuration
    async fn build(config: Self::Config) -> Result<Self>
    where
        Self: Sized;

    /// Address of the peer this transport targets
    fn server_addr(&self) -> SocketAddr;

    /// Whether the transport currently holds a usable connection
    fn is_valid(&self) -> bool;

    /// Shut the transport down
    async fn stop(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_parse() {
        assert_eq!("42".parse::<NodeId>().unwrap(), NodeId(42));
        assert_eq!(" -1 ".parse::<NodeId>().unwrap(), NodeId(-1));
        assert!("node-1".parse::<NodeId>().is_err());
    }

    #[test]
    fn test_node_id_ordering() {
        let mut ids = vec![NodeId(3), NodeId(-2), NodeId(10), NodeId(0)];
        ids.sort();
        assert_eq!(ids, vec![NodeId(-2), NodeId(0), NodeId(3), NodeId(10)]);
    }

    #[test]
    fn test_node_id_serde_transparent() {
        let json = serde_json::to_string(&NodeId(5)).unwrap();
        assert_eq!(json, "5");
        let id: NodeId = serde_json::from_str("7").unwrap();
        assert_eq!(id, NodeId(7));
    }
}
