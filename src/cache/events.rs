//! Cache Events
//!
//! Events emitted by a shard's connection cache for external consumers to
//! react to connection lifecycle changes.

use crate::domain::ports::{NodeId, ShardId};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Events emitted by the connection cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheEvent {
    /// A transport was created for a node with no previous entry
    Inserted {
        node: NodeId,
        shard: ShardId,
        addr: SocketAddr,
    },

    /// A transport replaced the existing entry for a node
    Replaced {
        node: NodeId,
        shard: ShardId,
        addr: SocketAddr,
        previous_addr: SocketAddr,
    },

    /// An entry was erased from the map
    Removed { node: NodeId, shard: ShardId },

    /// Every entry was drained and asked to stop
    Drained {
        shard: ShardId,
        stopped: usize,
        failed: usize,
    },
}

impl CacheEvent {
    /// Node the event concerns, if it concerns a single node
    pub fn node(&self) -> Option<NodeId> {
        match self {
            CacheEvent::Inserted { node, .. }
            | CacheEvent::Replaced { node, .. }
            | CacheEvent::Removed { node, .. } => Some(*node),
            CacheEvent::Drained { .. } => None,
        }
    }

    /// Shard that emitted the event
    pub fn shard(&self) -> ShardId {
        match self {
            CacheEvent::Inserted { shard, .. }
            | CacheEvent::Replaced { shard, .. }
            | CacheEvent::Removed { shard, .. }
            | CacheEvent::Drained { shard, .. } => *shard,
        }
    }
}

impl std::fmt::Display for CacheEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheEvent::Inserted { node, shard, addr } => {
                write!(f, "inserted node {} -> {} on shard {}", node, addr, shard)
            }
            CacheEvent::Replaced {
                node, shard, addr, ..
            } => write!(f, "replaced node {} -> {} on shard {}", node, addr, shard),
            CacheEvent::Removed { node, shard } => {
                write!(f, "removed node {} on shard {}", node, shard)
            }
            CacheEvent::Drained {
                shard,
                stopped,
                failed,
            } => write!(
                f,
                "drained shard {} ({} stopped, {} failed)",
                shard, stopped, failed
            ),
        }
    }
}
