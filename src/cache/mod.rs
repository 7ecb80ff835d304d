//! Per-Shard Connection Cache
//!
//! Each shard owns one [`ConnectionCache`] holding the transports toward the
//! peers whose connection state the placement policy assigns to it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     ConnectionCache (shard n)                            │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │   insert / remove / stop          lookup                                 │
//! │          │                           │                                   │
//! │  ┌───────┴────────┐                  │                                   │
//! │  │ Mutation Slot  │                  │                                   │
//! │  │ (1 permit FIFO)│                  │                                   │
//! │  └───────┬────────┘                  │                                   │
//! │          │                           │                                   │
//! │  ┌───────┴───────────────────────────┴──────────┐                        │
//! │  │        NodeId -> Arc<Transport>               │                        │
//! │  └───────────────────────────────────────────────┘                        │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  • Home shard and node affinity checked before any suspension           │
//! │  • Cache-line aligned stats       • Broadcast events                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use connection_cache::cache::ConnectionCache;
//! use connection_cache::config::TransportConfig;
//! use connection_cache::shard::{enter_shard, JumpHashPolicy};
//!
//! // mutations must run on the cache's shard
//! let _shard = enter_shard(0);
//! let policy = Arc::new(JumpHashPolicy::new(1)?);
//! let cache: ConnectionCache = ConnectionCache::new(0, policy)?;
//!
//! cache.insert(NodeId(1), TransportConfig::new(addr)).await?;
//! if let Some(transport) = cache.lookup(NodeId(1)) {
//!     transport.send(b"ping").await?;
//! }
//!
//! cache.stop().await?;
//! ```

pub mod events;
pub mod metrics;
pub mod registry;

pub use events::CacheEvent;
pub use metrics::{CacheStats, CacheStatsSnapshot, SlotStats, CACHE_LINE_SIZE};
pub use registry::ConnectionCache;
