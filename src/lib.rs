//! Connection Cache - Per-Shard RPC Connection Registry
//!
//! Owns the client connections a thread-per-core node keeps toward its cluster
//! peers. Each peer's connection state lives on exactly one shard, mutations
//! to it are serialized, and shutdown drains every connection.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                                 ShardSet                                     │
//! │              invoke_on(shard, f)  /  invoke_on_owner(node, f)                │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                        ┌───────────────────────┐                             │
//! │                        │   Shard Policy        │                             │
//! │                        │   (jump hash)         │                             │
//! │                        └───────────┬───────────┘                             │
//! │           ┌────────────────────────┼────────────────────────┐                │
//! │  ┌────────┴────────┐      ┌────────┴────────┐      ┌────────┴────────┐       │
//! │  │    shard-0      │      │    shard-1      │      │    shard-N      │       │
//! │  │ ConnectionCache │      │ ConnectionCache │ ...  │ ConnectionCache │       │
//! │  └────────┬────────┘      └────────┬────────┘      └────────┬────────┘       │
//! ├───────────┼────────────────────────┼────────────────────────┼────────────────┤
//! │  ┌────────┴────────┐      ┌────────┴────────┐      ┌────────┴────────┐       │
//! │  │  Reconnecting   │      │  Reconnecting   │      │  Reconnecting   │       │
//! │  │  Transports     │      │  Transports     │      │  Transports     │       │
//! │  └─────────────────┘      └─────────────────┘      └─────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`cache`]: Per-shard connection registry, stats and events
//! - [`shard`]: Shard placement policy, execution context and the thread-per-shard host
//! - [`transport`]: Reconnecting TCP transport
//! - [`config`]: Transport, backoff, cache and membership configuration
//! - [`domain`]: Core domain types and traits
//! - [`error`]: Error types and handling

pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod shard;
pub mod transport;

// Re-export commonly used types
pub use cache::{CacheEvent, CacheStatsSnapshot, ConnectionCache};

pub use config::{load_members, BackoffConfig, CacheConfig, Member, TransportConfig};

pub use domain::ports::{NodeId, ShardId, ShardPolicy, Transport};

pub use error::{Error, ErrorAction, Result, StopFailure};

pub use shard::{current_shard, enter_shard, JumpHashPolicy, ShardSet};

pub use transport::ReconnectTransport;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
