//! Shard placement and hosting
//!
//! [`policy`] decides which shard owns a node's connection state;
//! [`context`] tells code which shard it is executing on;
//! [`runtime`] runs one connection cache per shard on its own thread.

pub mod context;
pub mod policy;
pub mod runtime;

pub use context::{current_shard, enter_shard, ShardGuard};
pub use policy::{jump_consistent_hash, JumpHashPolicy};
pub use runtime::ShardSet;
