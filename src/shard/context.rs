//! Shard Execution Context
//!
//! Records which shard, if any, the calling thread executes. Shard threads
//! enter their shard for their whole lifetime; the connection cache consults
//! this before every mutation.

use crate::domain::ports::ShardId;
use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    static CURRENT_SHARD: Cell<Option<ShardId>> = const { Cell::new(None) };
}

/// Shard executed by the calling thread, `None` off-shard
pub fn current_shard() -> Option<ShardId> {
    CURRENT_SHARD.with(Cell::get)
}

/// Mark the calling thread as executing `shard` until the guard drops.
///
/// [`ShardSet`](crate::shard::ShardSet) does this for its own threads. Hosts
/// that drive a [`ConnectionCache`](crate::cache::ConnectionCache) from their
/// own threads must enter the cache's shard first.
pub fn enter_shard(shard: ShardId) -> ShardGuard {
    let previous = CURRENT_SHARD.with(|current| current.replace(Some(shard)));
    ShardGuard {
        previous,
        _not_send: PhantomData,
    }
}

/// Restores the previous shard of the thread on drop
#[must_use = "the thread leaves the shard as soon as the guard drops"]
#[derive(Debug)]
pub struct ShardGuard {
    previous: Option<ShardId>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ShardGuard {
    fn drop(&mut self) {
        CURRENT_SHARD.with(|current| current.set(self.previous));
    }
}
