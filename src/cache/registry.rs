//! Per-Shard Connection Registry
//!
//! Owns the transports toward every peer whose connection state belongs to
//! one shard. Mutations pass through a single-permit FIFO slot, so at most one
//! insert or remove runs at a time; lookups are synchronous and only ever see
//! the map before or after a mutation, never during one.
//!
//! Mutations are only accepted from a thread executing the cache's home shard
//! (see [`crate::shard::context`]). `stop` is terminal: once drained, the cache
//! rejects further mutations with [`Error::CacheStopped`].

use crate::cache::events::CacheEvent;
use crate::cache::metrics::{CacheStats, CacheStatsSnapshot, SlotStats};
use crate::config::CacheConfig;
use crate::domain::ports::{NodeId, ShardId, ShardPolicy, Transport};
use crate::error::{Error, Result, StopFailure};
use crate::shard::context::current_shard;
use crate::transport::ReconnectTransport;
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Semaphore, SemaphorePermit};
use tracing::{debug, info, warn};

/// Holds the mutation slot for the lifetime of one mutation
struct MutationGuard<'a> {
    _permit: SemaphorePermit<'a>,
    slot: &'a SlotStats,
}

impl Drop for MutationGuard<'_> {
    fn drop(&mut self) {
        self.slot.exit();
    }
}

/// Registry of transports owned by a single shard
pub struct ConnectionCache<T: Transport = ReconnectTransport> {
    /// Shard this instance belongs to
    shard: ShardId,
    /// Placement authority
    policy: Arc<dyn ShardPolicy>,
    /// Live entries
    cache: RwLock<HashMap<NodeId, Arc<T>>>,
    /// Single-permit slot serializing insert/remove/stop, closed once stopped
    mutation_slot: Semaphore,
    stats: CacheStats,
    slot_stats: SlotStats,
    event_tx: broadcast::Sender<CacheEvent>,
}

impl<T: Transport> std::fmt::Debug for ConnectionCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCache")
            .field("shard", &self.shard)
            .field("entries", &self.cache.read().len())
            .finish()
    }
}

impl<T: Transport> ConnectionCache<T> {
    /// Create the cache for `shard` with default configuration
    pub fn new(shard: ShardId, policy: Arc<dyn ShardPolicy>) -> Result<Self> {
        Self::with_config(shard, policy, CacheConfig::default())
    }

    /// Create the cache for `shard` with custom configuration
    pub fn with_config(
        shard: ShardId,
        policy: Arc<dyn ShardPolicy>,
        config: CacheConfig,
    ) -> Result<Self> {
        let shard_count = policy.shard_count();
        if shard >= shard_count {
            return Err(Error::InvalidShard { shard, shard_count });
        }
        let (event_tx, _) = broadcast::channel(config.event_channel_capacity.max(1));

        Ok(Self {
            shard,
            policy,
            cache: RwLock::new(HashMap::new()),
            mutation_slot: Semaphore::new(1),
            stats: CacheStats::default(),
            slot_stats: SlotStats::default(),
            event_tx,
        })
    }

    /// Shard this cache belongs to
    pub fn shard(&self) -> ShardId {
        self.shard
    }

    /// Placement policy used for affinity checks
    pub fn policy(&self) -> &Arc<dyn ShardPolicy> {
        &self.policy
    }

    /// Whether this shard owns `node`'s connection state
    pub fn owns(&self, node: NodeId) -> bool {
        self.policy.shard_for(node) == self.shard
    }

    /// Subscribe to cache events
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.event_tx.subscribe()
    }

    fn emit_event(&self, event: CacheEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Whether `stop` has drained this cache
    pub fn is_stopped(&self) -> bool {
        self.mutation_slot.is_closed()
    }

    fn check_home(&self, operation: &'static str) -> Result<()> {
        let current = current_shard();
        if current != Some(self.shard) {
            self.stats.record_affinity_violation();
            warn!(
                shard = self.shard,
                current = ?current,
                operation,
                "Rejected cache mutation from outside its home shard"
            );
            return Err(Error::OffShard {
                operation,
                shard: self.shard,
                current,
            });
        }
        Ok(())
    }

    fn check_affinity(&self, operation: &'static str, node: NodeId) -> Result<()> {
        self.check_home(operation)?;
        let owner = self.policy.shard_for(node);
        if owner != self.shard {
            self.stats.record_affinity_violation();
            warn!(
                node = %node,
                owner,
                shard = self.shard,
                operation,
                "Rejected mutation for node owned by another shard"
            );
            return Err(Error::ShardAffinityViolation {
                operation,
                node,
                owner,
                shard: self.shard,
            });
        }
        Ok(())
    }

    async fn begin_mutation(&self) -> Result<MutationGuard<'_>> {
        let permit = self
            .mutation_slot
            .acquire()
            .await
            .map_err(|_| Error::CacheStopped { shard: self.shard })?;
        self.slot_stats.enter();
        Ok(MutationGuard {
            _permit: permit,
            slot: &self.slot_stats,
        })
    }

    /// Build a transport from `config` and store it for `node`.
    ///
    /// Fails before touching the slot if the caller is not executing this
    /// cache's shard or `node` belongs to another shard. Any
    /// existing entry is replaced without being stopped; holders of the old
    /// handle keep it alive until they drop it.
    pub async fn insert(&self, node: NodeId, config: T::Config) -> Result<()> {
        self.check_affinity("insert", node)?;
        let _guard = self.begin_mutation().await?;

        let transport = Arc::new(T::build(config).await?);
        let addr = transport.server_addr();
        let previous = self.cache.write().insert(node, transport);

        self.stats.record_insert(previous.is_some());
        match previous {
            Some(previous) => {
                let previous_addr = previous.server_addr();
                warn!(
                    node = %node,
                    shard = self.shard,
                    addr = %addr,
                    previous_addr = %previous_addr,
                    "Replaced transport without stopping the previous one"
                );
                self.emit_event(CacheEvent::Replaced {
                    node,
                    shard: self.shard,
                    addr,
                    previous_addr,
                });
            }
            None => {
                debug!(node = %node, shard = self.shard, addr = %addr, "Inserted transport");
                self.emit_event(CacheEvent::Inserted {
                    node,
                    shard: self.shard,
                    addr,
                });
            }
        }
        Ok(())
    }

    /// Erase the entry for `node`, if any.
    ///
    /// The removed transport is not stopped.
    pub async fn remove(&self, node: NodeId) -> Result<()> {
        self.check_affinity("remove", node)?;
        let _guard = self.begin_mutation().await?;

        let removed = self.cache.write().remove(&node);
        self.stats.record_remove(removed.is_some());
        if removed.is_some() {
            debug!(node = %node, shard = self.shard, "Removed transport");
            self.emit_event(CacheEvent::Removed {
                node,
                shard: self.shard,
            });
        } else {
            debug!(node = %node, shard = self.shard, "Remove of absent node ignored");
        }
        Ok(())
    }

    /// Current transport for `node` on this shard
    pub fn lookup(&self, node: NodeId) -> Option<Arc<T>> {
        let found = self.cache.read().get(&node).cloned();
        self.slot_stats.record_lookup(found.is_some());
        found
    }

    /// Check if `node` has an entry
    pub fn contains(&self, node: NodeId) -> bool {
        self.cache.read().contains_key(&node)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.read().is_empty()
    }

    /// Sorted node ids with an entry
    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.cache.read().keys().copied().collect();
        nodes.sort_unstable();
        nodes
    }

    /// Statistics snapshot
    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot::capture(self.shard, self.len(), &self.stats, &self.slot_stats)
    }

    /// Drain the map and stop every drained transport concurrently.
    ///
    /// Waits for every shutdown even when some fail. The map is empty on
    /// return either way; failures come back together as
    /// [`Error::StopFailed`], ordered by node id. Mutations still waiting for
    /// the slot, and any issued later, fail with [`Error::CacheStopped`].
    /// Stopping an already stopped cache is a no-op.
    pub async fn stop(&self) -> Result<()> {
        self.check_home("stop")?;
        let Ok(_guard) = self.begin_mutation().await else {
            debug!(shard = self.shard, "Connection cache already stopped");
            return Ok(());
        };

        let drained: Vec<(NodeId, Arc<T>)> = self.cache.write().drain().collect();
        let total = drained.len();

        let results = join_all(drained.iter().map(|(node, transport)| async move {
            (*node, transport.stop().await)
        }))
        .await;

        let mut failures: Vec<StopFailure> = results
            .into_iter()
            .filter_map(|(node, result)| {
                result.err().map(|e| {
                    warn!(node = %node, shard = self.shard, error = %e, "Transport failed to stop");
                    StopFailure::new(node, e)
                })
            })
            .collect();
        failures.sort_by_key(|f| f.node);

        // waiters wake with CacheStopped while the slot is still held
        self.mutation_slot.close();

        self.stats.record_drain(failures.len() as u64);
        self.emit_event(CacheEvent::Drained {
            shard: self.shard,
            stopped: total - failures.len(),
            failed: failures.len(),
        });
        info!(
            shard = self.shard,
            stopped = total - failures.len(),
            failed = failures.len(),
            "Connection cache drained"
        );

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::StopFailed { failures })
        }
    }
}

impl<T: Transport> Drop for ConnectionCache<T> {
    fn drop(&mut self) {
        let remaining = self.cache.get_mut().len();
        if remaining > 0 {
            warn!(
                shard = self.shard,
                remaining, "Connection cache dropped without stop(), transports were not shut down"
            );
        }
    }
}
