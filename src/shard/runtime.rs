//! Shard Set
//!
//! Hosts one [`ConnectionCache`] per shard on a dedicated OS thread running a
//! single-threaded tokio runtime. The only way to reach a shard's cache is to
//! send it a task through [`ShardSet::invoke_on`], so every mutation of a
//! cache executes on the thread that owns it. Each shard thread enters its
//! shard in [`crate::shard::context`], which is what the cache checks.

use crate::cache::{CacheStatsSnapshot, ConnectionCache};
use crate::config::CacheConfig;
use crate::domain::ports::{NodeId, ShardId, ShardPolicy, Transport};
use crate::error::{Error, Result, StopFailure};
use crate::shard::context::enter_shard;
use crate::shard::policy::JumpHashPolicy;
use crate::transport::ReconnectTransport;
use futures::future::{join_all, FutureExt, LocalBoxFuture};
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::{mpsc, oneshot};
use tokio::task::LocalSet;
use tracing::{debug, error, info, warn};

/// Work item executed on a shard thread
type Task<T> = Box<dyn FnOnce(Arc<ConnectionCache<T>>) -> LocalBoxFuture<'static, ()> + Send>;

/// Thread-per-shard host for connection caches
pub struct ShardSet<T: Transport = ReconnectTransport> {
    policy: Arc<dyn ShardPolicy>,
    /// Task queues, `None` once the shard has been stopped
    senders: RwLock<Vec<Option<mpsc::UnboundedSender<Task<T>>>>>,
    threads: Mutex<Vec<(ShardId, JoinHandle<()>)>>,
}

impl<T: Transport> std::fmt::Debug for ShardSet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardSet")
            .field("shard_count", &self.shard_count())
            .field("running", &self.running_shards())
            .finish()
    }
}

impl<T: Transport> ShardSet<T> {
    /// Start `shard_count` shards placed by jump consistent hashing
    pub fn with_shards(shard_count: usize) -> Result<Self> {
        Self::start(
            Arc::new(JumpHashPolicy::new(shard_count)?),
            CacheConfig::default(),
        )
    }

    /// Start one thread per shard of `policy`
    pub fn start(policy: Arc<dyn ShardPolicy>, config: CacheConfig) -> Result<Self> {
        let shard_count = policy.shard_count();
        if shard_count == 0 {
            return Err(Error::Configuration("shard count must be at least 1".into()));
        }

        let mut senders = Vec::with_capacity(shard_count);
        let mut threads = Vec::with_capacity(shard_count);

        for shard in 0..shard_count {
            let cache = Arc::new(ConnectionCache::with_config(
                shard,
                policy.clone(),
                config.clone(),
            )?);
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            let (tx, rx) = mpsc::unbounded_channel::<Task<T>>();

            let handle = thread::Builder::new()
                .name(format!("shard-{shard}"))
                .spawn(move || run_shard(shard, runtime, cache, rx))?;

            senders.push(Some(tx));
            threads.push((shard, handle));
        }

        info!(shard_count, "Shard set started");

        Ok(Self {
            policy,
            senders: RwLock::new(senders),
            threads: Mutex::new(threads),
        })
    }

    /// Number of shards
    pub fn shard_count(&self) -> usize {
        self.policy.shard_count()
    }

    /// Placement policy shared by every shard
    pub fn policy(&self) -> &Arc<dyn ShardPolicy> {
        &self.policy
    }

    /// Shard owning `node`
    pub fn shard_for(&self, node: NodeId) -> ShardId {
        self.policy.shard_for(node)
    }

    /// Number of shards still accepting work
    pub fn running_shards(&self) -> usize {
        self.senders.read().iter().filter(|s| s.is_some()).count()
    }

    /// Run `f` against `shard`'s cache on that shard's thread.
    ///
    /// The future returned by `f` need not be `Send`; only its output crosses
    /// back to the caller.
    pub async fn invoke_on<F, Fut, R>(&self, shard: ShardId, f: F) -> Result<R>
    where
        F: FnOnce(Arc<ConnectionCache<T>>) -> Fut + Send + 'static,
        Fut: Future<Output = R> + 'static,
        R: Send + 'static,
    {
        let (task, reply_rx) = into_task(f);

        {
            let senders = self.senders.read();
            let sender = senders.get(shard).ok_or(Error::InvalidShard {
                shard,
                shard_count: senders.len(),
            })?;
            sender
                .as_ref()
                .ok_or(Error::ShardUnavailable { shard })?
                .send(task)
                .map_err(|_| Error::ShardUnavailable { shard })?;
        }

        reply_rx.await.map_err(|_| lost_reply(shard))
    }

    /// Run `f` on the shard owning `node`
    pub async fn invoke_on_owner<F, Fut, R>(&self, node: NodeId, f: F) -> Result<R>
    where
        F: FnOnce(Arc<ConnectionCache<T>>) -> Fut + Send + 'static,
        Fut: Future<Output = R> + 'static,
        R: Send + 'static,
    {
        self.invoke_on(self.shard_for(node), f).await
    }

    /// Insert a transport for `node` on its owning shard
    pub async fn insert(&self, node: NodeId, config: T::Config) -> Result<()> {
        self.invoke_on_owner(node, move |cache| async move { cache.insert(node, config).await })
            .await?
    }

    /// Remove `node`'s entry on its owning shard
    pub async fn remove(&self, node: NodeId) -> Result<()> {
        self.invoke_on_owner(node, move |cache| async move { cache.remove(node).await })
            .await?
    }

    /// Look up `node`'s transport on its owning shard
    pub async fn lookup(&self, node: NodeId) -> Result<Option<Arc<T>>> {
        self.invoke_on_owner(node, move |cache| async move { cache.lookup(node) })
            .await
    }

    /// Stats snapshot of every running shard, ordered by shard
    pub async fn stats(&self) -> Vec<CacheStatsSnapshot> {
        let snapshots = join_all(
            (0..self.shard_count())
                .map(|shard| self.invoke_on(shard, |cache| async move { cache.stats() })),
        )
        .await;
        snapshots
            .into_iter()
            .enumerate()
            .filter_map(|(shard, snapshot)| match snapshot {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    debug!(shard, error = %e, "Skipping stats of unreachable shard");
                    None
                }
            })
            .collect()
    }

    /// Drain every shard's cache concurrently, then join the shard threads.
    ///
    /// The drain is the last task each shard queue ever accepts: it is queued
    /// and the queue closed under one lock, so mutations issued concurrently
    /// either run before the drain or fail with [`Error::ShardUnavailable`].
    /// Every shard is drained even if some fail; node-level shutdown failures
    /// from all shards are returned together, ordered by node. Calling this
    /// again once stopped is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let mut shard_errors: Vec<String> = Vec::new();

        let pending: Vec<_> = {
            let mut senders = self.senders.write();
            senders
                .iter_mut()
                .enumerate()
                .filter_map(|(shard, slot)| {
                    let sender = slot.take()?;
                    let (task, reply_rx) = into_task(|cache: Arc<ConnectionCache<T>>| async move {
                        cache.stop().await
                    });
                    match sender.send(task) {
                        Ok(()) => Some((shard, reply_rx)),
                        Err(_) => {
                            shard_errors.push(format!("shard {shard}: not running"));
                            None
                        }
                    }
                })
                .collect()
        };

        let drains = join_all(
            pending
                .into_iter()
                .map(|(shard, reply_rx)| async move { (shard, reply_rx.await) }),
        )
        .await;

        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        let joins = join_all(threads.into_iter().map(|(shard, handle)| async move {
            let joined = tokio::task::spawn_blocking(move || handle.join()).await;
            (shard, matches!(joined, Ok(Ok(()))))
        }))
        .await;

        let mut failures: Vec<StopFailure> = Vec::new();

        for (shard, drain) in drains {
            match drain {
                Ok(Ok(())) => {}
                Ok(Err(Error::StopFailed { failures: shard_failures })) => {
                    failures.extend(shard_failures)
                }
                Ok(Err(e)) => {
                    error!(shard, error = %e, "Shard failed to drain");
                    shard_errors.push(format!("shard {shard}: {e}"));
                }
                Err(_) => {
                    let e = lost_reply(shard);
                    error!(shard, error = %e, "Shard failed to drain");
                    shard_errors.push(e.to_string());
                }
            }
        }
        for (shard, clean) in joins {
            if !clean {
                error!(shard, "Shard thread panicked");
                shard_errors.push(format!("shard {shard}: thread panicked"));
            }
        }

        info!(
            failures = failures.len(),
            shard_errors = shard_errors.len(),
            "Shard set stopped"
        );

        if !failures.is_empty() {
            failures.sort_by_key(|f| f.node);
            if !shard_errors.is_empty() {
                warn!(errors = ?shard_errors, "Shard errors suppressed by transport failures");
            }
            return Err(Error::StopFailed { failures });
        }
        if !shard_errors.is_empty() {
            return Err(Error::Internal(shard_errors.join("; ")));
        }
        Ok(())
    }
}

/// Box `f` into a shard task whose output is sent back on the returned channel
fn into_task<T, F, Fut, R>(f: F) -> (Task<T>, oneshot::Receiver<R>)
where
    T: Transport,
    F: FnOnce(Arc<ConnectionCache<T>>) -> Fut + Send + 'static,
    Fut: Future<Output = R> + 'static,
    R: Send + 'static,
{
    let (reply_tx, reply_rx) = oneshot::channel();
    let task: Task<T> = Box::new(move |cache: Arc<ConnectionCache<T>>| {
        async move {
            let _ = reply_tx.send(f(cache).await);
        }
        .boxed_local()
    });
    (task, reply_rx)
}

fn lost_reply(shard: ShardId) -> Error {
    Error::Internal(format!("task on shard {shard} ended without a reply"))
}

/// Shard thread body: serve tasks until the queue closes, then finish any
/// tasks still in flight
fn run_shard<T: Transport>(
    shard: ShardId,
    runtime: tokio::runtime::Runtime,
    cache: Arc<ConnectionCache<T>>,
    mut rx: mpsc::UnboundedReceiver<Task<T>>,
) {
    let _shard = enter_shard(shard);
    debug!(shard, "Shard thread running");
    let local = LocalSet::new();

    local.block_on(&runtime, async {
        while let Some(task) = rx.recv().await {
            tokio::task::spawn_local(task(cache.clone()));
        }
    });
    runtime.block_on(local);

    debug!(shard, "Shard thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use assert_matches::assert_matches;
    use crate::shard::context::current_shard;
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(port: u16) -> TransportConfig {
        TransportConfig::new(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    /// Transport whose shutdown fails for ports above 10000
    struct FlakyTransport {
        addr: SocketAddr,
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        type Config = SocketAddr;

        async fn build(addr: SocketAddr) -> Result<Self> {
            Ok(Self { addr })
        }

        fn server_addr(&self) -> SocketAddr {
            self.addr
        }

        fn is_valid(&self) -> bool {
            true
        }

        async fn stop(&self) -> Result<()> {
            if self.addr.port() > 10000 {
                return Err(Error::NotConnected { addr: self.addr });
            }
            Ok(())
        }
    }

    /// Counts every transport built and every shutdown requested
    #[derive(Debug, Default)]
    struct Lifecycle {
        builds: AtomicUsize,
        stops: AtomicUsize,
    }

    struct CountingTransport {
        lifecycle: Arc<Lifecycle>,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        type Config = Arc<Lifecycle>;

        async fn build(lifecycle: Arc<Lifecycle>) -> Result<Self> {
            lifecycle.builds.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(Self { lifecycle })
        }

        fn server_addr(&self) -> SocketAddr {
            SocketAddr::from(([127, 0, 0, 1], 9000))
        }

        fn is_valid(&self) -> bool {
            true
        }

        async fn stop(&self) -> Result<()> {
            self.lifecycle.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_zero_shards_rejected() {
        assert_matches!(
            ShardSet::<ReconnectTransport>::with_shards(0),
            Err(Error::Configuration(_))
        );
    }

    #[tokio::test]
    async fn test_invoke_on_runs_on_shard_thread() {
        let set: ShardSet = ShardSet::with_shards(3).unwrap();

        for shard in 0..3 {
            let (name, current, home) = set
                .invoke_on(shard, |cache| async move {
                    (
                        thread::current().name().map(str::to_owned),
                        current_shard(),
                        cache.shard(),
                    )
                })
                .await
                .unwrap();
            assert_eq!(name.as_deref(), Some(format!("shard-{shard}").as_str()));
            assert_eq!(current, Some(shard));
            assert_eq!(home, shard);
        }

        set.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_invoke_on_unknown_shard() {
        let set: ShardSet = ShardSet::with_shards(2).unwrap();
        let result = set.invoke_on(5, |cache| async move { cache.len() }).await;
        assert_matches!(
            result,
            Err(Error::InvalidShard {
                shard: 5,
                shard_count: 2
            })
        );
        set.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_insert_routes_to_owner() {
        let set: ShardSet = ShardSet::with_shards(4).unwrap();

        for id in 0..16 {
            set.insert(NodeId(id), config(9000 + id as u16)).await.unwrap();
        }

        for id in 0..16 {
            let node = NodeId(id);
            let transport = set.lookup(node).await.unwrap().unwrap();
            assert_eq!(transport.server_addr().port(), 9000 + id as u16);

            let owner = set.shard_for(node);
            for shard in 0..4 {
                let present = set
                    .invoke_on(shard, move |cache| async move { cache.contains(node) })
                    .await
                    .unwrap();
                assert_eq!(present, shard == owner);
            }
        }

        let entries: usize = set.stats().await.iter().map(|s| s.entries).sum();
        assert_eq!(entries, 16);

        set.remove(NodeId(3)).await.unwrap();
        assert!(set.lookup(NodeId(3)).await.unwrap().is_none());

        set.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_shard_mutation_through_invoke_on() {
        let set: ShardSet = ShardSet::with_shards(2).unwrap();
        let node = NodeId(11);
        let other = 1 - set.shard_for(node);

        let result = set
            .invoke_on(other, move |cache| async move {
                cache.insert(node, config(9011)).await
            })
            .await
            .unwrap();
        assert_matches!(result, Err(Error::ShardAffinityViolation { .. }));
        assert!(set.lookup(node).await.unwrap().is_none());

        set.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_cache_taken_off_shard_rejects_mutations() {
        let set: ShardSet = ShardSet::with_shards(2).unwrap();
        let node = NodeId(11);
        let owner = set.shard_for(node);

        let cache = set
            .invoke_on(owner, |cache| async move { cache })
            .await
            .unwrap();
        assert_eq!(current_shard(), None);

        assert_matches!(
            cache.insert(node, config(9011)).await,
            Err(Error::OffShard {
                operation: "insert",
                current: None,
                ..
            })
        );
        assert_matches!(cache.stop().await, Err(Error::OffShard { .. }));
        assert!(set.lookup(node).await.unwrap().is_none());

        drop(cache);
        set.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_racing_inserts_never_abandons_transports() {
        for inserts_first in [true, false] {
            let set: ShardSet<CountingTransport> = ShardSet::with_shards(2).unwrap();
            let lifecycle = Arc::new(Lifecycle::default());

            let inserts = join_all((0..16).map(|id| set.insert(NodeId(id), lifecycle.clone())));
            let (stopped, inserted) = if inserts_first {
                let (inserted, stopped) = tokio::join!(inserts, set.stop());
                (stopped, inserted)
            } else {
                tokio::join!(set.stop(), inserts)
            };

            stopped.unwrap();
            for result in inserted {
                if let Err(e) = result {
                    assert_matches!(
                        e,
                        Error::ShardUnavailable { .. } | Error::CacheStopped { .. }
                    );
                }
            }
            assert_eq!(set.running_shards(), 0);
            assert_eq!(
                lifecycle.builds.load(Ordering::SeqCst),
                lifecycle.stops.load(Ordering::SeqCst)
            );
            if inserts_first {
                assert_eq!(lifecycle.stops.load(Ordering::SeqCst), 16);
            }
        }
    }

    #[tokio::test]
    async fn test_stop_drains_every_shard_and_is_idempotent() {
        let set: ShardSet = ShardSet::with_shards(3).unwrap();
        for id in 0..9 {
            set.insert(NodeId(id), config(9100 + id as u16)).await.unwrap();
        }
        let handle = set.lookup(NodeId(4)).await.unwrap().unwrap();

        set.stop().await.unwrap();

        assert!(handle.is_stopped());
        assert_eq!(set.running_shards(), 0);
        assert_matches!(
            set.insert(NodeId(1), config(9101)).await,
            Err(Error::ShardUnavailable { .. })
        );
        assert!(set.stats().await.is_empty());
        set.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_collects_failures_from_all_shards() {
        let set: ShardSet<FlakyTransport> = ShardSet::with_shards(4).unwrap();
        for id in 0..12 {
            let port = if id % 4 == 0 { 20000 + id as u16 } else { 9000 };
            set.insert(NodeId(id), SocketAddr::from(([127, 0, 0, 1], port)))
                .await
                .unwrap();
        }

        match set.stop().await {
            Err(Error::StopFailed { failures }) => {
                let nodes: Vec<NodeId> = failures.iter().map(|f| f.node).collect();
                assert_eq!(nodes, vec![NodeId(0), NodeId(4), NodeId(8)]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(set.running_shards(), 0);
    }
}
