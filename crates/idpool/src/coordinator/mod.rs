//! Cluster-aware allocation of unique ids to caller keys.
//!
//! This module defines [`AllocationCoordinator`], the entry point of the
//! crate. Every node of a cluster runs one coordinator against a shared
//! [`Store`] and [`LockService`]; together they hand out ids from named pools
//! so that no id is ever held by two keys at once.
//!
//! ## Responsibilities
//!
//! - Serve allocations from a per-node [`LocalPoolCache`] and refill it from
//!   the persisted [`GlobalPool`] when it runs dry.
//! - Keep repeated allocations for the same key idempotent, and collapse
//!   concurrent ones into a single unit of work.
//! - Quarantine released ids so they are not reissued too soon, and hand
//!   surplus quarantine back to the cluster in the background.
//! - Persist every mapping change through an ordered, retried job queue.
//!
//! ## Locking
//!
//! Per-key work runs under the `key:<pool>/<key>` lock and anything touching
//! the pool record runs under `pool:<pool>`. When both are needed the key lock
//! is always taken first.

mod lease;
mod lifecycle;
mod persist;
mod replenish;
mod single_flight;

use crate::{
    ChildPool, CoordinatorConfig, Error, GlobalPool, JobQueue, JobStats, LocalPoolCache,
    LockService, PoolStats, Result, ScheduledTask, Scheduler, Store, SystemClock, TimeSource,
    Transaction, key_lock, pool_lock,
    record::{decode, encode, paths, validate_key, validate_name},
};
use core::time::Duration;
use parking_lot::{Mutex, RwLock};
use persist::EntryChange;
use portable_atomic::{AtomicBool, AtomicU64, Ordering};
use single_flight::{Latches, Role, SingleFlight};
use std::{collections::HashMap, sync::Arc};
use tokio_util::sync::CancellationToken;

#[cfg(feature = "tracing")]
use tracing::instrument;

/// A node's cache of one pool plus the pool parameters it needs locally.
#[derive(Debug)]
pub(crate) struct PoolHandle {
    pub(crate) cache: LocalPoolCache,
    pub(crate) block_size: u64,
    pub(crate) quarantine_delay_secs: u64,
    /// Set for lease-mode pools, which bypass the cache.
    pub(crate) lease_ttl_secs: Option<u64>,
    /// Last access stamp this node persisted in the pool's `child_pools`.
    last_claimed: AtomicU64,
}

impl PoolHandle {
    /// Builds a handle for `global`, restoring this node's persisted child
    /// bookkeeping unless a sibling has reclaimed it.
    fn restore(global: &GlobalPool, node: &str, child: Option<ChildPool>) -> Self {
        let cache = match child {
            Some(child) if !child.reclaimed => {
                LocalPoolCache::from_parts(&global.name, child.range, child.quarantine)
            }
            _ => LocalPoolCache::new(&global.name),
        };
        Self {
            cache,
            block_size: global.block_size,
            quarantine_delay_secs: global.quarantine_delay_secs,
            lease_ttl_secs: global.lease_ttl_secs,
            last_claimed: AtomicU64::new(global.child_pools.get(node).copied().unwrap_or(0)),
        }
    }

    /// Records a committed access stamp.
    pub(crate) fn claimed(&self, now: u64) {
        self.last_claimed.fetch_max(now, Ordering::AcqRel);
    }

    /// Whether a sibling could be close to treating this node as idle.
    ///
    /// Reclamation needs `idle_threshold` without a stamp; a cache is only
    /// served without re-checking its child record for the first half of it.
    pub(crate) fn claim_is_stale(&self, now: u64, idle_threshold: Duration) -> bool {
        let age = now.saturating_sub(self.last_claimed.load(Ordering::Acquire));
        age.saturating_mul(2) >= idle_threshold.as_secs()
    }
}

struct Inner<S, L, C> {
    config: CoordinatorConfig,
    store: S,
    locks: L,
    clock: C,
    pools: RwLock<HashMap<String, Arc<PoolHandle>>>,
    flights: SingleFlight,
    latches: Latches,
    housekeeping: Mutex<HashMap<String, ScheduledTask>>,
    scheduler: Scheduler,
    jobs: JobQueue,
    ready: AtomicBool,
    shutdown_token: CancellationToken,
}

/// Allocates ids from named pools on behalf of caller-supplied keys.
///
/// Cheap to clone; clones share the same node state. Must be used from within
/// a Tokio runtime.
///
/// # Example
///
/// ```
/// use idpool::{AllocationCoordinator, CoordinatorConfig, MemoryLockService, MemoryStore, SystemClock};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> idpool::Result<()> {
/// let coordinator = AllocationCoordinator::new(
///     CoordinatorConfig::new("node-a"),
///     MemoryStore::new(),
///     MemoryLockService::new(),
///     SystemClock,
/// );
/// coordinator.start().await?;
/// coordinator.create_pool("vlans", 1, 100).await?;
///
/// let id = coordinator.allocate("vlans", "tenant-1").await?;
/// assert_eq!(coordinator.allocate("vlans", "tenant-1").await?, id);
///
/// assert_eq!(coordinator.release("vlans", "tenant-1").await?, vec![id]);
/// coordinator.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct AllocationCoordinator<S, L, C = SystemClock> {
    inner: Arc<Inner<S, L, C>>,
}

impl<S, L, C> Clone for AllocationCoordinator<S, L, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, L, C> AllocationCoordinator<S, L, C>
where
    S: Store,
    L: LockService,
    C: TimeSource,
{
    pub fn new(config: CoordinatorConfig, store: S, locks: L, clock: C) -> Self {
        let jobs = JobQueue::new(config.jobs);
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                locks,
                clock,
                pools: RwLock::new(HashMap::new()),
                flights: SingleFlight::default(),
                latches: Latches::default(),
                housekeeping: Mutex::new(HashMap::new()),
                scheduler: Scheduler::new(),
                jobs,
                ready: AtomicBool::new(false),
                shutdown_token: CancellationToken::new(),
            }),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.inner.config.node_id
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Creates pool `name` over `[low, high]` with the configured quarantine
    /// delay. See [`Self::create_pool_with_delay`].
    pub async fn create_pool(&self, name: &str, low: u64, high: u64) -> Result<()> {
        self.create_pool_with_delay(name, low, high, self.inner.config.quarantine_delay)
            .await
    }

    /// Creates pool `name` over `[low, high]`.
    ///
    /// Creating a pool that already exists is a no-op, even if the requested
    /// range differs.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRequest`] for a bad name or range.
    /// - [`Error::LockAcquisitionFailure`] if the pool lock is contended.
    /// - [`Error::Store`] if the record cannot be written.
    #[cfg_attr(feature = "tracing", instrument(skip(self), fields(node = %self.inner.config.node_id)))]
    pub async fn create_pool_with_delay(
        &self,
        name: &str,
        low: u64,
        high: u64,
        quarantine_delay: Duration,
    ) -> Result<()> {
        let pool = GlobalPool::new(name, low, high, quarantine_delay.as_secs())?;
        self.create(pool).await
    }

    /// Creates pool `name` over `[low, high]` in lease mode.
    ///
    /// Each key holds one id for `ttl`. Allocating again for the same key
    /// renews its lease; once a lease lapses its id may go to another key.
    /// Released ids wait out the configured quarantine delay. Lease pools
    /// keep no per-node cache: every call works on the pool's lease table.
    ///
    /// # Errors
    ///
    /// As [`Self::create_pool_with_delay`], and [`Error::InvalidRequest`] for a
    /// zero `ttl`.
    #[cfg_attr(feature = "tracing", instrument(skip(self), fields(node = %self.inner.config.node_id)))]
    pub async fn create_pool_with_lease(
        &self,
        name: &str,
        low: u64,
        high: u64,
        ttl: Duration,
    ) -> Result<()> {
        let delay = self.inner.config.quarantine_delay.as_secs();
        let pool = GlobalPool::with_lease(name, low, high, delay, ttl.as_secs())?;
        self.create(pool).await
    }

    async fn create(&self, pool: GlobalPool) -> Result<()> {
        self.ensure_running()?;
        let name = pool.name.as_str();
        // A delete of the same name may still be queued on this node.
        self.inner.jobs.flush_key(name).await;

        let inner = &self.inner;
        inner
            .config
            .lock
            .with_lock(&inner.locks, &pool_lock(name), || async {
                let path = paths::pool(name);
                if inner.store.read(&path).await?.is_some() {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(pool = name, "Pool already exists");
                    return Ok(());
                }
                inner
                    .store
                    .commit(Transaction::new().write(path, encode(&pool)?))
                    .await?;

                #[cfg(feature = "tracing")]
                tracing::info!(
                    pool = name,
                    low = pool.low,
                    high = pool.high,
                    block_size = pool.block_size,
                    lease_ttl_secs = ?pool.lease_ttl_secs,
                    "Created pool"
                );
                Ok(())
            })
            .await
    }

    /// Returns the id held by `key`, allocating one if it holds none.
    ///
    /// If `key` already holds several ids (from [`Self::allocate_range`]), the
    /// first is returned.
    pub async fn allocate(&self, pool: &str, key: &str) -> Result<u64> {
        let ids = self.allocate_range(pool, key, 1).await?;
        ids.first()
            .copied()
            .ok_or_else(|| Error::store(format!("Empty id list persisted for {pool}/{key}")))
    }

    /// Returns the ids held by `key`, allocating `count` if it holds none.
    ///
    /// Repeated calls for a key that already holds ids return those ids
    /// unchanged, whatever `count` is. Concurrent calls for the same key on
    /// this node share a single allocation.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRequest`] for a bad pool name, empty key or zero count,
    ///   or a count above one on a lease pool.
    /// - [`Error::PoolNotFound`] if the pool does not exist.
    /// - [`Error::PoolExhausted`] if the pool hierarchy has no ids left.
    /// - [`Error::LockAcquisitionFailure`] if a lock could not be taken.
    /// - [`Error::RequestCancelled`] if the shared allocation was dropped.
    /// - [`Error::ServiceShutdown`] once shutdown has begun.
    #[cfg_attr(feature = "tracing", instrument(skip(self), fields(node = %self.inner.config.node_id)))]
    pub async fn allocate_range(&self, pool: &str, key: &str, count: usize) -> Result<Vec<u64>> {
        validate_name("pool", pool)?;
        validate_key(key)?;
        if count == 0 {
            return Err(Error::invalid("Count must be greater than 0"));
        }
        self.ensure_running()?;

        let flight_key = format!("{pool}/{key}");
        match self.inner.flights.join(&flight_key) {
            Role::Follower(flight) => flight.await,
            Role::Leader(guard) => {
                let result = self.allocate_as_leader(pool, key, count, &flight_key).await;
                guard.complete(result.clone());
                result
            }
        }
    }

    async fn allocate_as_leader(
        &self,
        pool: &str,
        key: &str,
        count: usize,
        flight_key: &str,
    ) -> Result<Vec<u64>> {
        let inner = &self.inner;
        inner
            .config
            .lock
            .with_lock(&inner.locks, &key_lock(pool, key), || async {
                inner
                    .latches
                    .wait(flight_key, inner.config.release_wait)
                    .await;
                if let Some(ids) = self.read_entry(pool, key).await? {
                    return Ok(ids);
                }

                let handle = self.pool_handle(pool).await?;
                if let Some(ttl_secs) = handle.lease_ttl_secs {
                    if count != 1 {
                        return Err(Error::invalid("Lease pools hand out one id per key"));
                    }
                    return self.lease(pool, key, ttl_secs).await.map(|id| vec![id]);
                }
                let ids = self.draw(pool, &handle, count).await?;

                let latch = inner.latches.install(flight_key);
                let job = self
                    .entry_job(pool, key, EntryChange::Commit(ids.clone()))
                    .hold(latch);
                if let Err(e) = inner.jobs.enqueue(pool, job) {
                    handle.cache.give_back(&ids, inner.clock.unix_secs());
                    return Err(e);
                }

                #[cfg(feature = "tracing")]
                tracing::debug!(pool, key, ?ids, "Allocated");
                Ok(ids)
            })
            .await
    }

    /// Takes `count` ids from the local cache, replenishing as needed.
    ///
    /// Ids already drawn when replenishment fails are given back to the cache.
    async fn draw(&self, pool: &str, handle: &PoolHandle, count: usize) -> Result<Vec<u64>> {
        let mut ids = Vec::with_capacity(count.min(1024));
        while ids.len() < count {
            let now = self.inner.clock.unix_secs();
            if handle.claim_is_stale(now, self.inner.config.idle_threshold) {
                if let Err(e) = self.renew_claim(pool, handle).await {
                    handle.cache.give_back(&ids, now);
                    return Err(e);
                }
            }
            if let Some((id, _source)) = handle.cache.allocate_one(now) {
                #[cfg(feature = "tracing")]
                tracing::trace!(pool, id, source = ?_source, "Drew id");
                ids.push(id);
                continue;
            }
            if let Err(e) = self.replenish(pool, handle).await {
                handle.cache.give_back(&ids, self.inner.clock.unix_secs());
                return Err(e);
            }
        }
        Ok(ids)
    }

    /// Releases every id held by `key` into quarantine and returns them.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRequest`] for a bad pool name or empty key.
    /// - [`Error::PoolNotFound`] if the pool does not exist.
    /// - [`Error::IdKeyNotFound`] if `key` holds no ids.
    /// - [`Error::LockAcquisitionFailure`] if the key lock is contended.
    /// - [`Error::ServiceShutdown`] once shutdown has begun.
    #[cfg_attr(feature = "tracing", instrument(skip(self), fields(node = %self.inner.config.node_id)))]
    pub async fn release(&self, pool: &str, key: &str) -> Result<Vec<u64>> {
        validate_name("pool", pool)?;
        validate_key(key)?;
        self.ensure_running()?;

        let flight_key = format!("{pool}/{key}");
        let inner = &self.inner;
        inner
            .config
            .lock
            .with_lock(&inner.locks, &key_lock(pool, key), || async {
                inner
                    .latches
                    .wait(&flight_key, inner.config.release_wait)
                    .await;
                let handle = self.pool_handle(pool).await?;
                if handle.lease_ttl_secs.is_some() {
                    let id = self
                        .release_lease(pool, key, handle.quarantine_delay_secs)
                        .await?;
                    return Ok(vec![id]);
                }
                let ids =
                    self.read_entry(pool, key)
                        .await?
                        .ok_or_else(|| Error::IdKeyNotFound {
                            pool: pool.to_owned(),
                            key: key.to_owned(),
                        })?;

                handle.cache.quarantine_ids(
                    &ids,
                    handle.quarantine_delay_secs,
                    inner.clock.unix_secs(),
                );
                let latch = inner.latches.install(&flight_key);
                inner
                    .jobs
                    .enqueue(pool, self.entry_job(pool, key, EntryChange::Remove).hold(latch))?;
                self.schedule_housekeeping(pool, handle.quarantine_delay_secs);

                #[cfg(feature = "tracing")]
                tracing::debug!(pool, key, ?ids, "Released into quarantine");
                Ok(ids)
            })
            .await
    }

    /// Deletes pool `name`, its child pools and every committed mapping.
    ///
    /// The store deletions run as ordered background jobs; the local cache is
    /// dropped immediately.
    ///
    /// # Errors
    ///
    /// - [`Error::PoolNotFound`] if the pool does not exist.
    /// - [`Error::LockAcquisitionFailure`] if the pool lock is contended.
    /// - [`Error::ServiceShutdown`] once shutdown has begun.
    #[cfg_attr(feature = "tracing", instrument(skip(self), fields(node = %self.inner.config.node_id)))]
    pub async fn delete_pool(&self, name: &str) -> Result<()> {
        validate_name("pool", name)?;
        self.ensure_running()?;

        let inner = &self.inner;
        inner
            .config
            .lock
            .with_lock(&inner.locks, &pool_lock(name), || async {
                let global = self
                    .read_global(name)
                    .await?
                    .ok_or_else(|| Error::PoolNotFound {
                        pool: name.to_owned(),
                    })?;
                for node in global.child_pools.keys() {
                    let txn = Transaction::new().delete(paths::child(name, node));
                    inner.jobs.enqueue(name, self.commit_job("delete-child", txn))?;
                }
                let txn = Transaction::new()
                    .delete_prefix(paths::subtree(name))
                    .delete(paths::pool(name));
                inner.jobs.enqueue(name, self.commit_job("delete-pool", txn))
            })
            .await?;

        self.forget_pool(name);
        #[cfg(feature = "tracing")]
        tracing::info!(pool = name, "Deleted pool");
        Ok(())
    }

    /// Current state of this node's cache for `pool`.
    ///
    /// A pool this node has not touched yet reports all zeros.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolNotFound`] if the pool does not exist.
    pub async fn pool_stats(&self, pool: &str) -> Result<PoolStats> {
        let cached = self.inner.pools.read().get(pool).cloned();
        match cached {
            Some(handle) => Ok(handle.cache.stats(self.inner.clock.unix_secs())),
            None => match self.read_global(pool).await? {
                Some(_) => Ok(PoolStats::default()),
                None => Err(Error::PoolNotFound {
                    pool: pool.to_owned(),
                }),
            },
        }
    }

    /// Names of the pools this node currently caches, sorted.
    pub fn cached_pools(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.pools.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Outcome counters of the persistence job queue.
    pub fn job_stats(&self) -> JobStats {
        self.inner.jobs.stats()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.inner.shutdown_token.is_cancelled() {
            return Err(Error::ServiceShutdown);
        }
        Ok(())
    }

    /// Returns the cached handle for `pool`, creating it on first use.
    async fn pool_handle(&self, pool: &str) -> Result<Arc<PoolHandle>> {
        let cached = self.inner.pools.read().get(pool).cloned();
        if let Some(handle) = cached {
            return Ok(handle);
        }

        let global = self
            .read_global(pool)
            .await?
            .ok_or_else(|| Error::PoolNotFound {
                pool: pool.to_owned(),
            })?;
        let node = self.inner.config.node_id.as_str();
        let child = self.read_child(pool, node).await?;
        let handle = Arc::new(PoolHandle::restore(&global, node, child));

        let mut pools = self.inner.pools.write();
        Ok(Arc::clone(pools.entry(pool.to_owned()).or_insert(handle)))
    }

    fn forget_pool(&self, pool: &str) {
        self.inner.pools.write().remove(pool);
        if let Some(task) = self.inner.housekeeping.lock().remove(pool) {
            task.cancel();
        }
    }

    async fn read_global(&self, pool: &str) -> Result<Option<GlobalPool>> {
        self.inner
            .store
            .read(&paths::pool(pool))
            .await?
            .map(decode)
            .transpose()
    }

    async fn read_child(&self, pool: &str, node: &str) -> Result<Option<ChildPool>> {
        self.inner
            .store
            .read(&paths::child(pool, node))
            .await?
            .map(decode)
            .transpose()
    }

    async fn read_entry(&self, pool: &str, key: &str) -> Result<Option<Vec<u64>>> {
        self.inner
            .store
            .read(&paths::entry(pool, key))
            .await?
            .map(decode)
            .transpose()
    }
}
