use super::{AllocationCoordinator, PoolHandle};
use crate::{
    ChildPool, Error, GlobalPool, LockService, QuarantineQueue, Result, Store, TimeSource,
    Transaction, pool_lock,
    record::{encode, paths},
};

impl<S, L, C> AllocationCoordinator<S, L, C>
where
    S: Store,
    L: LockService,
    C: TimeSource,
{
    /// Refills this node's cache of `pool` from the cluster.
    ///
    /// Under the pool lock, tries in order:
    ///
    /// 1. Whatever the cache already holds (another task may have refilled it
    ///    while this one waited for the lock), unless a sibling reclaimed it.
    /// 2. A fresh block carved from the pool's unissued ranges.
    /// 3. Up to a block of the pool's quarantined ids that are ready now.
    /// 4. Capacity reclaimed from a sibling idle longer than the configured
    ///    threshold, after which 2 and 3 are retried.
    ///
    /// The pool record is committed before the cache sees the new capacity.
    /// Returns how many ids became available.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolExhausted`] when every source is empty.
    pub(super) async fn replenish(&self, pool: &str, handle: &PoolHandle) -> Result<u64> {
        let inner = &self.inner;
        inner
            .config
            .lock
            .with_lock(&inner.locks, &pool_lock(pool), || async {
                let now = inner.clock.unix_secs();
                self.reconcile_reclaim(pool, handle).await?;
                let available = handle.cache.combined_available(now);
                if available > 0 {
                    return Ok(available);
                }

                let mut global = self
                    .read_global(pool)
                    .await?
                    .ok_or_else(|| Error::PoolNotFound {
                        pool: pool.to_owned(),
                    })?;
                let node = inner.config.node_id.as_str();

                loop {
                    let block = global.carve_block();
                    if block.remaining() > 0 {
                        let (_, quarantine) = handle.cache.snapshot();
                        global.touch_child(node, now);
                        self.commit_pool_and_child(&global, ChildPool::new(node, block, quarantine))
                            .await?;
                        handle.claimed(now);
                        handle.cache.assign_range(block);

                        #[cfg(feature = "tracing")]
                        tracing::debug!(pool, low = block.low, high = block.high, "Carved block");
                        return Ok(block.remaining());
                    }

                    let entries = global.take_ready_quarantine_block(now);
                    if !entries.is_empty() {
                        let (range, quarantine) = handle.cache.snapshot();
                        let mut merged = QuarantineQueue::from_entries(quarantine);
                        merged.merge(entries.iter().copied());
                        global.touch_child(node, now);
                        self.commit_pool_and_child(
                            &global,
                            ChildPool::new(node, range, merged.entries()),
                        )
                        .await?;
                        handle.claimed(now);

                        let taken = entries.len() as u64;
                        handle.cache.merge_quarantine(entries);
                        #[cfg(feature = "tracing")]
                        tracing::debug!(pool, taken, "Took quarantined ids from pool");
                        return Ok(taken);
                    }

                    if !self.reclaim_idle_sibling(&mut global, now).await? {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(pool, "Pool exhausted");
                        return Err(Error::PoolExhausted {
                            pool: pool.to_owned(),
                        });
                    }
                }
            })
            .await
    }

    /// Moves everything held by the least recently used idle sibling back
    /// into the pool: its unissued range as a range, its quarantine as
    /// quarantine. Must run under the pool lock.
    ///
    /// Siblings that turn out to hold nothing are dropped from the pool's
    /// child list and the next idle one is tried. Returns `false` when no idle
    /// sibling had anything to give.
    async fn reclaim_idle_sibling(&self, global: &mut GlobalPool, now: u64) -> Result<bool> {
        let inner = &self.inner;
        let threshold = inner.config.idle_threshold.as_secs();
        let idle: Vec<String> = global
            .siblings_by_idleness(&inner.config.node_id)
            .into_iter()
            .take_while(|&(_, last_access)| now.saturating_sub(last_access) > threshold)
            .map(|(sibling, _)| sibling.to_owned())
            .collect();

        for sibling in idle {
            global.child_pools.remove(&sibling);
            let Some(mut child) = self.read_child(&global.name, &sibling).await? else {
                continue;
            };
            if !child.holds_anything() {
                continue;
            }

            let (range, quarantine) = child.drain();
            let _unissued = range.remaining();
            let _quarantined = quarantine.len();
            global.absorb_range(range);
            global.absorb_quarantine(quarantine);
            let txn = Transaction::new()
                .write(paths::child(&global.name, &sibling), encode(&child)?)
                .write(paths::pool(&global.name), encode(&*global)?);
            inner.store.commit(txn).await?;

            #[cfg(feature = "tracing")]
            tracing::info!(
                pool = %global.name,
                sibling = %sibling,
                unissued = _unissued,
                quarantined = _quarantined,
                "Reclaimed capacity from idle sibling"
            );
            return Ok(true);
        }
        Ok(false)
    }

    /// Re-stamps this node's access time in `pool` before its cache is
    /// served any further, so no sibling can take it for idle meanwhile.
    ///
    /// A child record a sibling already reclaimed empties the cache first.
    pub(super) async fn renew_claim(&self, pool: &str, handle: &PoolHandle) -> Result<()> {
        // Nothing cached, nothing a sibling could take; the next
        // replenishment stamps the claim.
        if handle.cache.is_empty() {
            return Ok(());
        }

        let inner = &self.inner;
        inner
            .config
            .lock
            .with_lock(&inner.locks, &pool_lock(pool), || async {
                let Some(mut global) = self.read_global(pool).await? else {
                    return Err(Error::PoolNotFound {
                        pool: pool.to_owned(),
                    });
                };
                self.reconcile_reclaim(pool, handle).await?;

                let now = inner.clock.unix_secs();
                let node = inner.config.node_id.as_str();
                let (range, quarantine) = handle.cache.snapshot();
                global.touch_child(node, now);
                self.commit_pool_and_child(&global, ChildPool::new(node, range, quarantine))
                    .await?;
                handle.claimed(now);

                #[cfg(feature = "tracing")]
                tracing::debug!(pool, "Renewed claim on cached capacity");
                Ok(())
            })
            .await
    }

    /// Empties the cache when a sibling has reclaimed this node's child
    /// record. Must run under the pool lock. Returns whether it did.
    pub(super) async fn reconcile_reclaim(&self, pool: &str, handle: &PoolHandle) -> Result<bool> {
        let node = self.inner.config.node_id.as_str();
        let reclaimed = self
            .read_child(pool, node)
            .await?
            .is_some_and(|child| child.reclaimed);
        if reclaimed {
            handle.cache.reset();
            #[cfg(feature = "tracing")]
            tracing::warn!(pool, "Child pool was reclaimed by a sibling, local cache reset");
        }
        Ok(reclaimed)
    }

    async fn commit_pool_and_child(&self, global: &GlobalPool, child: ChildPool) -> Result<()> {
        let txn = Transaction::new()
            .write(paths::child(&global.name, &child.name), encode(&child)?)
            .write(paths::pool(&global.name), encode(global)?);
        self.inner.store.commit(txn).await
    }
}
