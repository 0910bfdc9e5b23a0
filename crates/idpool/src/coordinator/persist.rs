use super::AllocationCoordinator;
use crate::{
    ChildPool, GlobalPool, Job, LockService, Result, Store, TimeSource, Transaction,
    pool_lock,
    record::{encode, paths},
};
use core::time::Duration;
use futures::FutureExt;

/// How a persistence job changes a key's committed mapping.
#[derive(Clone, Debug)]
pub(super) enum EntryChange {
    Commit(Vec<u64>),
    Remove,
}

impl<S, L, C> AllocationCoordinator<S, L, C>
where
    S: Store,
    L: LockService,
    C: TimeSource,
{
    /// Builds the job that persists `change` for `key` together with this
    /// node's bookkeeping.
    pub(super) fn entry_job(&self, pool: &str, key: &str, change: EntryChange) -> Job {
        let label = match change {
            EntryChange::Commit(_) => "commit-entry",
            EntryChange::Remove => "remove-entry",
        };
        let this = self.clone();
        let pool = pool.to_owned();
        let key = key.to_owned();
        Job::new(label, move || {
            let this = this.clone();
            let pool = pool.clone();
            let key = key.clone();
            let change = change.clone();
            async move { this.persist_entry(&pool, &key, &change).await }.boxed()
        })
    }

    /// Builds a job that commits `txn` as is.
    pub(super) fn commit_job(&self, label: &'static str, txn: Transaction) -> Job {
        let this = self.clone();
        Job::new(label, move || {
            let this = this.clone();
            let txn = txn.clone();
            async move { this.inner.store.commit(txn).await }.boxed()
        })
    }

    async fn persist_entry(&self, pool: &str, key: &str, change: &EntryChange) -> Result<()> {
        let inner = &self.inner;
        inner
            .config
            .lock
            .with_lock(&inner.locks, &pool_lock(pool), || async {
                let Some(mut global) = self.read_global(pool).await? else {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(pool, key, "Pool is gone, skipping mapping change");
                    return Ok(());
                };

                let path = paths::entry(pool, key);
                let txn = match change {
                    EntryChange::Commit(ids) => Transaction::new().write(path, encode(ids)?),
                    EntryChange::Remove => Transaction::new().delete(path),
                };
                let (txn, stamp) = self.with_bookkeeping(txn, &mut global).await?;
                inner.store.commit(txn).await?;
                if let Some(handle) = inner.pools.read().get(pool) {
                    handle.claimed(stamp);
                }
                Ok(())
            })
            .await
    }

    /// Appends this node's child snapshot and last access time to `txn`,
    /// returning the access time written.
    ///
    /// If a sibling reclaimed this node's child pool in the meantime, the
    /// local cache is emptied and an empty child record is written in place
    /// of the snapshot, acknowledging the reclaim.
    async fn with_bookkeeping(
        &self,
        mut txn: Transaction,
        global: &mut GlobalPool,
    ) -> Result<(Transaction, u64)> {
        let inner = &self.inner;
        let pool = global.name.clone();
        let pool = pool.as_str();
        let node = inner.config.node_id.as_str();

        let handle = inner.pools.read().get(pool).cloned();
        if let Some(handle) = handle {
            self.reconcile_reclaim(pool, &handle).await?;
            let (range, quarantine) = handle.cache.snapshot();
            txn = txn.write(
                paths::child(pool, node),
                encode(&ChildPool::new(node, range, quarantine))?,
            );
        }

        let now = inner.clock.unix_secs();
        global.touch_child(node, now);
        Ok((txn.write(paths::pool(pool), encode(&*global)?), now))
    }

    /// Arms the housekeeping task for `pool` unless one is already pending.
    pub(super) fn schedule_housekeeping(&self, pool: &str, delay_secs: u64) {
        let mut pending = self.inner.housekeeping.lock();
        if pending.get(pool).is_some_and(|task| !task.is_cancelled()) {
            return;
        }

        let this = self.clone();
        let name = pool.to_owned();
        let task = self
            .inner
            .scheduler
            .schedule(Duration::from_secs(delay_secs), async move {
                this.inner.housekeeping.lock().remove(&name);
                if let Err(_e) = this.return_surplus(&name).await {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(pool = %name, "Housekeeping failed: {_e}");
                }
            });
        pending.insert(pool.to_owned(), task);
    }

    /// Hands ready quarantined ids beyond one block back to the pool.
    pub(super) async fn return_surplus(&self, pool: &str) -> Result<()> {
        let inner = &self.inner;
        let Some(handle) = inner.pools.read().get(pool).cloned() else {
            return Ok(());
        };

        inner
            .config
            .lock
            .with_lock(&inner.locks, &pool_lock(pool), || async {
                let Some(mut global) = self.read_global(pool).await? else {
                    return Ok(());
                };
                let node = inner.config.node_id.as_str();
                // A reclaimed child is reconciled by the next mapping change.
                if self
                    .read_child(pool, node)
                    .await?
                    .is_some_and(|child| child.reclaimed)
                {
                    return Ok(());
                }

                let now = inner.clock.unix_secs();
                let surplus = handle.cache.take_ready_surplus(handle.block_size, now);
                if surplus.is_empty() {
                    return Ok(());
                }

                global.absorb_quarantine(surplus.iter().copied());
                global.touch_child(node, now);
                let (range, quarantine) = handle.cache.snapshot();
                let txn = Transaction::new()
                    .write(
                        paths::child(pool, node),
                        encode(&ChildPool::new(node, range, quarantine))?,
                    )
                    .write(paths::pool(pool), encode(&global)?);
                if let Err(e) = inner.store.commit(txn).await {
                    handle.cache.merge_quarantine(surplus);
                    return Err(e);
                }
                handle.claimed(now);

                #[cfg(feature = "tracing")]
                tracing::debug!(pool, returned = surplus.len(), "Returned surplus quarantine");
                Ok(())
            })
            .await
    }
}
