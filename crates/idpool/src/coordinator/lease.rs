use super::AllocationCoordinator;
use crate::{
    Error, KeyedLeaseTable, LockService, Result, Store, TimeSource, Transaction, pool_lock,
    record::{decode, encode, paths},
};

impl<S, L, C> AllocationCoordinator<S, L, C>
where
    S: Store,
    L: LockService,
    C: TimeSource,
{
    /// Leases an id of lease-mode `pool` to `key`, renewing the lease it
    /// already holds if any. Committed before returning.
    pub(super) async fn lease(&self, pool: &str, key: &str, ttl_secs: u64) -> Result<u64> {
        let inner = &self.inner;
        inner
            .config
            .lock
            .with_lock(&inner.locks, &pool_lock(pool), || async {
                let mut table = self.read_lease_table(pool).await?;
                let now = inner.clock.unix_secs();
                let id = match table.holder_of(key, now) {
                    Some(id) => id,
                    None => table.allocate(now).ok_or_else(|| Error::PoolExhausted {
                        pool: pool.to_owned(),
                    })?,
                };
                let _expires_at = table
                    .upsert(id, ttl_secs, key, now)
                    .map_err(|e| Error::store(e.to_string()))?
                    .expires_at;
                self.write_lease_table(pool, &table).await?;

                #[cfg(feature = "tracing")]
                tracing::debug!(pool, key, id, expires_at = _expires_at, "Leased");
                Ok(id)
            })
            .await
    }

    /// Ends the live lease held by `key` in lease-mode `pool`.
    pub(super) async fn release_lease(
        &self,
        pool: &str,
        key: &str,
        quarantine_secs: u64,
    ) -> Result<u64> {
        let inner = &self.inner;
        inner
            .config
            .lock
            .with_lock(&inner.locks, &pool_lock(pool), || async {
                let mut table = self.read_lease_table(pool).await?;
                let now = inner.clock.unix_secs();
                let id = table.release(key, quarantine_secs, now).ok_or_else(|| {
                    Error::IdKeyNotFound {
                        pool: pool.to_owned(),
                        key: key.to_owned(),
                    }
                })?;
                self.write_lease_table(pool, &table).await?;

                #[cfg(feature = "tracing")]
                tracing::debug!(pool, key, id, "Lease released into quarantine");
                Ok(id)
            })
            .await
    }

    /// Reads the pool's lease table, starting an empty one over the pool's
    /// range on first use.
    async fn read_lease_table(&self, pool: &str) -> Result<KeyedLeaseTable> {
        if let Some(value) = self.inner.store.read(&paths::leases(pool)).await? {
            return decode(value);
        }
        let global = self
            .read_global(pool)
            .await?
            .ok_or_else(|| Error::PoolNotFound {
                pool: pool.to_owned(),
            })?;
        Ok(KeyedLeaseTable::new(global.low, global.high))
    }

    async fn write_lease_table(&self, pool: &str, table: &KeyedLeaseTable) -> Result<()> {
        self.inner
            .store
            .commit(Transaction::new().write(paths::leases(pool), encode(table)?))
            .await
    }
}
