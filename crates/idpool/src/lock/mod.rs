//! Distributed mutual exclusion over named locks.
//!
//! The allocator only relies on a try-lock/unlock pair. Blocking acquisition
//! with a deadline is layered on top by [`LockPolicy::with_lock`].

mod memory;

pub use memory::*;

use crate::{Error, Result};
use core::time::Duration;
use tokio::time::{Instant, sleep};

/// Named, non-reentrant distributed locks.
pub trait LockService: Send + Sync + 'static {
    /// Tries to take `name`; `Ok(false)` means someone else holds it.
    fn try_lock(&self, name: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Releases `name`.
    fn unlock(&self, name: &str) -> impl Future<Output = Result<()>> + Send;
}

impl<L: LockService> LockService for std::sync::Arc<L> {
    fn try_lock(&self, name: &str) -> impl Future<Output = Result<bool>> + Send {
        (**self).try_lock(name)
    }

    fn unlock(&self, name: &str) -> impl Future<Output = Result<()>> + Send {
        (**self).unlock(name)
    }
}

/// Lock name serializing block replenishment, pool create/delete and pool
/// record writes.
pub fn pool_lock(pool: &str) -> String {
    format!("pool:{pool}")
}

/// Lock name serializing a key's committed mapping.
pub fn key_lock(pool: &str, key: &str) -> String {
    format!("key:{pool}/{key}")
}

/// How long to keep retrying a held lock, and how often.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockPolicy {
    pub timeout: Duration,
    pub retry_interval: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retry_interval: Duration::from_millis(5),
        }
    }
}

impl LockPolicy {
    /// Takes `name`, retrying at a fixed interval until the timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockAcquisitionFailure`] once the timeout elapses, or
    /// the lock service's own error.
    pub async fn acquire<L: LockService>(&self, locks: &L, name: &str) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if locks.try_lock(name).await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                #[cfg(feature = "tracing")]
                tracing::warn!(lock = name, "Lock acquisition timed out");
                return Err(Error::LockAcquisitionFailure {
                    name: name.to_owned(),
                });
            }
            sleep(self.retry_interval).await;
        }
    }

    /// Runs `f` while holding `name`.
    ///
    /// The lock is released whether `f` succeeds or fails; a failed unlock is
    /// logged and does not mask the result of `f`.
    pub async fn with_lock<L, F, Fut, T>(&self, locks: &L, name: &str, f: F) -> Result<T>
    where
        L: LockService,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.acquire(locks, name).await?;
        let result = f().await;
        if let Err(_e) = locks.unlock(name).await {
            #[cfg(feature = "tracing")]
            tracing::error!(lock = name, "Failed to release lock: {_e}");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn with_lock_releases_on_error() {
        let locks = MemoryLockService::new();
        let policy = LockPolicy::default();

        let result: Result<()> = policy
            .with_lock(&locks, "a", || async { Err(Error::RequestCancelled) })
            .await;
        assert_eq!(result, Err(Error::RequestCancelled));
        assert!(!locks.is_locked("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_times_out_on_held_lock() {
        let locks = MemoryLockService::new();
        assert!(locks.try_lock("a").await.unwrap());

        let policy = LockPolicy {
            timeout: Duration::from_millis(50),
            retry_interval: Duration::from_millis(10),
        };
        assert_eq!(
            policy.acquire(&locks, "a").await,
            Err(Error::LockAcquisitionFailure {
                name: "a".to_string()
            })
        );
    }

    #[tokio::test]
    async fn contenders_serialize() {
        let locks = Arc::new(MemoryLockService::new());
        let counter = Arc::new(parking_lot::Mutex::new((0_u32, 0_u32)));
        let policy = LockPolicy::default();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let counter = Arc::clone(&counter);
            handles.push(tokio::spawn(async move {
                policy
                    .with_lock(&locks, "shared", || async {
                        {
                            let mut c = counter.lock();
                            c.0 += 1;
                            c.1 = c.1.max(c.0);
                        }
                        tokio::task::yield_now().await;
                        counter.lock().0 -= 1;
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        // never more than one holder at a time
        assert_eq!(counter.lock().1, 1);
    }
}
