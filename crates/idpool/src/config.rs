use crate::{LockPolicy, RetryPolicy, record::DEFAULT_QUARANTINE_DELAY_SECS};
use core::time::Duration;

/// Runtime configuration for an [`AllocationCoordinator`].
///
/// Every node in a cluster runs its own coordinator with a distinct
/// `node_id`; the remaining knobs normally match across the cluster.
///
/// [`AllocationCoordinator`]: crate::AllocationCoordinator
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Identity of this node; names its child pool under every global pool.
    pub node_id: String,
    /// Quarantine delay stamped on pools created by this node.
    pub quarantine_delay: Duration,
    /// A sibling untouched for this long may have its capacity reclaimed.
    pub idle_threshold: Duration,
    /// Upper bound a release waits for an in-flight allocation of the same
    /// key to persist.
    pub release_wait: Duration,
    /// Distributed lock acquisition policy.
    pub lock: LockPolicy,
    /// Persistence job retry policy.
    pub jobs: RetryPolicy,
    /// Pause between failed store scans during startup rehydration.
    pub rehydrate_backoff: Duration,
}

impl CoordinatorConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            quarantine_delay: Duration::from_secs(DEFAULT_QUARANTINE_DELAY_SECS),
            idle_threshold: Duration::from_secs(24 * 60 * 60),
            release_wait: Duration::from_secs(10),
            lock: LockPolicy::default(),
            jobs: RetryPolicy::default(),
            rehydrate_backoff: Duration::from_secs(1),
        }
    }

    pub fn with_quarantine_delay(mut self, delay: Duration) -> Self {
        self.quarantine_delay = delay;
        self
    }

    pub fn with_idle_threshold(mut self, threshold: Duration) -> Self {
        self.idle_threshold = threshold;
        self
    }

    pub fn with_release_wait(mut self, wait: Duration) -> Self {
        self.release_wait = wait;
        self
    }

    pub fn with_lock_policy(mut self, lock: LockPolicy) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_retry_policy(mut self, jobs: RetryPolicy) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn with_rehydrate_backoff(mut self, backoff: Duration) -> Self {
        self.rehydrate_backoff = backoff;
        self
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::new("node-0")
    }
}
