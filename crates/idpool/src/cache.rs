use crate::{ContiguousRange, QuarantineEntry, QuarantineQueue, RangeState};
use parking_lot::{Mutex, RwLock};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Where an id handed out by [`LocalPoolCache::allocate_one`] came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationSource {
    /// Never issued before; carved from the cached block.
    Range,
    /// Previously released and past its quarantine delay.
    Quarantine,
}

/// Point-in-time view of a [`LocalPoolCache`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Unissued ids left in the cached block.
    pub range_remaining: u64,
    /// Released ids held in quarantine, ready or not.
    pub quarantined: u64,
    /// Quarantined ids that may be handed out now.
    pub quarantine_ready: u64,
}

/// Per-node cache of one pool: a carved block plus a quarantine queue.
///
/// The block is read through a shared lock and drained with a lock-free CAS,
/// so concurrent allocations only contend on the atomic counter. Replacing the
/// block (replenishment) takes the write side.
///
/// A cache is exclusively owned by the node that created it; its effects reach
/// other nodes only through the persisted pool records.
#[derive(Debug)]
pub struct LocalPoolCache {
    name: String,
    available: RwLock<ContiguousRange>,
    quarantine: Mutex<QuarantineQueue>,
}

impl LocalPoolCache {
    /// Creates an empty cache for pool `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            available: RwLock::new(ContiguousRange::empty()),
            quarantine: Mutex::new(QuarantineQueue::new()),
        }
    }

    /// Restores a cache from persisted bookkeeping.
    pub fn from_parts(
        name: impl Into<String>,
        range: RangeState,
        quarantine: impl IntoIterator<Item = QuarantineEntry>,
    ) -> Self {
        Self {
            name: name.into(),
            available: RwLock::new(ContiguousRange::from_state(range)),
            quarantine: Mutex::new(QuarantineQueue::from_entries(quarantine)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hands out one id: fresh ids first, then ready quarantined ones.
    ///
    /// Returns `None` when the cache has nothing to give; the caller is
    /// expected to replenish and retry.
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip(self), fields(pool = %self.name)))]
    pub fn allocate_one(&self, now: u64) -> Option<(u64, AllocationSource)> {
        if let Some(id) = self.available.read().try_take() {
            return Some((id, AllocationSource::Range));
        }
        self.quarantine
            .lock()
            .try_take(now)
            .map(|id| (id, AllocationSource::Quarantine))
    }

    /// Ids that [`Self::allocate_one`] could hand out right now.
    pub fn combined_available(&self, now: u64) -> u64 {
        let fresh = self.available.read().remaining();
        fresh + self.quarantine.lock().available_count(now)
    }

    /// Replaces the cached block with a freshly carved one.
    pub fn assign_range(&self, range: RangeState) {
        *self.available.write() = ContiguousRange::from_state(range);
    }

    /// Moves ordered quarantine entries into this cache.
    pub fn merge_quarantine(&self, entries: impl IntoIterator<Item = QuarantineEntry>) {
        self.quarantine.lock().merge(entries);
    }

    /// Quarantines released ids for `delay_secs`.
    pub fn quarantine_ids(&self, ids: &[u64], delay_secs: u64, now: u64) {
        let mut quarantine = self.quarantine.lock();
        for &id in ids {
            quarantine.add(id, delay_secs, now);
        }
    }

    /// Returns ids that were drawn but never handed to a caller. They are
    /// immediately reusable.
    pub fn give_back(&self, ids: &[u64], now: u64) {
        self.quarantine
            .lock()
            .merge(ids.iter().map(|&id| QuarantineEntry { id, ready_at: now }));
    }

    /// Removes ready quarantined ids beyond the first `keep`.
    pub fn take_ready_surplus(&self, keep: u64, now: u64) -> Vec<QuarantineEntry> {
        self.quarantine.lock().take_ready_surplus(keep, now)
    }

    /// Whether the cache holds neither fresh nor quarantined ids.
    pub fn is_empty(&self) -> bool {
        self.available.read().remaining() == 0 && self.quarantine.lock().is_empty()
    }

    /// Drops everything this cache holds.
    pub fn reset(&self) {
        self.assign_range(RangeState::EMPTY);
        self.quarantine.lock().clear();
    }

    /// Block and quarantine state for persisting.
    pub fn snapshot(&self) -> (RangeState, Vec<QuarantineEntry>) {
        let range = self.available.read().state();
        let quarantine = self.quarantine.lock().entries();
        (range, quarantine)
    }

    pub fn stats(&self, now: u64) -> PoolStats {
        let range_remaining = self.available.read().remaining();
        let quarantine = self.quarantine.lock();
        PoolStats {
            range_remaining,
            quarantined: quarantine.len() as u64,
            quarantine_ready: quarantine.available_count(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cache_has_nothing() {
        let cache = LocalPoolCache::new("p");
        assert_eq!(cache.allocate_one(0), None);
        assert_eq!(cache.combined_available(0), 0);
        assert!(cache.is_empty());

        // Unready quarantine still counts as held.
        cache.quarantine_ids(&[7], 30, 0);
        assert_eq!(cache.combined_available(0), 0);
        assert!(!cache.is_empty());
    }

    #[test]
    fn range_is_drained_before_quarantine() {
        let cache = LocalPoolCache::new("p");
        cache.assign_range(RangeState::new(1, 2));
        cache.quarantine_ids(&[50], 0, 100);

        assert_eq!(cache.combined_available(100), 3);
        assert_eq!(cache.allocate_one(100), Some((1, AllocationSource::Range)));
        assert_eq!(cache.allocate_one(100), Some((2, AllocationSource::Range)));
        assert_eq!(
            cache.allocate_one(100),
            Some((50, AllocationSource::Quarantine))
        );
        assert_eq!(cache.allocate_one(100), None);
    }

    #[test]
    fn quarantined_ids_wait_for_delay() {
        let cache = LocalPoolCache::new("p");
        cache.quarantine_ids(&[3, 4], 30, 1_000);
        assert_eq!(cache.combined_available(1_000), 0);
        assert_eq!(cache.allocate_one(1_029), None);
        assert_eq!(
            cache.allocate_one(1_030),
            Some((3, AllocationSource::Quarantine))
        );
        let stats = cache.stats(1_030);
        assert_eq!(stats.quarantined, 1);
        assert_eq!(stats.quarantine_ready, 1);
    }

    #[test]
    fn given_back_ids_are_reusable_at_once() {
        let cache = LocalPoolCache::new("p");
        cache.quarantine_ids(&[9], 30, 100);
        cache.give_back(&[1, 2], 100);
        assert_eq!(cache.combined_available(100), 2);
        assert_eq!(cache.allocate_one(100).map(|(id, _)| id), Some(1));
    }

    #[test]
    fn snapshot_round_trips() {
        let cache = LocalPoolCache::new("p");
        cache.assign_range(RangeState::new(10, 19));
        cache.allocate_one(0);
        cache.quarantine_ids(&[3], 30, 0);

        let (range, quarantine) = cache.snapshot();
        let restored = LocalPoolCache::from_parts("p", range, quarantine);
        assert_eq!(restored.snapshot(), cache.snapshot());
        assert_eq!(restored.allocate_one(0).map(|(id, _)| id), Some(11));
    }

    #[test]
    fn reset_empties_everything() {
        let cache = LocalPoolCache::new("p");
        cache.assign_range(RangeState::new(1, 10));
        cache.quarantine_ids(&[20], 0, 0);
        cache.reset();
        assert_eq!(cache.stats(0), PoolStats::default());
    }
}
