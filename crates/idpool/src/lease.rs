//! Key-addressed lease slots with a per-entry TTL.
//!
//! This is an alternate allocation mode: a fixed table of slots, each either
//! leased to a key until an expiry or reclaimable. [`KeyedLeaseTable::allocate`]
//! answers "give me *a* free slot", not "give me slot X"; claiming the slot is
//! a separate [`KeyedLeaseTable::upsert`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One lease slot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseEntry {
    pub id: u64,
    pub expires_at: u64,
    pub key: String,
}

impl LeaseEntry {
    /// A slot is reclaimable once its expiry has passed.
    pub const fn is_expired(&self, now: u64) -> bool {
        self.expires_at <= now
    }
}

/// Outcome of a rejected [`KeyedLeaseTable::upsert`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LeaseError {
    /// The slot is leased to another key that is still live.
    #[error("Lease {id} is held by {holder}")]
    Busy { id: u64, holder: String },
}

/// A fixed-size table of lease slots over `[low, high]`.
///
/// Only slots that were ever leased are stored; every other id in the range is
/// reclaimable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyedLeaseTable {
    low: u64,
    high: u64,
    #[serde(default)]
    entries: BTreeMap<u64, LeaseEntry>,
}

impl KeyedLeaseTable {
    /// Creates a table with one reclaimable slot per id in `[low, high]`.
    pub fn new(low: u64, high: u64) -> Self {
        Self {
            low,
            high,
            entries: BTreeMap::new(),
        }
    }

    /// Returns the lowest id whose slot is reclaimable, without claiming it.
    pub fn allocate(&self, now: u64) -> Option<u64> {
        let mut candidate = self.low;
        for (&id, entry) in self.entries.range(self.low..=self.high) {
            if id > candidate {
                break;
            }
            if entry.is_expired(now) {
                return Some(id);
            }
            candidate = id.checked_add(1)?;
        }
        (candidate <= self.high).then_some(candidate)
    }

    /// Creates, renews or takes over the lease on `id` for `key`.
    ///
    /// - Same key: the expiry is refreshed.
    /// - Different key, still live: rejected with [`LeaseError::Busy`]
    ///   carrying the holder so the caller can pick another slot.
    /// - Otherwise the slot is (re)written for `key`.
    pub fn upsert(
        &mut self,
        id: u64,
        ttl_secs: u64,
        key: &str,
        now: u64,
    ) -> Result<&LeaseEntry, LeaseError> {
        let expires_at = now.saturating_add(ttl_secs);
        if let Some(entry) = self.entries.get(&id) {
            if entry.key != key && !entry.key.is_empty() && !entry.is_expired(now) {
                return Err(LeaseError::Busy {
                    id,
                    holder: entry.key.clone(),
                });
            }
        }
        let entry = self.entries.entry(id).or_insert_with(|| LeaseEntry {
            id,
            expires_at,
            key: key.to_owned(),
        });
        entry.expires_at = expires_at;
        if entry.key != key {
            entry.key = key.to_owned();
        }
        Ok(&*entry)
    }

    /// Gives up the live lease held by `key`. The slot stays unavailable for
    /// `quarantine_secs` before it can be leased again. Returns the released id.
    pub fn release(&mut self, key: &str, quarantine_secs: u64, now: u64) -> Option<u64> {
        let id = self.holder_of(key, now)?;
        let entry = self.entries.get_mut(&id)?;
        entry.key.clear();
        entry.expires_at = now.saturating_add(quarantine_secs);
        Some(id)
    }

    /// Forgets a slot, making it reclaimable at once.
    pub fn remove(&mut self, id: u64) -> Option<LeaseEntry> {
        self.entries.remove(&id)
    }

    pub fn get(&self, id: u64) -> Option<&LeaseEntry> {
        self.entries.get(&id)
    }

    /// The slot currently leased to `key`, if that lease is still live.
    pub fn holder_of(&self, key: &str, now: u64) -> Option<u64> {
        self.entries
            .values()
            .find(|entry| !key.is_empty() && entry.key == key && !entry.is_expired(now))
            .map(|entry| entry.id)
    }

    /// Number of slots that were ever leased and not removed.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_offers_lowest_expired_slot() {
        let mut table = KeyedLeaseTable::new(1, 3);
        assert_eq!(table.allocate(100), Some(1));

        table.upsert(1, 60, "a", 100).unwrap();
        assert_eq!(table.allocate(100), Some(2));
        // allocate does not claim
        assert_eq!(table.allocate(100), Some(2));
    }

    #[test]
    fn full_table_has_nothing_until_expiry() {
        let mut table = KeyedLeaseTable::new(1, 2);
        table.upsert(1, 10, "a", 100).unwrap();
        table.upsert(2, 20, "b", 100).unwrap();
        assert_eq!(table.allocate(109), None);
        assert_eq!(table.allocate(110), Some(1));
    }

    #[test]
    fn same_key_renews() {
        let mut table = KeyedLeaseTable::new(1, 1);
        table.upsert(1, 10, "a", 100).unwrap();
        let entry = table.upsert(1, 10, "a", 105).unwrap();
        assert_eq!(entry.expires_at, 115);
    }

    #[test]
    fn live_slot_rejects_other_key() {
        let mut table = KeyedLeaseTable::new(1, 1);
        table.upsert(1, 10, "a", 100).unwrap();
        assert_eq!(
            table.upsert(1, 10, "b", 105),
            Err(LeaseError::Busy {
                id: 1,
                holder: "a".to_string()
            })
        );
        assert_eq!(table.holder_of("a", 105), Some(1));
    }

    #[test]
    fn expired_slot_is_taken_over() {
        let mut table = KeyedLeaseTable::new(1, 1);
        table.upsert(1, 10, "a", 100).unwrap();
        let entry = table.upsert(1, 10, "b", 110).unwrap();
        assert_eq!(entry.key, "b");
        assert_eq!(table.holder_of("a", 110), None);
    }

    #[test]
    fn released_slot_waits_out_its_quarantine() {
        let mut table = KeyedLeaseTable::new(1, 2);
        table.upsert(1, 60, "a", 100).unwrap();
        table.upsert(2, 60, "b", 100).unwrap();

        assert_eq!(table.release("a", 30, 110), Some(1));
        assert_eq!(table.release("a", 30, 110), None);
        assert_eq!(table.holder_of("a", 110), None);
        assert_eq!(table.allocate(139), None);
        assert_eq!(table.allocate(140), Some(1));
    }

    #[test]
    fn gaps_between_leases_are_offered() {
        let mut table = KeyedLeaseTable::new(0, 4);
        table.upsert(0, 60, "a", 0).unwrap();
        table.upsert(1, 60, "b", 0).unwrap();
        table.upsert(3, 60, "c", 0).unwrap();
        assert_eq!(table.allocate(10), Some(2));
        table.upsert(2, 60, "d", 0).unwrap();
        assert_eq!(table.allocate(10), Some(4));
        table.upsert(4, 60, "e", 0).unwrap();
        assert_eq!(table.allocate(10), None);

        let top = KeyedLeaseTable::new(u64::MAX, u64::MAX);
        assert_eq!(top.allocate(0), Some(u64::MAX));
    }

    #[test]
    fn upsert_outside_table_creates_slot() {
        let mut table = KeyedLeaseTable::new(1, 1);
        table.upsert(42, 5, "z", 0).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.remove(42).map(|e| e.key), Some("z".to_string()));
        assert!(table.get(42).is_none());
    }
}
