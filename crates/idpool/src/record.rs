//! Persisted pool records and the store layout they live under.
//!
//! ```text
//! /pools/<pool>                   GlobalPool
//! /pools/<pool>/children/<node>   ChildPool (one per node holding a block)
//! /pools/<pool>/entries/<key>     [id, ...] committed to <key>
//! ```

use crate::{Error, QuarantineEntry, QuarantineQueue, RangeState, Result};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::collections::BTreeMap;

/// Quarantine delay applied when a pool does not specify one.
pub const DEFAULT_QUARANTINE_DELAY_SECS: u64 = 30;

/// Cluster-wide record of one named pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalPool {
    pub name: String,
    pub low: u64,
    pub high: u64,
    pub block_size: u64,
    /// Next id never carved into any block.
    pub next: u64,
    pub quarantine_delay_secs: u64,
    /// Released ids returned to the pool, ordered by readiness.
    #[serde(default)]
    pub quarantine: Vec<QuarantineEntry>,
    /// Unissued tails of blocks reclaimed from idle siblings. Carved like the
    /// pool's own range once that is spent.
    #[serde(default)]
    pub reclaimed_ranges: Vec<RangeState>,
    /// Set for pools that hand out TTL leases instead of cached blocks.
    #[serde(default)]
    pub lease_ttl_secs: Option<u64>,
    /// Node id → last access (Unix seconds).
    #[serde(default)]
    pub child_pools: BTreeMap<String, u64>,
}

impl GlobalPool {
    /// Creates an untouched pool over `[low, high]`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if the name is unusable, `low > high`,
    /// or `high` is `u64::MAX`.
    pub fn new(name: &str, low: u64, high: u64, quarantine_delay_secs: u64) -> Result<Self> {
        validate_name("pool", name)?;
        if low > high {
            return Err(Error::invalid(format!(
                "Range [{low}, {high}] is empty: low must not exceed high"
            )));
        }
        if high == u64::MAX {
            return Err(Error::invalid("High bound must be below u64::MAX"));
        }
        Ok(Self {
            name: name.to_owned(),
            low,
            high,
            block_size: Self::block_size_for(low, high),
            next: low,
            quarantine_delay_secs,
            quarantine: Vec::new(),
            reclaimed_ranges: Vec::new(),
            lease_ttl_secs: None,
            child_pools: BTreeMap::new(),
        })
    }

    /// Like [`Self::new`], for a pool whose ids are leased for `ttl_secs`.
    ///
    /// # Errors
    ///
    /// As [`Self::new`], and [`Error::InvalidRequest`] for a zero TTL.
    pub fn with_lease(
        name: &str,
        low: u64,
        high: u64,
        quarantine_delay_secs: u64,
        ttl_secs: u64,
    ) -> Result<Self> {
        if ttl_secs == 0 {
            return Err(Error::invalid("Lease TTL must be greater than 0"));
        }
        let mut pool = Self::new(name, low, high, quarantine_delay_secs)?;
        pool.lease_ttl_secs = Some(ttl_secs);
        Ok(pool)
    }

    /// A tenth of the span, and at least one.
    pub const fn block_size_for(low: u64, high: u64) -> u64 {
        let size = (high - low) / 10;
        if size == 0 { 1 } else { size }
    }

    pub const fn range(&self) -> RangeState {
        RangeState {
            low: self.low,
            high: self.high,
            next: self.next,
        }
    }

    /// Carves the next block off the unissued range, falling back to ranges
    /// reclaimed from siblings once the pool's own range is spent.
    pub fn carve_block(&mut self) -> RangeState {
        let mut range = self.range();
        let block = range.carve(self.block_size);
        self.next = range.next;
        if block.remaining() > 0 {
            return block;
        }

        while let Some(spare) = self.reclaimed_ranges.first_mut() {
            let block = spare.carve(self.block_size);
            if spare.remaining() == 0 {
                self.reclaimed_ranges.remove(0);
            }
            if block.remaining() > 0 {
                return block;
            }
        }
        RangeState::EMPTY
    }

    /// Keeps the unissued part of `range` for later carving.
    pub fn absorb_range(&mut self, range: RangeState) {
        if range.remaining() > 0 {
            self.reclaimed_ranges.push(range);
        }
    }

    /// Removes up to one block of the oldest quarantined ids that are ready
    /// at `now`. Entries still waiting out their delay stay in the pool.
    pub fn take_ready_quarantine_block(&mut self, now: u64) -> Vec<QuarantineEntry> {
        let ready = self
            .quarantine
            .iter()
            .take(self.block_size as usize)
            .take_while(|entry| entry.ready_at <= now)
            .count();
        self.quarantine.drain(..ready).collect()
    }

    /// Folds entries into the pool quarantine, keeping readiness order.
    pub fn absorb_quarantine(&mut self, entries: impl IntoIterator<Item = QuarantineEntry>) {
        let mut queue = QuarantineQueue::from_entries(core::mem::take(&mut self.quarantine));
        queue.merge(entries);
        self.quarantine = queue.entries();
    }

    /// Records that `node` accessed the pool at `now`.
    pub fn touch_child(&mut self, node: &str, now: u64) {
        self.child_pools.insert(node.to_owned(), now);
    }

    /// Children other than `node`, least recently used first.
    pub fn siblings_by_idleness<'a>(&'a self, node: &'a str) -> Vec<(&'a str, u64)> {
        let mut siblings: Vec<_> = self
            .child_pools
            .iter()
            .filter(|(name, _)| name.as_str() != node)
            .map(|(name, &last)| (name.as_str(), last))
            .collect();
        siblings.sort_by_key(|&(name, last)| (last, name));
        siblings
    }
}

/// Per-node holder bookkeeping under a [`GlobalPool`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildPool {
    /// Owning node id.
    pub name: String,
    pub range: RangeState,
    #[serde(default)]
    pub quarantine: Vec<QuarantineEntry>,
    /// Set when an idle-sibling sweep took this child's capacity.
    #[serde(default)]
    pub reclaimed: bool,
}

impl ChildPool {
    pub fn new(name: &str, range: RangeState, quarantine: Vec<QuarantineEntry>) -> Self {
        Self {
            name: name.to_owned(),
            range,
            quarantine,
            reclaimed: false,
        }
    }

    /// Empties this child and marks it reclaimed, returning the unissued
    /// part of its block and its quarantine.
    pub fn drain(&mut self) -> (RangeState, Vec<QuarantineEntry>) {
        let range = core::mem::replace(&mut self.range, RangeState::EMPTY);
        let unissued = if range.remaining() > 0 {
            RangeState::new(range.next, range.high)
        } else {
            RangeState::EMPTY
        };
        self.reclaimed = true;
        (unissued, core::mem::take(&mut self.quarantine))
    }

    /// Whether draining this child would give anything back.
    pub fn holds_anything(&self) -> bool {
        self.range.remaining() > 0 || !self.quarantine.is_empty()
    }
}

/// Rejects names that would break the store layout.
pub(crate) fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid(format!("{kind} name must not be empty")));
    }
    if name.contains('/') {
        return Err(Error::invalid(format!(
            "{kind} name {name:?} must not contain '/'"
        )));
    }
    Ok(())
}

pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::invalid("Key must not be empty"));
    }
    Ok(())
}

pub(crate) fn encode<T: Serialize>(record: &T) -> Result<Value> {
    Ok(serde_json::to_value(record)?)
}

pub(crate) fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    Ok(serde_json::from_value(value)?)
}

/// Store paths for pool records.
pub mod paths {
    pub const ROOT: &str = "/pools/";

    pub fn pool(pool: &str) -> String {
        format!("{ROOT}{pool}")
    }

    /// Everything under a pool, excluding the pool record itself.
    pub fn subtree(pool: &str) -> String {
        format!("{ROOT}{pool}/")
    }

    pub fn children(pool: &str) -> String {
        format!("{ROOT}{pool}/children/")
    }

    pub fn child(pool: &str, node: &str) -> String {
        format!("{ROOT}{pool}/children/{node}")
    }

    pub fn entry(pool: &str, key: &str) -> String {
        format!("{ROOT}{pool}/entries/{key}")
    }

    /// Lease table of a lease-mode pool.
    pub fn leases(pool: &str) -> String {
        format!("{ROOT}{pool}/leases")
    }

    /// What a store path refers to.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum PathKind<'a> {
        Pool(&'a str),
        Child { pool: &'a str, node: &'a str },
        Entry { pool: &'a str, key: &'a str },
    }

    pub fn parse(path: &str) -> Option<PathKind<'_>> {
        let rest = path.strip_prefix(ROOT)?;
        let (pool, rest) = match rest.split_once('/') {
            None if !rest.is_empty() => return Some(PathKind::Pool(rest)),
            None => return None,
            Some(split) => split,
        };
        if let Some(key) = rest.strip_prefix("entries/") {
            return (!key.is_empty()).then_some(PathKind::Entry { pool, key });
        }
        let node = rest.strip_prefix("children/")?;
        (!node.is_empty() && !node.contains('/')).then_some(PathKind::Child { pool, node })
    }
}
