use portable_atomic::{AtomicU64, Ordering};
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Persisted form of a [`ContiguousRange`].
///
/// `next` is the next id that has never been issued (the classic "cursor" plus
/// one). Keeping `next` instead of `cursor` lets a range start at `0` without
/// underflowing; the range is spent once `next > high`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeState {
    pub low: u64,
    pub high: u64,
    pub next: u64,
}

impl RangeState {
    /// A range with no capacity.
    pub const EMPTY: Self = Self {
        low: 1,
        high: 0,
        next: 1,
    };

    /// A fresh, untouched range over `[low, high]`.
    pub const fn new(low: u64, high: u64) -> Self {
        Self {
            low,
            high,
            next: low,
        }
    }

    /// Number of ids that have never been issued.
    pub const fn remaining(&self) -> u64 {
        if self.next > self.high {
            0
        } else {
            (self.high - self.next).saturating_add(1)
        }
    }

    /// Carves up to `count` ids off the front of the range, advancing `next`
    /// past them. Returns the carved sub-range, which may be empty.
    pub fn carve(&mut self, count: u64) -> Self {
        let take = count.min(self.remaining());
        if take == 0 {
            return Self::EMPTY;
        }
        let carved = Self::new(self.next, self.next + take - 1);
        self.next += take;
        carved
    }
}

/// A lock-free bounded counter over `[low, high]`.
///
/// Ids are handed out in ascending order; the counter only ever moves forward
/// and never past `high`. `u64::MAX` itself is never handed out: a `high` of
/// `u64::MAX` is lowered by one so the counter cannot overflow.
///
/// ## Features
/// - ✅ Thread-safe
/// - ✅ Lock-free (single CAS per id)
///
/// ## See Also
/// - [`QuarantineQueue`](crate::QuarantineQueue)
/// - [`LocalPoolCache`](crate::LocalPoolCache)
#[derive(Debug)]
pub struct ContiguousRange {
    low: u64,
    high: u64,
    #[cfg(feature = "cache-padded")]
    next: crossbeam_utils::CachePadded<AtomicU64>,
    #[cfg(not(feature = "cache-padded"))]
    next: AtomicU64,
}

impl ContiguousRange {
    /// Creates an untouched range over `[low, high]`.
    pub fn new(low: u64, high: u64) -> Self {
        Self::from_state(RangeState::new(low, high))
    }

    /// Creates a range with no capacity.
    pub fn empty() -> Self {
        Self::from_state(RangeState::EMPTY)
    }

    /// Restores a range from its persisted state.
    pub fn from_state(state: RangeState) -> Self {
        Self {
            low: state.low,
            high: state.high.min(u64::MAX - 1),
            #[cfg(feature = "cache-padded")]
            next: crossbeam_utils::CachePadded::new(AtomicU64::new(state.next)),
            #[cfg(not(feature = "cache-padded"))]
            next: AtomicU64::new(state.next),
        }
    }

    /// Takes the next id, or `None` once the range is spent.
    ///
    /// # Example
    /// ```
    /// use idpool::ContiguousRange;
    ///
    /// let range = ContiguousRange::new(1, 2);
    /// assert_eq!(range.try_take(), Some(1));
    /// assert_eq!(range.try_take(), Some(2));
    /// assert_eq!(range.try_take(), None);
    /// ```
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip(self)))]
    pub fn try_take(&self) -> Option<u64> {
        let mut current = self.next.load(Ordering::Relaxed);
        loop {
            if current > self.high {
                return None;
            }
            let next = current.checked_add(1)?;
            match self.next.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(current),
                // Another thread won the race, retry from what it left behind.
                Err(actual) => current = actual,
            }
        }
    }

    /// Number of ids left to hand out.
    pub fn remaining(&self) -> u64 {
        self.state().remaining()
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Point-in-time snapshot suitable for persisting.
    pub fn state(&self) -> RangeState {
        RangeState {
            low: self.low,
            high: self.high,
            next: self.next.load(Ordering::Acquire),
        }
    }
}

impl Default for ContiguousRange {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::HashSet, sync::Arc, thread::scope};

    #[test]
    fn takes_in_order_until_spent() {
        let range = ContiguousRange::new(10, 12);
        assert_eq!(range.remaining(), 3);
        assert_eq!(range.try_take(), Some(10));
        assert_eq!(range.try_take(), Some(11));
        assert_eq!(range.try_take(), Some(12));
        assert_eq!(range.try_take(), None);
        assert_eq!(range.remaining(), 0);
        assert_eq!(range.state().next, 13);
    }

    #[test]
    fn range_may_start_at_zero() {
        let range = ContiguousRange::new(0, 0);
        assert_eq!(range.try_take(), Some(0));
        assert_eq!(range.try_take(), None);
    }

    #[test]
    fn empty_range_yields_nothing() {
        let range = ContiguousRange::empty();
        assert!(range.is_empty());
        assert_eq!(range.try_take(), None);
    }

    #[test]
    fn restores_from_state() {
        let range = ContiguousRange::from_state(RangeState {
            low: 1,
            high: 5,
            next: 4,
        });
        assert_eq!(range.remaining(), 2);
        assert_eq!(range.try_take(), Some(4));
    }

    #[test]
    fn carve_advances_parent() {
        let mut global = RangeState::new(1, 25);
        let first = global.carve(10);
        assert_eq!(first, RangeState::new(1, 10));
        let second = global.carve(10);
        assert_eq!(second, RangeState::new(11, 20));
        let third = global.carve(10);
        assert_eq!(third, RangeState::new(21, 25));
        assert_eq!(global.carve(10), RangeState::EMPTY);
        assert_eq!(global.remaining(), 0);
    }

    #[test]
    fn top_of_u64_never_overflows() {
        let range = ContiguousRange::new(u64::MAX - 1, u64::MAX);
        assert_eq!(range.remaining(), 1);
        assert_eq!(range.try_take(), Some(u64::MAX - 1));
        assert_eq!(range.try_take(), None);
        assert!(range.is_empty());

        let spent = ContiguousRange::from_state(RangeState {
            low: u64::MAX,
            high: u64::MAX,
            next: u64::MAX,
        });
        assert_eq!(spent.try_take(), None);
        assert_eq!(RangeState::new(0, u64::MAX).remaining(), u64::MAX);
    }

    #[test]
    fn threaded_takes_are_unique() {
        const THREADS: usize = 8;
        const TOTAL: u64 = 8 * 4096;

        let range = Arc::new(ContiguousRange::new(1, TOTAL));
        let seen = Arc::new(parking_lot::Mutex::new(HashSet::new()));

        scope(|s| {
            for _ in 0..THREADS {
                let range = Arc::clone(&range);
                let seen = Arc::clone(&seen);
                s.spawn(move || {
                    while let Some(id) = range.try_take() {
                        assert!(seen.lock().insert(id));
                    }
                });
            }
        });

        assert_eq!(seen.lock().len() as u64, TOTAL);
        assert!(range.is_empty());
    }
}
