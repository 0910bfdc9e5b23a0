use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// A released id and the Unix second from which it may be handed out again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineEntry {
    pub id: u64,
    pub ready_at: u64,
}

/// A time-ordered queue of released ids that are not yet reusable.
///
/// Entries are kept sorted by `ready_at` (non-decreasing). Appending with a
/// constant delay in time order preserves that automatically; anything else is
/// inserted at its ordered position, so the head is always the first entry to
/// become ready.
///
/// The queue is a plain data structure: the caller supplies `now` and provides
/// its own synchronization.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QuarantineQueue {
    entries: VecDeque<QuarantineEntry>,
}

impl QuarantineQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a queue from persisted entries, restoring the order if needed.
    pub fn from_entries(entries: impl IntoIterator<Item = QuarantineEntry>) -> Self {
        let mut entries: Vec<_> = entries.into_iter().collect();
        entries.sort_by_key(|e| e.ready_at);
        Self {
            entries: entries.into(),
        }
    }

    /// Quarantines `id` until `now + delay_secs`.
    pub fn add(&mut self, id: u64, delay_secs: u64, now: u64) {
        self.push(QuarantineEntry {
            id,
            ready_at: now.saturating_add(delay_secs),
        });
    }

    fn push(&mut self, entry: QuarantineEntry) {
        match self.entries.back() {
            Some(last) if last.ready_at > entry.ready_at => {
                let at = self
                    .entries
                    .partition_point(|e| e.ready_at <= entry.ready_at);
                self.entries.insert(at, entry);
            }
            _ => self.entries.push_back(entry),
        }
    }

    /// Pops the head if it is ready.
    ///
    /// Returns `None` when nothing is ready yet, even if the queue is not
    /// empty.
    pub fn try_take(&mut self, now: u64) -> Option<u64> {
        match self.entries.front() {
            Some(head) if head.ready_at <= now => self.entries.pop_front().map(|e| e.id),
            _ => None,
        }
    }

    /// Counts ready entries from the head.
    ///
    /// O(k) in the number of ready entries.
    pub fn available_count(&self, now: u64) -> u64 {
        self.entries
            .iter()
            .take_while(|e| e.ready_at <= now)
            .count() as u64
    }

    /// Merges another ordered run of entries into this queue, keeping the
    /// whole queue ordered by `ready_at`. Entries with equal readiness keep
    /// their relative order, with existing entries first.
    pub fn merge(&mut self, incoming: impl IntoIterator<Item = QuarantineEntry>) {
        let mut incoming: Vec<_> = incoming.into_iter().collect();
        if incoming.is_empty() {
            return;
        }
        incoming.sort_by_key(|e| e.ready_at);

        let current = core::mem::take(&mut self.entries);
        let mut merged = VecDeque::with_capacity(current.len() + incoming.len());
        let mut left = current.into_iter().peekable();
        let mut right = incoming.into_iter().peekable();
        loop {
            let take_left = match (left.peek(), right.peek()) {
                (Some(l), Some(r)) => l.ready_at <= r.ready_at,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => break,
            };
            let next = if take_left { left.next() } else { right.next() };
            merged.extend(next);
        }
        self.entries = merged;
    }

    /// Removes and returns up to `n` of the oldest entries, in order.
    pub fn take_front(&mut self, n: usize) -> Vec<QuarantineEntry> {
        let n = n.min(self.entries.len());
        self.entries.drain(..n).collect()
    }

    /// Removes ready entries beyond the first `keep` ready ones and returns
    /// them in order. Entries not yet ready are never touched.
    pub fn take_ready_surplus(&mut self, keep: u64, now: u64) -> Vec<QuarantineEntry> {
        let ready = self.available_count(now);
        if ready <= keep {
            return Vec::new();
        }
        let start = keep as usize;
        let end = ready as usize;
        self.entries.drain(start..end).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ordered copy of every entry, for persistence.
    pub fn entries(&self) -> Vec<QuarantineEntry> {
        self.entries.iter().copied().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(queue: &QuarantineQueue) -> Vec<u64> {
        queue.entries().iter().map(|e| e.id).collect()
    }

    #[test]
    fn nothing_is_taken_before_ready() {
        let mut queue = QuarantineQueue::new();
        queue.add(7, 30, 1_000);
        assert_eq!(queue.available_count(1_029), 0);
        assert_eq!(queue.try_take(1_029), None);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.available_count(1_030), 1);
        assert_eq!(queue.try_take(1_030), Some(7));
        assert!(queue.is_empty());
    }

    #[test]
    fn available_count_stops_at_first_unready() {
        let mut queue = QuarantineQueue::new();
        queue.add(1, 10, 100);
        queue.add(2, 10, 101);
        queue.add(3, 10, 150);
        assert_eq!(queue.available_count(111), 2);
        assert_eq!(queue.try_take(111), Some(1));
        assert_eq!(queue.try_take(111), Some(2));
        assert_eq!(queue.try_take(111), None);
    }

    #[test]
    fn out_of_order_add_is_inserted_in_place() {
        let mut queue = QuarantineQueue::new();
        queue.add(1, 30, 100);
        queue.add(2, 0, 100);
        assert_eq!(ids(&queue), vec![2, 1]);
        assert_eq!(queue.try_take(100), Some(2));
    }

    #[test]
    fn merge_preserves_ordering() {
        let mut queue = QuarantineQueue::new();
        queue.add(1, 0, 10);
        queue.add(2, 0, 30);
        queue.merge([
            QuarantineEntry { id: 3, ready_at: 20 },
            QuarantineEntry { id: 4, ready_at: 10 },
            QuarantineEntry { id: 5, ready_at: 40 },
        ]);
        assert_eq!(ids(&queue), vec![1, 4, 3, 2, 5]);
    }

    #[test]
    fn take_front_returns_oldest() {
        let mut queue = QuarantineQueue::new();
        for id in 1..=5 {
            queue.add(id, 0, id);
        }
        let front = queue.take_front(2);
        assert_eq!(front.iter().map(|e| e.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.take_front(10).len(), 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn ready_surplus_keeps_a_reserve() {
        let mut queue = QuarantineQueue::new();
        for id in 1..=4 {
            queue.add(id, 0, 10);
        }
        queue.add(9, 100, 10);

        let surplus = queue.take_ready_surplus(1, 10);
        assert_eq!(surplus.iter().map(|e| e.id).collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(ids(&queue), vec![1, 9]);
        assert!(queue.take_ready_surplus(1, 10).is_empty());
    }

    #[test]
    fn from_entries_sorts() {
        let queue = QuarantineQueue::from_entries([
            QuarantineEntry { id: 1, ready_at: 5 },
            QuarantineEntry { id: 2, ready_at: 1 },
        ]);
        assert_eq!(ids(&queue), vec![2, 1]);
    }
}
