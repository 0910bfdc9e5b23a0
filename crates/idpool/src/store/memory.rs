use super::{Store, StoreEvent, StoreEventKind, StoreOp, Transaction};
use crate::{Error, Result};
use parking_lot::RwLock;
use portable_atomic::{AtomicUsize, Ordering};
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::broadcast;

/// Capacity of the change feed before slow subscribers start lagging.
const EVENT_CAPACITY: usize = 1024;

/// In-process [`Store`] backed by an ordered map.
///
/// Commits are applied under a single write lock, so every transaction is
/// atomic with respect to readers. Share it through an `Arc` to let several
/// coordinators act as a cluster.
#[derive(Debug)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<String, Value>>,
    events: broadcast::Sender<StoreEvent>,
    failures: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            data: RwLock::new(BTreeMap::new()),
            events,
            failures: AtomicUsize::new(0),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` operations fail as if the store were
    /// unreachable.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::Release);
    }

    fn check_available(&self) -> Result<()> {
        let tripped = self
            .failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            Err(Error::store("store unavailable"))
        } else {
            Ok(())
        }
    }

    /// Synchronous read, handy for assertions.
    pub fn get(&self, path: &str) -> Option<Value> {
        self.data.read().get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    fn apply(data: &mut BTreeMap<String, Value>, op: StoreOp, events: &mut Vec<StoreEvent>) {
        match op {
            StoreOp::Write { path, value } => {
                let kind = if data.insert(path.clone(), value).is_some() {
                    StoreEventKind::Updated
                } else {
                    StoreEventKind::Added
                };
                events.push(StoreEvent { kind, path });
            }
            StoreOp::Merge { path, value } => {
                let kind = match data.get_mut(&path) {
                    Some(slot) => {
                        match (slot, value) {
                            (Value::Object(existing), Value::Object(incoming)) => {
                                existing.extend(incoming);
                            }
                            (slot, value) => *slot = value,
                        }
                        StoreEventKind::Updated
                    }
                    None => {
                        data.insert(path.clone(), value);
                        StoreEventKind::Added
                    }
                };
                events.push(StoreEvent { kind, path });
            }
            StoreOp::Delete { path } => {
                if data.remove(&path).is_some() {
                    events.push(StoreEvent {
                        kind: StoreEventKind::Deleted,
                        path,
                    });
                }
            }
            StoreOp::DeletePrefix { prefix } => {
                let doomed: Vec<String> = data
                    .range(prefix.clone()..)
                    .take_while(|(path, _)| path.starts_with(&prefix))
                    .map(|(path, _)| path.clone())
                    .collect();
                for path in doomed {
                    data.remove(&path);
                    events.push(StoreEvent {
                        kind: StoreEventKind::Deleted,
                        path,
                    });
                }
            }
        }
    }
}

impl Store for MemoryStore {
    async fn read(&self, path: &str) -> Result<Option<Value>> {
        self.check_available()?;
        Ok(self.get(path))
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        self.check_available()?;
        let data = self.data.read();
        Ok(data
            .range(prefix.to_owned()..)
            .take_while(|(path, _)| path.starts_with(prefix))
            .map(|(path, value)| (path.clone(), value.clone()))
            .collect())
    }

    async fn commit(&self, txn: Transaction) -> Result<()> {
        self.check_available()?;
        let mut events = Vec::new();
        {
            let mut data = self.data.write();
            for op in txn.into_ops() {
                Self::apply(&mut data, op, &mut events);
            }
        }
        for event in events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
        Ok(())
    }

    fn subscribe(&self, _prefix: &str) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn commit_applies_in_order() {
        let store = MemoryStore::new();
        store
            .commit(
                Transaction::new()
                    .write("/a", json!(1))
                    .write("/a", json!(2))
                    .write("/b", json!({"x": 1})),
            )
            .await
            .unwrap();
        assert_eq!(store.read("/a").await.unwrap(), Some(json!(2)));
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn merge_is_shallow() {
        let store = MemoryStore::new();
        store
            .commit(Transaction::new().write("/o", json!({"a": 1, "b": {"c": 1}})))
            .await
            .unwrap();
        store
            .commit(Transaction::new().merge("/o", json!({"b": {"d": 2}, "e": 3})))
            .await
            .unwrap();
        assert_eq!(store.get("/o"), Some(json!({"a": 1, "b": {"d": 2}, "e": 3})));
    }

    #[tokio::test]
    async fn scan_and_delete_prefix() {
        let store = MemoryStore::new();
        store
            .commit(
                Transaction::new()
                    .write("/pools/a", json!(1))
                    .write("/pools/a/x", json!(2))
                    .write("/pools/ab", json!(3))
                    .write("/pools/b", json!(4)),
            )
            .await
            .unwrap();

        let scanned = store.scan("/pools/a").await.unwrap();
        assert_eq!(scanned.len(), 3);

        store
            .commit(Transaction::new().delete_prefix("/pools/a/"))
            .await
            .unwrap();
        assert_eq!(store.get("/pools/a/x"), None);
        assert_eq!(store.get("/pools/ab"), Some(json!(3)));
    }

    #[tokio::test]
    async fn subscribers_see_changes() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe("/");
        store
            .commit(Transaction::new().write("/a", json!(1)).delete("/a"))
            .await
            .unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            StoreEvent {
                kind: StoreEventKind::Added,
                path: "/a".to_string()
            }
        );
        assert_eq!(rx.recv().await.unwrap().kind, StoreEventKind::Deleted);
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let store = MemoryStore::new();
        store.fail_next(2);
        assert!(store.read("/a").await.is_err());
        assert!(store.scan("/").await.is_err());
        assert!(store.read("/a").await.is_ok());
    }
}
