//! The persistent transactional store the allocator writes its pool records
//! to.
//!
//! The allocator only needs a small capability set: point reads, prefix scans,
//! atomic multi-operation commits and a change feed filtered by path prefix.
//! [`MemoryStore`] is the in-process reference implementation.

mod memory;

pub use memory::*;

use crate::Result;
use serde_json::Value;
use tokio::sync::broadcast;

/// One mutation inside a [`Transaction`].
#[derive(Clone, Debug, PartialEq)]
pub enum StoreOp {
    /// Replaces the value at `path`.
    Write { path: String, value: Value },
    /// Shallow-merges an object into the object at `path`, creating it if
    /// absent. Non-object values replace outright.
    Merge { path: String, value: Value },
    /// Removes `path`.
    Delete { path: String },
    /// Removes every path starting with `prefix`.
    DeletePrefix { prefix: String },
}

/// An ordered batch of [`StoreOp`]s applied atomically.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Transaction {
    ops: Vec<StoreOp>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(mut self, path: impl Into<String>, value: Value) -> Self {
        self.ops.push(StoreOp::Write {
            path: path.into(),
            value,
        });
        self
    }

    pub fn merge(mut self, path: impl Into<String>, value: Value) -> Self {
        self.ops.push(StoreOp::Merge {
            path: path.into(),
            value,
        });
        self
    }

    pub fn delete(mut self, path: impl Into<String>) -> Self {
        self.ops.push(StoreOp::Delete { path: path.into() });
        self
    }

    pub fn delete_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.ops.push(StoreOp::DeletePrefix {
            prefix: prefix.into(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<StoreOp> {
        self.ops
    }
}

/// Kind of change reported by [`Store::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreEventKind {
    Added,
    Updated,
    Deleted,
}

/// A committed change to one path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreEvent {
    pub kind: StoreEventKind,
    pub path: String,
}

/// Persistent, transactional key/value store addressed by `/`-separated paths.
pub trait Store: Send + Sync + 'static {
    /// Reads the value at `path`.
    fn read(&self, path: &str) -> impl Future<Output = Result<Option<Value>>> + Send;

    /// Lists every `(path, value)` whose path starts with `prefix`, ordered by
    /// path.
    fn scan(&self, prefix: &str) -> impl Future<Output = Result<Vec<(String, Value)>>> + Send;

    /// Applies all operations of `txn` atomically and in order.
    fn commit(&self, txn: Transaction) -> impl Future<Output = Result<()>> + Send;

    /// Subscribes to changes under `prefix`.
    ///
    /// Events for other paths may be delivered; subscribers filter.
    fn subscribe(&self, prefix: &str) -> broadcast::Receiver<StoreEvent>;
}

impl<S: Store> Store for std::sync::Arc<S> {
    fn read(&self, path: &str) -> impl Future<Output = Result<Option<Value>>> + Send {
        (**self).read(path)
    }

    fn scan(&self, prefix: &str) -> impl Future<Output = Result<Vec<(String, Value)>>> + Send {
        (**self).scan(prefix)
    }

    fn commit(&self, txn: Transaction) -> impl Future<Output = Result<()>> + Send {
        (**self).commit(txn)
    }

    fn subscribe(&self, prefix: &str) -> broadcast::Receiver<StoreEvent> {
        (**self).subscribe(prefix)
    }
}
