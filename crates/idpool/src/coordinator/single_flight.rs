use crate::{Error, Result};
use core::time::Duration;
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio::{sync::oneshot, time::timeout};
use tokio_util::sync::CancellationToken;

type Flight = Shared<BoxFuture<'static, Result<Vec<u64>>>>;

/// De-duplicates concurrent allocations for the same `pool/key`.
///
/// The first caller becomes the leader and does the work; everyone arriving
/// while it runs awaits the leader's shared result.
#[derive(Default)]
pub(crate) struct SingleFlight {
    pending: Mutex<HashMap<String, Flight>>,
}

pub(crate) enum Role<'a> {
    Leader(FlightGuard<'a>),
    Follower(Flight),
}

/// Held by the leader. Completing it publishes the result; dropping it
/// without completing wakes followers with [`Error::RequestCancelled`].
pub(crate) struct FlightGuard<'a> {
    owner: &'a SingleFlight,
    key: String,
    tx: Option<oneshot::Sender<Result<Vec<u64>>>>,
}

impl SingleFlight {
    pub(crate) fn join(&self, key: &str) -> Role<'_> {
        let mut pending = self.pending.lock();
        if let Some(flight) = pending.get(key) {
            return Role::Follower(flight.clone());
        }

        let (tx, rx) = oneshot::channel();
        let flight = rx
            .map(|received| received.unwrap_or(Err(Error::RequestCancelled)))
            .boxed()
            .shared();
        pending.insert(key.to_owned(), flight);
        Role::Leader(FlightGuard {
            owner: self,
            key: key.to_owned(),
            tx: Some(tx),
        })
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }
}

impl FlightGuard<'_> {
    /// Removes the pending entry, then hands `result` to every follower.
    pub(crate) fn complete(mut self, result: Result<Vec<u64>>) {
        self.owner.pending.lock().remove(&self.key);
        if let Some(tx) = self.tx.take() {
            // Nobody listening is fine.
            let _ = tx.send(result);
        }
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            self.owner.pending.lock().remove(&self.key);
        }
    }
}

/// Per-key latches closed while a key's mapping change is still being
/// persisted.
///
/// A latch opens when its [`Latch`] handle is dropped, which happens once the
/// persistence job holding it finishes or is discarded.
#[derive(Default)]
pub(crate) struct Latches {
    closed: Arc<Mutex<HashMap<String, (u64, CancellationToken)>>>,
    generation: portable_atomic::AtomicU64,
}

pub(crate) struct Latch {
    closed: Arc<Mutex<HashMap<String, (u64, CancellationToken)>>>,
    key: String,
    generation: u64,
    token: CancellationToken,
}

impl Latches {
    /// Closes the latch for `key` until the returned handle is dropped.
    pub(crate) fn install(&self, key: &str) -> Latch {
        let generation = self
            .generation
            .fetch_add(1, portable_atomic::Ordering::Relaxed);
        let token = CancellationToken::new();
        self.closed
            .lock()
            .insert(key.to_owned(), (generation, token.clone()));
        Latch {
            closed: Arc::clone(&self.closed),
            key: key.to_owned(),
            generation,
            token,
        }
    }

    /// Waits up to `bound` for the latch on `key` to open.
    ///
    /// Returns `false` if the wait timed out. A timeout is not an error: the
    /// caller proceeds regardless.
    pub(crate) async fn wait(&self, key: &str, bound: Duration) -> bool {
        let token = match self.closed.lock().get(key) {
            Some((_, token)) => token.clone(),
            None => return true,
        };
        if timeout(bound, token.cancelled()).await.is_ok() {
            return true;
        }
        #[cfg(feature = "tracing")]
        tracing::warn!(key, "Timed out waiting for in-flight persistence, proceeding");
        false
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self, key: &str) -> bool {
        self.closed.lock().contains_key(key)
    }
}

impl Drop for Latch {
    fn drop(&mut self) {
        let mut closed = self.closed.lock();
        if closed
            .get(&self.key)
            .is_some_and(|(generation, _)| *generation == self.generation)
        {
            closed.remove(&self.key);
        }
        drop(closed);
        self.token.cancel();
    }
}
