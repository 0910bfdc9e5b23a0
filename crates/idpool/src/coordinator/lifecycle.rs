use super::{AllocationCoordinator, PoolHandle};
use crate::{
    ChildPool, Error, GlobalPool, LockService, Result, Store, StoreEvent, StoreEventKind,
    TimeSource,
    record::{
        decode,
        paths::{self, PathKind},
    },
};
use portable_atomic::Ordering;
use std::{collections::HashMap, sync::Arc};
use tokio::{sync::broadcast, time::sleep};
use tokio_stream::{
    StreamExt,
    wrappers::{BroadcastStream, errors::BroadcastStreamRecvError},
};

impl<S, L, C> AllocationCoordinator<S, L, C>
where
    S: Store,
    L: LockService,
    C: TimeSource,
{
    /// Brings the node up.
    ///
    /// Rebuilds local caches from this node's persisted child pools, retrying
    /// the store scan until it succeeds, then starts watching the store for
    /// pool deletions and reclaims made by other nodes. Returns how many pool
    /// caches were restored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceShutdown`] if shutdown begins while the store
    /// is still unreachable.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self), fields(node = %self.inner.config.node_id)))]
    pub async fn start(&self) -> Result<usize> {
        // Subscribe first so nothing committed during the scan is missed.
        let events = self.inner.store.subscribe(paths::ROOT);
        let restored = self.rehydrate().await?;
        self.spawn_watcher(events);
        self.inner.ready.store(true, Ordering::Release);

        #[cfg(feature = "tracing")]
        tracing::info!(restored, "Coordinator ready");
        Ok(restored)
    }

    /// Whether [`Self::start`] has finished and shutdown has not begun.
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Acquire)
    }

    /// Waits until every persistence job queued so far has run.
    pub async fn flush(&self) {
        self.inner.jobs.flush().await;
    }

    /// Gracefully shuts the node down.
    ///
    /// - Refuses new requests.
    /// - Stops the store watcher and cancels pending housekeeping.
    /// - Drains queued persistence jobs.
    pub async fn shutdown(&self) {
        self.inner.ready.store(false, Ordering::Release);
        self.inner.shutdown_token.cancel();
        self.inner.scheduler.shutdown();
        self.inner.housekeeping.lock().clear();
        self.inner.jobs.shutdown().await;

        #[cfg(feature = "tracing")]
        tracing::info!(node = %self.inner.config.node_id, "Coordinator shut down");
    }

    async fn rehydrate(&self) -> Result<usize> {
        let inner = &self.inner;
        let records = loop {
            match inner.store.scan(paths::ROOT).await {
                Ok(records) => break records,
                Err(_e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Rehydration scan failed, retrying: {_e}");
                    tokio::select! {
                        () = inner.shutdown_token.cancelled() => return Err(Error::ServiceShutdown),
                        () = sleep(inner.config.rehydrate_backoff) => {}
                    }
                }
            }
        };

        let node = inner.config.node_id.as_str();
        let mut globals = HashMap::new();
        let mut children = Vec::new();
        for (path, value) in records {
            match paths::parse(&path) {
                Some(PathKind::Pool(pool)) => match decode::<GlobalPool>(value) {
                    Ok(global) => {
                        globals.insert(pool.to_owned(), global);
                    }
                    Err(_e) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(path = %path, "Skipping unreadable pool record: {_e}");
                    }
                },
                Some(PathKind::Child { pool, node: owner }) if owner == node => {
                    match decode::<ChildPool>(value) {
                        Ok(child) => children.push((pool.to_owned(), child)),
                        Err(_e) => {
                            #[cfg(feature = "tracing")]
                            tracing::warn!(path = %path, "Skipping unreadable child record: {_e}");
                        }
                    }
                }
                _ => {}
            }
        }

        let mut restored = 0;
        let mut pools = inner.pools.write();
        for (pool, child) in children {
            let Some(global) = globals.get(&pool) else {
                continue;
            };
            if child.reclaimed {
                continue;
            }
            pools.insert(pool, Arc::new(PoolHandle::restore(global, node, Some(child))));
            restored += 1;
        }
        Ok(restored)
    }

    fn spawn_watcher(&self, events: broadcast::Receiver<StoreEvent>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut events = BroadcastStream::new(events);
            loop {
                tokio::select! {
                    () = this.inner.shutdown_token.cancelled() => break,
                    event = events.next() => match event {
                        Some(Ok(event)) => this.on_store_event(event).await,
                        Some(Err(BroadcastStreamRecvError::Lagged(_skipped))) => {
                            #[cfg(feature = "tracing")]
                            tracing::warn!(skipped = _skipped, "Store watcher lagged");
                        }
                        None => break,
                    },
                }
            }

            #[cfg(feature = "tracing")]
            tracing::debug!("Store watcher stopped");
        });
    }

    async fn on_store_event(&self, event: StoreEvent) {
        let inner = &self.inner;
        match (event.kind, paths::parse(&event.path)) {
            (StoreEventKind::Deleted, Some(PathKind::Pool(pool))) => {
                // The pool may already have been recreated.
                match inner.store.read(&event.path).await {
                    Ok(None) => {
                        self.forget_pool(pool);
                        #[cfg(feature = "tracing")]
                        tracing::info!(pool, "Pool deleted, dropped local cache");
                    }
                    Ok(Some(_)) => {}
                    Err(_e) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(pool, "Failed to confirm pool deletion: {_e}");
                    }
                }
            }
            (
                StoreEventKind::Added | StoreEventKind::Updated,
                Some(PathKind::Child { pool, node }),
            ) if node == inner.config.node_id => {
                let Some(handle) = inner.pools.read().get(pool).cloned() else {
                    return;
                };
                match self.read_child(pool, node).await {
                    Ok(Some(child)) if child.reclaimed => {
                        handle.cache.reset();
                        #[cfg(feature = "tracing")]
                        tracing::warn!(pool, "Child pool reclaimed by a sibling, local cache reset");
                    }
                    Ok(_) => {}
                    Err(_e) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(pool, "Failed to read own child pool: {_e}");
                    }
                }
            }
            _ => {}
        }
    }
}
