use super::{Job, JobOutcome, JobRequest, RetryPolicy, worker::worker_loop};
use crate::{Error, Result};
use core::time::Duration;
use parking_lot::Mutex;
use portable_atomic::{AtomicU64, Ordering};
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{mpsc, oneshot},
    time::timeout,
};
use tokio_util::sync::CancellationToken;

/// Totals across every key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JobStats {
    pub completed: u64,
    pub dropped: u64,
}

#[derive(Debug, Default)]
pub(crate) struct JobCounters {
    completed: AtomicU64,
    dropped: AtomicU64,
}

impl JobCounters {
    pub(crate) fn record(&self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Completed => self.completed.fetch_add(1, Ordering::Relaxed),
            JobOutcome::Dropped(_) => self.dropped.fetch_add(1, Ordering::Relaxed),
        };
    }
}

/// Keyed queue of ordered jobs.
///
/// A worker task is spawned lazily for each key on first use. Jobs for one key
/// run one at a time in submission order; keys run in parallel. Must be used
/// from within a Tokio runtime.
#[derive(Debug)]
pub struct JobQueue {
    workers: Mutex<HashMap<String, mpsc::UnboundedSender<JobRequest>>>,
    shutdown_token: CancellationToken,
    policy: RetryPolicy,
    shutdown_timeout: Duration,
    counters: Arc<JobCounters>,
}

impl JobQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
            shutdown_token: CancellationToken::new(),
            policy,
            shutdown_timeout: Duration::from_secs(3),
            counters: Arc::new(JobCounters::default()),
        }
    }

    /// Queues `job` behind every job already queued for `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The queue is shutting down.
    /// - The key's worker is gone.
    pub fn enqueue(&self, key: &str, job: Job) -> Result<()> {
        if self.shutdown_token.is_cancelled() {
            return Err(Error::ServiceShutdown);
        }

        let mut workers = self.workers.lock();
        let worker = workers.entry(key.to_owned()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(worker_loop(
                key.to_owned(),
                rx,
                self.policy,
                Arc::clone(&self.counters),
            ));
            tx
        });

        worker
            .send(JobRequest::Run(job))
            .map_err(|_| Error::ChannelError {
                context: format!("Job worker for {key} closed"),
            })
    }

    /// Waits until every job queued before this call has finished (or been
    /// dropped).
    pub async fn flush(&self) {
        let barriers: Vec<_> = {
            let workers = self.workers.lock();
            workers
                .values()
                .filter_map(|worker| {
                    let (tx, rx) = oneshot::channel();
                    worker.send(JobRequest::Barrier { response: tx }).ok()?;
                    Some(rx)
                })
                .collect()
        };
        // A worker that went away has nothing left to wait for.
        futures::future::join_all(barriers).await;
    }

    /// Like [`JobQueue::flush`], but only for jobs queued under `key`.
    pub async fn flush_key(&self, key: &str) {
        let barrier = {
            let workers = self.workers.lock();
            workers.get(key).and_then(|worker| {
                let (tx, rx) = oneshot::channel();
                worker.send(JobRequest::Barrier { response: tx }).ok()?;
                Some(rx)
            })
        };
        if let Some(barrier) = barrier {
            let _ = barrier.await;
        }
    }

    pub fn stats(&self) -> JobStats {
        JobStats {
            completed: self.counters.completed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Gracefully shuts down every worker.
    ///
    /// - Refuses new jobs.
    /// - Sends a [`JobRequest::Shutdown`] to each worker, queued behind its
    ///   pending jobs so they drain first.
    /// - Waits (up to 3 seconds per worker) for shutdown acknowledgements.
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();

        let handles: Vec<_> = {
            let mut workers = self.workers.lock();
            workers
                .drain()
                .filter_map(|(key, worker)| {
                    let (tx, rx) = oneshot::channel();
                    if let Err(_e) = worker.send(JobRequest::Shutdown { response: tx }) {
                        #[cfg(feature = "tracing")]
                        tracing::error!("Failed to send shutdown to job worker {key}: {_e}");
                        return None;
                    }
                    Some((key, rx))
                })
                .collect()
        };

        let shutdown_timeout = self.shutdown_timeout;
        let acks = handles.into_iter().map(|(_key, rx)| async move {
            match timeout(shutdown_timeout, rx).await {
                Ok(Ok(())) => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!("Job worker {_key} shutdown acknowledged");
                }
                Ok(Err(_e)) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!("Job worker {_key} returned error: {_e}");
                }
                Err(_) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Job worker {_key} shutdown timed out");
                }
            }
        });
        futures::future::join_all(acks).await;

        #[cfg(feature = "tracing")]
        tracing::debug!("Job queue shutdown complete");
    }
}
