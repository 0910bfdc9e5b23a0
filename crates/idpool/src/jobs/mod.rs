//! Ordered, retried, asynchronous persistence jobs.
//!
//! Jobs are grouped by a key (the pool name). Each key gets its own worker
//! task that runs jobs strictly in submission order, retrying transient
//! failures a fixed number of times before logging and dropping the job.
//! Different keys proceed independently.

mod queue;
mod worker;

pub use queue::*;

use crate::{Error, Result};
use core::time::Duration;
use futures::future::BoxFuture;
use tokio::sync::oneshot;

/// Future produced by one attempt of a [`Job`].
pub type JobFuture = BoxFuture<'static, Result<()>>;

/// Final result of a [`Job`] after all attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    /// An attempt succeeded.
    Completed,
    /// Every attempt failed; the last error is kept.
    Dropped(Error),
}

/// A retryable unit of work.
///
/// `attempt` is called once per try and must build a fresh future each time.
pub struct Job {
    pub(crate) label: &'static str,
    pub(crate) attempt: Box<dyn FnMut() -> JobFuture + Send>,
    pub(crate) done: Option<oneshot::Sender<JobOutcome>>,
    held: Vec<Box<dyn Send>>,
}

impl Job {
    pub fn new<F>(label: &'static str, attempt: F) -> Self
    where
        F: FnMut() -> JobFuture + Send + 'static,
    {
        Self {
            label,
            attempt: Box::new(attempt),
            done: None,
            held: Vec::new(),
        }
    }

    /// Reports the job's final outcome on `done`.
    pub fn on_done(mut self, done: oneshot::Sender<JobOutcome>) -> Self {
        self.done = Some(done);
        self
    }

    /// Keeps `guard` alive until the job has finished or been discarded.
    pub fn hold<G: Send + 'static>(mut self, guard: G) -> Self {
        self.held.push(Box::new(guard));
        self
    }
}

impl core::fmt::Debug for Job {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Job").field("label", &self.label).finish()
    }
}

/// How often a failing job is retried and how long to wait between tries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

/// Messages understood by a key's worker.
#[derive(Debug)]
pub(crate) enum JobRequest {
    Run(Job),
    /// Acknowledged once everything queued before it has run.
    Barrier { response: oneshot::Sender<()> },
    /// Acknowledged after draining, then the worker exits.
    Shutdown { response: oneshot::Sender<()> },
}
