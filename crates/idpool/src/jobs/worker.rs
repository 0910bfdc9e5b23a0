use super::{Job, JobOutcome, JobRequest, RetryPolicy, queue::JobCounters};
use std::sync::Arc;
use tokio::{sync::mpsc, time::sleep};

/// Worker task responsible for one job key.
///
/// The worker owns the receiving end of the key's channel and processes
/// requests one at a time, which is what makes jobs for the same key strictly
/// ordered. It runs until a [`JobRequest::Shutdown`] is received or every
/// sender is gone.
///
/// # Request Types
///
/// - [`JobRequest::Run`]: runs the job with retries.
/// - [`JobRequest::Barrier`]: acknowledges that everything before it ran.
/// - [`JobRequest::Shutdown`]: acknowledges and stops the worker.
pub(crate) async fn worker_loop(
    key: String,
    mut rx: mpsc::UnboundedReceiver<JobRequest>,
    policy: RetryPolicy,
    counters: Arc<JobCounters>,
) {
    #[cfg(feature = "tracing")]
    tracing::trace!("Job worker for {key} started");

    while let Some(request) = rx.recv().await {
        match request {
            JobRequest::Run(job) => {
                let outcome = run_with_retries(&key, job, policy).await;
                counters.record(&outcome);
            }
            JobRequest::Barrier { response } => {
                let _ = response.send(());
            }
            JobRequest::Shutdown { response } => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Job worker for {key} received shutdown signal");

                if response.send(()).is_err() {
                    #[cfg(feature = "tracing")]
                    tracing::error!("Job worker for {key} failed to acknowledge shutdown");
                }
                break;
            }
        }
    }

    #[cfg(feature = "tracing")]
    tracing::trace!("Job worker for {key} stopped");
}

async fn run_with_retries(_key: &str, mut job: Job, policy: RetryPolicy) -> JobOutcome {
    let mut attempt = 0;
    let outcome = loop {
        match (job.attempt)().await {
            Ok(()) => break JobOutcome::Completed,
            Err(e) if attempt >= policy.max_retries => {
                #[cfg(feature = "tracing")]
                tracing::error!(
                    key = _key,
                    job = job.label,
                    attempts = attempt + 1,
                    "Dropping job after exhausting retries: {e}"
                );
                break JobOutcome::Dropped(e);
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    key = _key,
                    job = job.label,
                    attempt,
                    "Job failed, retrying: {_e}"
                );
                attempt += 1;
                sleep(policy.backoff).await;
            }
        }
    };

    if let Some(done) = job.done.take() {
        let _ = done.send(outcome.clone());
    }
    outcome
}
