//! One-shot, cancellable delayed tasks.

use core::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Spawns delayed tasks that can be cancelled individually or all at once.
///
/// Every task is tied to a child of the scheduler's token, so
/// [`Scheduler::shutdown`] cancels everything still pending.
#[derive(Debug, Default)]
pub struct Scheduler {
    token: CancellationToken,
}

/// Handle to a pending delayed task.
#[derive(Debug)]
pub struct ScheduledTask {
    token: CancellationToken,
}

impl ScheduledTask {
    /// Prevents the task from running if it has not fired yet.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `task` once after `delay` unless cancelled first. Must be called
    /// from within a Tokio runtime.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> ScheduledTask
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.child_token();
        let cancelled = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancelled.cancelled() => {}
                () = sleep(delay) => task.await,
            }
        });
        ScheduledTask { token }
    }

    /// Cancels every pending task.
    pub fn shutdown(&self) {
        self.token.cancel();
    }
}
