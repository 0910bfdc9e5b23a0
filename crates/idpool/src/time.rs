use portable_atomic::{AtomicU64, Ordering};
use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

/// A trait for time sources that return wall-clock seconds since the Unix
/// epoch.
///
/// Quarantine readiness, lease expiry and sibling idleness are all expressed in
/// whole Unix seconds, so every component that needs "now" takes it from a
/// [`TimeSource`]. This allows you to plug in the system clock or a manually
/// driven clock in tests.
///
/// # Example
///
/// ```
/// use idpool::TimeSource;
///
/// struct FixedTime;
/// impl TimeSource for FixedTime {
///     fn unix_secs(&self) -> u64 {
///         1234
///     }
/// }
///
/// assert_eq!(FixedTime.unix_secs(), 1234);
/// ```
pub trait TimeSource: Send + Sync + 'static {
    /// Returns the current time in seconds since 1970-01-01 UTC.
    fn unix_secs(&self) -> u64;
}

/// Wall-clock time source backed by [`SystemTime`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn unix_secs(&self) -> u64 {
        // A clock set before 1970 is treated as the epoch itself.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs())
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same underlying counter, so a test can hand one clone to a
/// coordinator and advance time from the outside.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    secs: Arc<AtomicU64>,
}

impl ManualClock {
    /// Creates a clock frozen at `secs`.
    pub fn new(secs: u64) -> Self {
        Self {
            secs: Arc::new(AtomicU64::new(secs)),
        }
    }

    /// Moves the clock forward by `secs`.
    pub fn advance(&self, secs: u64) {
        self.secs.fetch_add(secs, Ordering::Relaxed);
    }

    /// Jumps the clock to `secs`.
    pub fn set(&self, secs: u64) {
        self.secs.store(secs, Ordering::Relaxed);
    }
}

impl TimeSource for ManualClock {
    fn unix_secs(&self) -> u64 {
        self.secs.load(Ordering::Relaxed)
    }
}

impl<T: TimeSource> TimeSource for Arc<T> {
    fn unix_secs(&self) -> u64 {
        (**self).unix_secs()
    }
}
