//! Wall-clock source for quota windows.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

/// Unix time read through tokio's monotonic clock.
///
/// The wall-clock offset is captured once at construction; afterwards time
/// advances with `tokio::time::Instant`, which keeps the limiter and the
/// in-process store on the same timeline and lets tests drive both with a
/// paused runtime.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    anchor_unix: Duration,
    anchor: Instant,
}

impl Clock {
    /// Create a clock anchored at the current system time.
    pub fn new() -> Self {
        Self {
            anchor_unix: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default(),
            anchor: Instant::now(),
        }
    }

    /// Time since the Unix epoch.
    pub fn now(&self) -> Duration {
        self.anchor_unix + self.anchor.elapsed()
    }

    /// Whole seconds since the Unix epoch.
    pub fn now_secs(&self) -> u64 {
        self.now().as_secs()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
