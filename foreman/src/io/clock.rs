//! Wall-clock seam for the control loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

const SLEEP_SLICE: Duration = Duration::from_millis(250);

/// Source of time and interruptible sleeps.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;

    /// Sleep for `duration`, waking early once `shutdown` is set.
    ///
    /// Returns true when the sleep was cut short by shutdown.
    fn sleep(&self, duration: Duration, shutdown: &AtomicBool) -> bool;

    /// Sleep until `deadline` (no-op if it already passed).
    fn sleep_until(&self, deadline: DateTime<Utc>, shutdown: &AtomicBool) -> bool {
        let remaining = (deadline - self.now()).to_std().unwrap_or(Duration::ZERO);
        self.sleep(remaining, shutdown)
    }
}

/// Real time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration, shutdown: &AtomicBool) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if shutdown.load(Ordering::SeqCst) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}
