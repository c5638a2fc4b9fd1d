//! Injectable clocks.
//!
//! Workflow code never reads wall-clock time directly. The runner and every
//! timer it owns read time through a [`Clock`], which is a virtual clock in
//! replay and tests.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time as Unix milliseconds
    fn current_time_millis(&self) -> i64;
}

/// Wall-clock time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn current_time_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct VirtualClock {
    millis: AtomicI64,
}

impl VirtualClock {
    pub fn new(start_millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(start_millis),
        }
    }

    pub fn set_millis(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) -> i64 {
        let delta = by.as_millis() as i64;
        self.millis.fetch_add(delta, Ordering::SeqCst) + delta
    }
}

impl Clock for VirtualClock {
    fn current_time_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}
