//! Locking primitives shared by the clock sources and the synchronization domain.
//!
//! Everything is re-exported from `parking_lot`: its guards never poison, so a
//! handler that panics while a clock source is locked does not render the
//! source unusable for the remaining participants.

pub use std::sync::Arc;

pub use parking_lot::{Condvar, Mutex, MutexGuard, ReentrantMutex};

/// Auto-reset event used to wake a parked worker thread early.
///
/// A `notify` before `wait` is not lost: the next `wait` returns immediately
/// and consumes the notification.
#[derive(Default)]
pub struct Signal {
    notified: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        *self.notified.lock() = true;
        self.cond.notify_one();
    }

    /// Waits for a notification or until `timeout` elapses.
    ///
    /// Returns `true` when woken by a notification.
    pub fn wait(&self, timeout: std::time::Duration) -> bool {
        let mut notified = self.notified.lock();
        while !*notified {
            if self.cond.wait_for(&mut notified, timeout).timed_out() {
                return false;
            }
        }
        *notified = false;
        true
    }
}
