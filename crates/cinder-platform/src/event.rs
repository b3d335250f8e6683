use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// One-shot latch: once signaled it stays signaled. Waiters that need a fresh
/// edge swap in a new event instead of resetting this one.
pub struct PlatformEvent {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Default for PlatformEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformEvent {
    pub fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn signal(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        *signaled = true;
        self.cond.notify_all();
    }

    pub fn is_signaled(&self) -> bool {
        *self.signaled.lock().unwrap()
    }

    /// Returns false on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut signaled = self.signaled.lock().unwrap();
        while !*signaled {
            let (guard, result) = self.cond.wait_timeout(signaled, timeout).unwrap();
            signaled = guard;
            if result.timed_out() {
                return *signaled;
            }
        }
        true
    }
}
