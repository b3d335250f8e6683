use std::sync::{Condvar, Mutex};

/// Interrupt line as seen by the driver's interrupt thread.
///
/// `wait` blocks until the line fires or is closed (returns false on close);
/// `complete` acks the interrupt so the line can fire again.
pub trait PlatformInterrupt: Send + Sync {
    fn wait(&self) -> bool;
    fn complete(&self);
    fn close(&self);
}

struct FakeInterruptState {
    pending: u64,
    closed: bool,
}

/// Test interrupt line. The test calls `signal` to fire it.
pub struct FakeInterrupt {
    state: Mutex<FakeInterruptState>,
    cond: Condvar,
}

impl Default for FakeInterrupt {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeInterrupt {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeInterruptState {
                pending: 0,
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn signal(&self) {
        let mut state = self.state.lock().unwrap();
        state.pending += 1;
        self.cond.notify_all();
    }
}

impl PlatformInterrupt for FakeInterrupt {
    fn wait(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.pending > 0 {
                state.pending -= 1;
                return true;
            }
            if state.closed {
                return false;
            }
            state = self.cond.wait(state).unwrap();
        }
    }

    fn complete(&self) {}

    fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        self.cond.notify_all();
    }
}
