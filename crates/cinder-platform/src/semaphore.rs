use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

static NEXT_SEMAPHORE_ID: AtomicU64 = AtomicU64::new(1);

/// Binary semaphore. Signal latches it; a port that consumes it resets it.
pub struct PlatformSemaphore {
    id: u64,
    signaled: Mutex<bool>,
    cond: Condvar,
    watchers: Mutex<Vec<Weak<PortShared>>>,
}

impl Default for PlatformSemaphore {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformSemaphore {
    pub fn new() -> Self {
        Self {
            id: NEXT_SEMAPHORE_ID.fetch_add(1, Ordering::Relaxed),
            signaled: Mutex::new(false),
            cond: Condvar::new(),
            watchers: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn signal(&self) {
        {
            let mut signaled = self.signaled.lock().unwrap();
            *signaled = true;
            self.cond.notify_all();
        }
        let mut watchers = self.watchers.lock().unwrap();
        watchers.retain(|port| {
            if let Some(port) = port.upgrade() {
                port.cond.notify_all();
                true
            } else {
                false
            }
        });
    }

    pub fn reset(&self) {
        *self.signaled.lock().unwrap() = false;
    }

    pub fn is_signaled(&self) -> bool {
        *self.signaled.lock().unwrap()
    }

    fn watch(&self, port: &Arc<PortShared>) {
        self.watchers.lock().unwrap().push(Arc::downgrade(port));
    }
}

/// A batch of semaphores plus the work to run once every one is signaled.
pub struct WaitSet {
    semaphores: Vec<Arc<PlatformSemaphore>>,
    callback: Box<dyn FnOnce() + Send>,
}

impl WaitSet {
    pub fn new(
        semaphores: Vec<Arc<PlatformSemaphore>>,
        callback: Box<dyn FnOnce() + Send>,
    ) -> Self {
        Self {
            semaphores,
            callback,
        }
    }

    fn ready(&self) -> bool {
        self.semaphores.iter().all(|sem| sem.is_signaled())
    }
}

struct PortState {
    wait_sets: Vec<WaitSet>,
    closed: bool,
}

struct PortShared {
    state: Mutex<PortState>,
    cond: Condvar,
}

/// Services wait sets on a dedicated thread: the owner loops on `wait_one`
/// until it returns false (port closed with nothing left to service).
///
/// Completed sets retire in submission order among those that are ready;
/// their semaphores are reset on consumption so they can be reused.
pub struct SemaphorePort {
    shared: Arc<PortShared>,
}

impl Default for SemaphorePort {
    fn default() -> Self {
        Self::new()
    }
}

impl SemaphorePort {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(PortShared {
                state: Mutex::new(PortState {
                    wait_sets: Vec::new(),
                    closed: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn add_wait_set(&self, wait_set: WaitSet) {
        for sem in &wait_set.semaphores {
            sem.watch(&self.shared);
        }
        let mut state = self.shared.state.lock().unwrap();
        assert!(!state.closed, "wait set added to closed port");
        state.wait_sets.push(wait_set);
        self.shared.cond.notify_all();
    }

    /// Blocks until one wait set completes (runs its callback, returns true)
    /// or the port is closed and drained (returns false).
    pub fn wait_one(&self) -> bool {
        let callback = {
            let mut state = self.shared.state.lock().unwrap();
            loop {
                if let Some(pos) = state.wait_sets.iter().position(WaitSet::ready) {
                    let wait_set = state.wait_sets.remove(pos);
                    for sem in &wait_set.semaphores {
                        sem.reset();
                    }
                    break wait_set.callback;
                }
                if state.closed {
                    return false;
                }
                state = self.shared.cond.wait(state).unwrap();
            }
        };
        callback();
        true
    }

    pub fn close(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.closed = true;
        self.shared.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::thread;

    #[test]
    fn empty_wait_set_completes_immediately() {
        let port = SemaphorePort::new();
        let fired = Arc::new(AtomicU32::new(0));
        let fired2 = Arc::clone(&fired);
        port.add_wait_set(WaitSet::new(
            vec![],
            Box::new(move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            }),
        ));
        assert!(port.wait_one());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn waits_for_all_semaphores() {
        let port = Arc::new(SemaphorePort::new());
        let sem_a = Arc::new(PlatformSemaphore::new());
        let sem_b = Arc::new(PlatformSemaphore::new());
        let fired = Arc::new(AtomicU32::new(0));
        let fired2 = Arc::clone(&fired);
        port.add_wait_set(WaitSet::new(
            vec![Arc::clone(&sem_a), Arc::clone(&sem_b)],
            Box::new(move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            }),
        ));

        let waiter = {
            let port = Arc::clone(&port);
            thread::spawn(move || port.wait_one())
        };

        sem_a.signal();
        sem_b.signal();
        assert!(waiter.join().unwrap());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // Consumed: both semaphores reset.
        assert!(!sem_a.is_signaled());
        assert!(!sem_b.is_signaled());
    }

    #[test]
    fn close_wakes_waiter_with_false() {
        let port = Arc::new(SemaphorePort::new());
        let sem = Arc::new(PlatformSemaphore::new());
        port.add_wait_set(WaitSet::new(vec![sem], Box::new(|| {})));

        let waiter = {
            let port = Arc::clone(&port);
            thread::spawn(move || port.wait_one())
        };
        port.close();
        assert!(!waiter.join().unwrap());
    }
}
