use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use cinder_platform::{PlatformBuffer, PlatformEvent};
use tracing::warn;

use crate::address_space::AddressSpace;
use crate::mapping::GpuMapping;
use crate::CachingType;

// In-flight counter layout: low 32 bits count outstanding GPU accesses,
// high 32 bits are nonzero while a waiter is parked. Waiters fold the
// current count into the high half with a CAS; the flag then rides along
// until the count reaches zero, so increments that interleave with a parked
// waiter cannot cost it the wakeup.
const INFLIGHT_ONE: u64 = 1;
const INFLIGHT_COUNT_MASK: u64 = 0xffff_ffff;

const WAIT_RENDERING_TIMEOUT: Duration = Duration::from_secs(5);

/// Driver-side buffer state layered over a platform buffer: caching type,
/// the registry of this buffer's GPU mappings, and the in-flight counter
/// `wait_rendering` blocks on.
pub struct Buffer {
    platform: Arc<dyn PlatformBuffer>,
    caching: CachingType,
    mappings: Mutex<Vec<Weak<GpuMapping>>>,
    inflight: AtomicU64,
    wait_event: Mutex<Arc<PlatformEvent>>,
    wait_serial: Mutex<()>,
}

impl Buffer {
    pub fn new(platform: Arc<dyn PlatformBuffer>, caching: CachingType) -> Arc<Self> {
        Arc::new(Self {
            platform,
            caching,
            mappings: Mutex::new(Vec::new()),
            inflight: AtomicU64::new(0),
            wait_event: Mutex::new(Arc::new(PlatformEvent::new())),
            wait_serial: Mutex::new(()),
        })
    }

    pub fn platform(&self) -> &Arc<dyn PlatformBuffer> {
        &self.platform
    }

    pub fn id(&self) -> u64 {
        self.platform.id()
    }

    pub fn size(&self) -> u64 {
        self.platform.size()
    }

    pub fn caching(&self) -> CachingType {
        self.caching
    }

    // --- mapping registry ---

    pub fn share_mapping(&self, mapping: &Arc<GpuMapping>) {
        self.mappings.lock().unwrap().push(Arc::downgrade(mapping));
    }

    /// A live shared mapping in `address_space` is reusable for
    /// `(offset, length)` when the offsets match, the mapped length covers
    /// the request, and its GPU address already satisfies `align_pow2`.
    pub fn find_mapping(
        &self,
        address_space: &Arc<dyn AddressSpace>,
        offset: u64,
        length: u64,
        align_pow2: u32,
    ) -> Option<Arc<GpuMapping>> {
        let want = Arc::downgrade(address_space);
        let mappings = self.mappings.lock().unwrap();
        for weak in mappings.iter() {
            if let Some(mapping) = weak.upgrade() {
                if Weak::ptr_eq(mapping.address_space(), &want)
                    && mapping.offset() == offset
                    && mapping.length() >= length
                    && mapping.gpu_addr() % (1u64 << align_pow2) == 0
                {
                    return Some(mapping);
                }
            }
        }
        None
    }

    /// Live shared mappings in `address_space`. Expired registry entries are
    /// collected here rather than eagerly on mapping drop.
    pub fn shared_mappings_for(
        &self,
        address_space: &Arc<dyn AddressSpace>,
    ) -> Vec<Arc<GpuMapping>> {
        let want = Arc::downgrade(address_space);
        let mut mappings = self.mappings.lock().unwrap();
        let mut found = Vec::new();
        mappings.retain(|weak| match weak.upgrade() {
            Some(mapping) => {
                if Weak::ptr_eq(mapping.address_space(), &want) {
                    found.push(mapping);
                }
                true
            }
            None => false,
        });
        found
    }

    /// Drops the registry's references to this buffer's mappings in
    /// `address_space` and returns the still-live ones so the caller can
    /// drop any other owners (the mapping cache).
    pub fn remove_mappings_for(
        &self,
        address_space: &Arc<dyn AddressSpace>,
    ) -> Vec<Arc<GpuMapping>> {
        let want = Arc::downgrade(address_space);
        let mut mappings = self.mappings.lock().unwrap();
        let mut removed = Vec::new();
        mappings.retain(|weak| match weak.upgrade() {
            Some(mapping) => {
                if Weak::ptr_eq(mapping.address_space(), &want) {
                    removed.push(mapping);
                    false
                } else {
                    true
                }
            }
            None => false,
        });
        removed
    }

    // --- in-flight tracking ---

    pub fn increment_inflight(&self) {
        self.inflight.fetch_add(INFLIGHT_ONE, Ordering::SeqCst);
    }

    pub fn decrement_inflight(&self) {
        loop {
            let val = self.inflight.load(Ordering::SeqCst);
            let count = val & INFLIGHT_COUNT_MASK;
            assert!(count != 0, "in-flight counter underflow");
            // The last decrement clears the waiter flag along with the
            // count and delivers the wakeup.
            let new = if count == 1 { 0 } else { val - INFLIGHT_ONE };
            if self
                .inflight
                .compare_exchange_weak(val, new, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                if count == 1 && val >> 32 != 0 {
                    self.wait_event.lock().unwrap().signal();
                }
                return;
            }
        }
    }

    pub fn inflight_count(&self) -> u32 {
        self.inflight.load(Ordering::SeqCst) as u32
    }

    /// Blocks until every in-flight GPU access outstanding at the time of
    /// the call has retired. Callable from any thread.
    pub fn wait_rendering(&self) {
        let _serial = self.wait_serial.lock().unwrap();
        loop {
            let val = self.inflight.load(Ordering::SeqCst);
            if val == 0 {
                return;
            }
            if self
                .inflight
                .compare_exchange(val, val | (val << 32), Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                continue;
            }
            let event = self.wait_event.lock().unwrap().clone();
            while !event.wait(WAIT_RENDERING_TIMEOUT) {
                warn!(
                    buffer_id = self.id(),
                    inflight = self.inflight.load(Ordering::SeqCst),
                    "wait_rendering still blocked, retrying"
                );
            }
            // Replace the latched event before re-checking the counter.
            *self.wait_event.lock().unwrap() = Arc::new(PlatformEvent::new());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_platform::{HeapBuffer, PAGE_SIZE};
    use std::thread;

    fn new_buffer(pages: u64) -> Arc<Buffer> {
        Buffer::new(Arc::new(HeapBuffer::new(pages * PAGE_SIZE)), CachingType::Llc)
    }

    #[test]
    fn wait_rendering_returns_immediately_when_idle() {
        let buffer = new_buffer(1);
        buffer.wait_rendering();
    }

    #[test]
    fn inflight_counts_balance() {
        let buffer = new_buffer(1);
        buffer.increment_inflight();
        buffer.increment_inflight();
        assert_eq!(buffer.inflight_count(), 2);
        buffer.decrement_inflight();
        buffer.decrement_inflight();
        assert_eq!(buffer.inflight_count(), 0);
    }

    #[test]
    #[should_panic(expected = "in-flight counter underflow")]
    fn decrement_below_zero_panics() {
        let buffer = new_buffer(1);
        buffer.decrement_inflight();
    }

    #[test]
    fn wait_rendering_blocks_until_decremented() {
        let buffer = new_buffer(1);
        buffer.increment_inflight();
        buffer.increment_inflight();

        let waiter = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || buffer.wait_rendering())
        };
        // Give the waiter a chance to park.
        thread::sleep(Duration::from_millis(10));
        buffer.decrement_inflight();
        buffer.decrement_inflight();
        waiter.join().unwrap();
        assert_eq!(buffer.inflight_count(), 0);
    }

    #[test]
    fn waiter_survives_increment_after_parking() {
        let buffer = new_buffer(1);
        buffer.increment_inflight();

        let waiter = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || buffer.wait_rendering())
        };
        // Let the waiter fold its flag and park, then submit more work
        // before the original count drains.
        thread::sleep(Duration::from_millis(10));
        buffer.increment_inflight();
        buffer.decrement_inflight();
        buffer.decrement_inflight();

        waiter.join().unwrap();
        assert_eq!(buffer.inflight_count(), 0);
    }

    #[test]
    fn wait_rendering_stress_no_missed_wakeups() {
        let buffer = new_buffer(1);
        for round in 0..50u32 {
            let n = 1 + (round % 7);
            // Hold one count so waiters can park before the churn starts.
            buffer.increment_inflight();
            let waiters: Vec<_> = (0..3)
                .map(|_| {
                    let buffer = Arc::clone(&buffer);
                    thread::spawn(move || buffer.wait_rendering())
                })
                .collect();
            // Increments interleave with parked waiters; the final
            // decrement must still deliver every wakeup.
            let churn = {
                let buffer = Arc::clone(&buffer);
                thread::spawn(move || {
                    for _ in 0..n {
                        buffer.increment_inflight();
                        thread::yield_now();
                        buffer.decrement_inflight();
                    }
                    buffer.decrement_inflight();
                })
            };
            churn.join().unwrap();
            for waiter in waiters {
                waiter.join().unwrap();
            }
            assert_eq!(buffer.inflight_count(), 0);
        }
    }
}
