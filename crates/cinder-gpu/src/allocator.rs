use crate::GpuAddr;

#[derive(Debug, Clone, Copy)]
struct Region {
    base: GpuAddr,
    size: u64,
}

/// First-fit range allocator over `[base, base + size)`.
///
/// Freed ranges coalesce with adjacent free neighbors. Freeing an address
/// that is not the base of a live allocation is a caller bug and panics.
pub struct SimpleAllocator {
    base: GpuAddr,
    size: u64,
    free: Vec<Region>,
    allocated: Vec<Region>,
}

impl SimpleAllocator {
    pub fn new(base: GpuAddr, size: u64) -> Self {
        Self {
            base,
            size,
            free: vec![Region { base, size }],
            allocated: Vec::new(),
        }
    }

    pub fn base(&self) -> GpuAddr {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Allocates `size` bytes aligned to `1 << align_pow2`. Returns `None`
    /// when no free range fits; the caller treats that as out-of-memory,
    /// not a fatal error.
    pub fn alloc(&mut self, size: u64, align_pow2: u32) -> Option<GpuAddr> {
        if size == 0 {
            return None;
        }
        let alignment = 1u64 << align_pow2;
        for i in 0..self.free.len() {
            let region = self.free[i];
            let addr = (region.base + alignment - 1) & !(alignment - 1);
            let pad = addr - region.base;
            if pad + size > region.size {
                continue;
            }
            // Split the free region around the carved allocation.
            self.free.remove(i);
            if pad > 0 {
                self.free.insert(
                    i,
                    Region {
                        base: region.base,
                        size: pad,
                    },
                );
            }
            let tail = region.size - pad - size;
            if tail > 0 {
                let at = if pad > 0 { i + 1 } else { i };
                self.free.insert(
                    at,
                    Region {
                        base: addr + size,
                        size: tail,
                    },
                );
            }
            self.allocated.push(Region { base: addr, size });
            return Some(addr);
        }
        None
    }

    pub fn free(&mut self, addr: GpuAddr) {
        let pos = self
            .allocated
            .iter()
            .position(|r| r.base == addr)
            .unwrap_or_else(|| panic!("free of unallocated address {addr:#x}"));
        let region = self.allocated.swap_remove(pos);

        let at = self
            .free
            .iter()
            .position(|r| r.base > region.base)
            .unwrap_or(self.free.len());
        self.free.insert(at, region);

        // Coalesce with the neighbor on each side.
        if at + 1 < self.free.len()
            && self.free[at].base + self.free[at].size == self.free[at + 1].base
        {
            self.free[at].size += self.free[at + 1].size;
            self.free.remove(at + 1);
        }
        if at > 0 && self.free[at - 1].base + self.free[at - 1].size == self.free[at].base {
            self.free[at - 1].size += self.free[at].size;
            self.free.remove(at);
        }
    }

    /// Size of the live allocation at `addr`, if any.
    pub fn size_for(&self, addr: GpuAddr) -> Option<u64> {
        self.allocated
            .iter()
            .find(|r| r.base == addr)
            .map(|r| r.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PAGE_SIZE;

    fn overlaps(a: (u64, u64), b: (u64, u64)) -> bool {
        a.0 < b.0 + b.1 && b.0 < a.0 + a.1
    }

    #[test]
    fn allocations_never_overlap() {
        let mut alloc = SimpleAllocator::new(0, 64 * PAGE_SIZE);
        let mut live: Vec<(u64, u64)> = Vec::new();
        for i in 1..=8u64 {
            let size = i * PAGE_SIZE;
            let addr = alloc.alloc(size, 12).unwrap();
            for other in &live {
                assert!(!overlaps((addr, size), *other));
            }
            live.push((addr, size));
        }
    }

    #[test]
    fn alignment_respected() {
        let mut alloc = SimpleAllocator::new(PAGE_SIZE, 1024 * PAGE_SIZE);
        alloc.alloc(PAGE_SIZE, 12).unwrap();
        let addr = alloc.alloc(PAGE_SIZE, 16).unwrap();
        assert_eq!(addr % (1 << 16), 0);
    }

    #[test]
    fn free_coalesces_and_range_is_reusable() {
        let total = 4 * PAGE_SIZE;
        let mut alloc = SimpleAllocator::new(0, total);
        let a = alloc.alloc(PAGE_SIZE, 12).unwrap();
        let b = alloc.alloc(PAGE_SIZE, 12).unwrap();
        let c = alloc.alloc(2 * PAGE_SIZE, 12).unwrap();
        assert!(alloc.alloc(PAGE_SIZE, 12).is_none());

        // Free in an order that exercises both-side coalescing.
        alloc.free(a);
        alloc.free(c);
        alloc.free(b);
        assert_eq!(alloc.alloc(total, 12), Some(0));
    }

    #[test]
    fn allocation_larger_than_any_free_range_fails_nonfatally() {
        let mut alloc = SimpleAllocator::new(0, 4 * PAGE_SIZE);
        let a = alloc.alloc(2 * PAGE_SIZE, 12).unwrap();
        let _b = alloc.alloc(PAGE_SIZE, 12).unwrap();
        alloc.free(a);
        // 3 pages free but not contiguous.
        assert!(alloc.alloc(3 * PAGE_SIZE, 12).is_none());
        // Allocator still usable afterwards.
        assert!(alloc.alloc(2 * PAGE_SIZE, 12).is_some());
    }

    #[test]
    fn size_for_tracks_live_allocations() {
        let mut alloc = SimpleAllocator::new(0, 8 * PAGE_SIZE);
        let a = alloc.alloc(3 * PAGE_SIZE, 12).unwrap();
        assert_eq!(alloc.size_for(a), Some(3 * PAGE_SIZE));
        alloc.free(a);
        assert_eq!(alloc.size_for(a), None);
    }

    #[test]
    #[should_panic(expected = "free of unallocated address")]
    fn free_of_unknown_address_panics() {
        let mut alloc = SimpleAllocator::new(0, PAGE_SIZE);
        alloc.free(0x42);
    }
}
