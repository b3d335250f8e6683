use std::sync::{Arc, Mutex};

use bitflags::bitflags;
use cinder_platform::{PlatformBuffer, RegisterIo, PAGE_SHIFT, PAGE_SIZE};

use crate::address_space::{AddressSpace, GUARD_PAGE_COUNT};
use crate::allocator::SimpleAllocator;
use crate::{AddressSpaceId, CachingType, GpuAddr, Status};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const VALID = 1 << 0;
        const CACHE_LLC = 1 << 1;
        const CACHE_WT = 1 << 2;
    }
}

/// Page-table entry: page-aligned bus address in the high bits, flags in
/// the low 12.
pub fn encode_pte(bus_addr: u64, caching: CachingType) -> u64 {
    debug_assert_eq!(bus_addr % PAGE_SIZE, 0);
    let flags = match caching {
        CachingType::None => PteFlags::VALID,
        CachingType::Llc => PteFlags::VALID | PteFlags::CACHE_LLC,
        CachingType::WriteThrough => PteFlags::VALID | PteFlags::CACHE_WT,
    };
    bus_addr | flags.bits()
}

/// Global graphics translation table. The PTE array occupies the upper half
/// of the register MMIO bank; one entry per page of aperture. Every entry
/// points at a live pinned page or at the device scratch page.
pub struct Gtt {
    reg_io: Arc<RegisterIo>,
    // Keeps the scratch page pinned for the GTT's lifetime.
    _scratch: Arc<dyn PlatformBuffer>,
    scratch_pte: u64,
    pte_base: u64,
    size: u64,
    allocator: Mutex<SimpleAllocator>,
}

impl Gtt {
    /// Fills the whole table with scratch entries. `scratch` must be at
    /// least one page; its first page is pinned here.
    pub fn new(
        reg_io: Arc<RegisterIo>,
        scratch: Arc<dyn PlatformBuffer>,
    ) -> Result<Arc<Self>, Status> {
        scratch.pin_pages(0, 1)?;
        let scratch_bus_addr = scratch.bus_addresses(0, 1)?[0];
        let pte_base = reg_io.size() / 2;
        let entry_count = (reg_io.size() / 2) / 8;
        let size = entry_count * PAGE_SIZE;
        let gtt = Arc::new(Self {
            reg_io,
            _scratch: scratch,
            scratch_pte: encode_pte(scratch_bus_addr, CachingType::None),
            pte_base,
            size,
            // Page 0 stays scratch so address 0 is never handed out.
            allocator: Mutex::new(SimpleAllocator::new(PAGE_SIZE, size - PAGE_SIZE)),
        });
        for idx in 0..entry_count {
            gtt.write_pte(idx, gtt.scratch_pte);
        }
        Ok(gtt)
    }

    fn write_pte(&self, idx: u64, pte: u64) {
        self.reg_io.write64(self.pte_base + idx * 8, pte);
    }

    pub fn read_pte(&self, idx: u64) -> u64 {
        self.reg_io.read64(self.pte_base + idx * 8)
    }

    pub fn scratch_pte(&self) -> u64 {
        self.scratch_pte
    }
}

impl AddressSpace for Gtt {
    fn id(&self) -> AddressSpaceId {
        AddressSpaceId::Gtt
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn alloc(&self, size: u64, align_pow2: u32) -> Option<GpuAddr> {
        self.allocator
            .lock()
            .unwrap()
            .alloc(size, align_pow2.max(PAGE_SHIFT))
    }

    fn free(&self, addr: GpuAddr) {
        self.allocator.lock().unwrap().free(addr);
    }

    fn insert(
        &self,
        addr: GpuAddr,
        buffer: &dyn PlatformBuffer,
        offset: u64,
        length: u64,
        caching: CachingType,
    ) -> Result<(), Status> {
        let alloc_size = self
            .allocator
            .lock()
            .unwrap()
            .size_for(addr)
            .unwrap_or_else(|| panic!("insert at unallocated address {addr:#x}"));
        if length + GUARD_PAGE_COUNT * PAGE_SIZE > alloc_size {
            return Err(Status::InvalidArgs);
        }
        let page_count = length >> PAGE_SHIFT;
        let bus_addrs =
            buffer.bus_addresses((offset >> PAGE_SHIFT) as u32, page_count as u32)?;
        let first = addr >> PAGE_SHIFT;
        for (i, bus_addr) in bus_addrs.iter().enumerate() {
            self.write_pte(first + i as u64, encode_pte(*bus_addr, caching));
        }
        for i in 0..GUARD_PAGE_COUNT {
            self.write_pte(first + page_count + i, self.scratch_pte);
        }
        // Posting read so the table update lands before any submission that
        // depends on it.
        let _ = self.read_pte(first + page_count + GUARD_PAGE_COUNT - 1);
        Ok(())
    }

    fn clear(&self, addr: GpuAddr) -> Result<(), Status> {
        let alloc_size = self
            .allocator
            .lock()
            .unwrap()
            .size_for(addr)
            .unwrap_or_else(|| panic!("clear of unallocated address {addr:#x}"));
        let first = addr >> PAGE_SHIFT;
        for i in 0..(alloc_size >> PAGE_SHIFT) {
            self.write_pte(first + i, self.scratch_pte);
        }
        Ok(())
    }
}
