use std::sync::{Arc, Mutex};

use cinder_platform::{BufferFactory, PlatformBuffer, PAGE_SHIFT, PAGE_SIZE};

use crate::address_space::{AddressSpace, GUARD_PAGE_COUNT};
use crate::allocator::SimpleAllocator;
use crate::gtt::encode_pte;
use crate::{AddressSpaceId, CachingType, GpuAddr, Status};

/// Per-process address space size.
pub const PPGTT_SIZE: u64 = 1 << 28;

/// Per-process translation table. The entry array lives in platform-buffer
/// pages rather than the register bank; the scratch page is shared from the
/// device, so client teardown never races the GTT's scratch lifetime.
pub struct PerProcessGtt {
    table: Arc<dyn PlatformBuffer>,
    scratch_pte: u64,
    allocator: Mutex<SimpleAllocator>,
}

impl PerProcessGtt {
    pub fn new(
        buffer_factory: &dyn BufferFactory,
        scratch_bus_addr: u64,
    ) -> Result<Arc<Self>, Status> {
        let entry_count = PPGTT_SIZE >> PAGE_SHIFT;
        let table = buffer_factory.create(entry_count * 8);
        let scratch_pte = encode_pte(scratch_bus_addr, CachingType::None);
        for idx in 0..entry_count {
            table.write_u64(idx * 8, scratch_pte)?;
        }
        Ok(Arc::new(Self {
            table,
            scratch_pte,
            // Page 0 stays scratch so address 0 is never handed out.
            allocator: Mutex::new(SimpleAllocator::new(PAGE_SIZE, PPGTT_SIZE - PAGE_SIZE)),
        }))
    }

    pub fn read_pte(&self, idx: u64) -> Result<u64, Status> {
        Ok(self.table.read_u64(idx * 8)?)
    }

    pub fn scratch_pte(&self) -> u64 {
        self.scratch_pte
    }
}

impl AddressSpace for PerProcessGtt {
    fn id(&self) -> AddressSpaceId {
        AddressSpaceId::Ppgtt
    }

    fn size(&self) -> u64 {
        PPGTT_SIZE
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
            self.table
                .write_u64((first + i as u64) * 8, encode_pte(*bus_addr, caching))?;
        }
        for i in 0..GUARD_PAGE_COUNT {
            self.table
                .write_u64((first + page_count + i) * 8, self.scratch_pte)?;
        }
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
            self.table.write_u64((first + i) * 8, self.scratch_pte)?;
        }
        Ok(())
    }
}
