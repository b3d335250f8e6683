use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use cinder_platform::{round_up, PlatformBuffer, PAGE_SHIFT, PAGE_SIZE};

use crate::buffer::Buffer;
use crate::mapping::GpuMapping;
use crate::{AddressSpaceId, CachingType, GpuAddr, Status};

/// Scratch-backed guard entries written past the end of every mapping, so a
/// command streamer overfetching beyond a batch reads scratch instead of
/// faulting or touching a neighbor.
pub const GUARD_PAGE_COUNT: u64 = 8;

/// One GPU address space: allocation of ranges and programming of the page
/// table that backs them. All methods take `&self`; implementations guard
/// their state internally because mapping teardown can run on any thread.
///
/// `free` and `clear` of an address with no live allocation are caller bugs
/// and panic.
pub trait AddressSpace: Send + Sync {
    fn id(&self) -> AddressSpaceId;
    fn size(&self) -> u64;

    fn alloc(&self, size: u64, align_pow2: u32) -> Option<GpuAddr>;
    fn free(&self, addr: GpuAddr);

    /// Points `length / PAGE_SIZE` entries at `addr` to the pinned pages of
    /// `buffer` starting at `offset`, then `GUARD_PAGE_COUNT` entries at
    /// scratch. The allocation at `addr` must cover both.
    fn insert(
        &self,
        addr: GpuAddr,
        buffer: &dyn PlatformBuffer,
        offset: u64,
        length: u64,
        caching: CachingType,
    ) -> Result<(), Status>;

    /// Rewrites every entry of the allocation at `addr` to scratch.
    fn clear(&self, addr: GpuAddr) -> Result<(), Status>;
}

/// Allocates a range for `buffer[offset, offset + length)` and maps it.
/// `offset` must be page aligned; `length` is rounded up to a page multiple
/// and must land inside the buffer.
pub fn map_buffer_gpu(
    address_space: &Arc<dyn AddressSpace>,
    buffer: &Arc<Buffer>,
    offset: u64,
    length: u64,
    align_pow2: u32,
) -> Result<Arc<GpuMapping>, Status> {
    if offset % PAGE_SIZE != 0 || length == 0 {
        return Err(Status::InvalidArgs);
    }
    let length = round_up(length, PAGE_SIZE);
    if offset + length > buffer.size() {
        return Err(Status::InvalidArgs);
    }

    let start_page = (offset >> PAGE_SHIFT) as u32;
    let page_count = (length >> PAGE_SHIFT) as u32;
    buffer.platform().pin_pages(start_page, page_count)?;

    let alloc_size = length + GUARD_PAGE_COUNT * PAGE_SIZE;
    let gpu_addr = match address_space.alloc(alloc_size, align_pow2) {
        Some(addr) => addr,
        None => {
            let _ = buffer.platform().unpin_pages(start_page, page_count);
            return Err(Status::OutOfGpuMemory);
        }
    };

    if let Err(err) = address_space.insert(gpu_addr, buffer.platform().as_ref(), offset, length, buffer.caching())
    {
        address_space.free(gpu_addr);
        let _ = buffer.platform().unpin_pages(start_page, page_count);
        return Err(err);
    }

    Ok(Arc::new(GpuMapping::new(
        Arc::clone(buffer),
        address_space,
        gpu_addr,
        offset,
        length,
    )))
}

/// Reuses a compatible shared mapping or creates and shares a new one.
pub fn get_shared_gpu_mapping(
    address_space: &Arc<dyn AddressSpace>,
    buffer: &Arc<Buffer>,
    offset: u64,
    length: u64,
    align_pow2: u32,
) -> Result<Arc<GpuMapping>, Status> {
    let length = round_up(length, PAGE_SIZE);
    if let Some(mapping) = buffer.find_mapping(address_space, offset, length, align_pow2) {
        return Ok(mapping);
    }
    let mapping = map_buffer_gpu(address_space, buffer, offset, length, align_pow2)?;
    buffer.share_mapping(&mapping);
    Ok(mapping)
}

/// Drops all of `buffer`'s mappings in `address_space`, purging the cache's
/// references so the ranges actually tear down.
pub fn release_buffer(
    address_space: &Arc<dyn AddressSpace>,
    cache: &MappingCache,
    buffer: &Buffer,
) {
    cache.purge_buffer(buffer.id());
    drop(buffer.remove_mappings_for(address_space));
}

/// Bounded FIFO of recently dropped mappings. Holding the `Arc` keeps the
/// PTEs live, so remapping the same buffer range hits `find_mapping` instead
/// of re-pinning and re-allocating.
pub struct MappingCache {
    entries: Mutex<VecDeque<Arc<GpuMapping>>>,
    capacity: usize,
}

impl MappingCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    pub fn add(&self, mapping: Arc<GpuMapping>) {
        let mut entries = self.entries.lock().unwrap();
        entries.push_back(mapping);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    pub fn purge_buffer(&self, buffer_id: u64) {
        self.entries
            .lock()
            .unwrap()
            .retain(|m| m.buffer().id() != buffer_id);
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}
