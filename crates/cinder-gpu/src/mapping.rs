use std::fmt;
use std::sync::{Arc, Weak};

use tracing::warn;

use crate::address_space::AddressSpace;
use crate::buffer::Buffer;
use crate::{GpuAddr, PAGE_SHIFT};

/// A buffer's presence in one address space.
///
/// Shared via `Arc`; the buffer's registry and the mapping cache hold the
/// references that keep it alive. Dropping the last `Arc` tears the range
/// down exactly once. The address-space back-reference is weak: if the
/// address space died first (connection teardown), there is nothing to
/// clear and the drop only unpins the pages.
pub struct GpuMapping {
    buffer: Arc<Buffer>,
    address_space: Weak<dyn AddressSpace>,
    gpu_addr: GpuAddr,
    offset: u64,
    length: u64,
}

impl GpuMapping {
    pub(crate) fn new(
        buffer: Arc<Buffer>,
        address_space: &Arc<dyn AddressSpace>,
        gpu_addr: GpuAddr,
        offset: u64,
        length: u64,
    ) -> Self {
        Self {
            buffer,
            address_space: Arc::downgrade(address_space),
            gpu_addr,
            offset,
            length,
        }
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    pub fn gpu_addr(&self) -> GpuAddr {
        self.gpu_addr
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Mapped length, a page multiple.
    pub fn length(&self) -> u64 {
        self.length
    }

    pub(crate) fn address_space(&self) -> &Weak<dyn AddressSpace> {
        &self.address_space
    }
}

impl fmt::Debug for GpuMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuMapping")
            .field("buffer_id", &self.buffer.id())
            .field("gpu_addr", &format_args!("{:#x}", self.gpu_addr))
            .field("offset", &self.offset)
            .field("length", &self.length)
            .finish()
    }
}

impl Drop for GpuMapping {
    fn drop(&mut self) {
        if let Some(aspace) = self.address_space.upgrade() {
            if let Err(err) = aspace.clear(self.gpu_addr) {
                warn!(gpu_addr = self.gpu_addr, %err, "failed to clear mapping");
            }
            aspace.free(self.gpu_addr);
        }
        let start_page = (self.offset >> PAGE_SHIFT) as u32;
        let page_count = (self.length >> PAGE_SHIFT) as u32;
        if let Err(err) = self.buffer.platform().unpin_pages(start_page, page_count) {
            warn!(buffer_id = self.buffer.id(), %err, "failed to unpin pages");
        }
    }
}
