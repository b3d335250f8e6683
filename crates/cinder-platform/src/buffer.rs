use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::{PlatformError, PAGE_SHIFT, PAGE_SIZE};

/// A chunk of CPU-visible memory that can be pinned and handed to the GPU.
///
/// Reads and writes are CPU accesses through the buffer's mapping.
/// `bus_addresses` is only valid for pinned pages; the driver core programs
/// those addresses into page-table entries.
pub trait PlatformBuffer: Send + Sync {
    fn size(&self) -> u64;

    /// Stable identity, unique per buffer for the lifetime of the process.
    fn id(&self) -> u64;

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), PlatformError>;
    fn write(&self, offset: u64, buf: &[u8]) -> Result<(), PlatformError>;

    fn pin_pages(&self, start_page: u32, page_count: u32) -> Result<(), PlatformError>;
    fn unpin_pages(&self, start_page: u32, page_count: u32) -> Result<(), PlatformError>;

    /// Physical (bus) address of each page in `[start_page, start_page + page_count)`.
    fn bus_addresses(&self, start_page: u32, page_count: u32) -> Result<Vec<u64>, PlatformError>;

    fn read_u32(&self, offset: u64) -> Result<u32, PlatformError> {
        let mut buf = [0u8; 4];
        self.read(offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn write_u32(&self, offset: u64, val: u32) -> Result<(), PlatformError> {
        self.write(offset, &val.to_le_bytes())
    }

    fn read_u64(&self, offset: u64) -> Result<u64, PlatformError> {
        let mut buf = [0u8; 8];
        self.read(offset, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u64(&self, offset: u64, val: u64) -> Result<(), PlatformError> {
        self.write(offset, &val.to_le_bytes())
    }
}

/// Creation seam for platform buffers; the driver core allocates context
/// images, rings, status pages and page-table backing through this.
pub trait BufferFactory: Send + Sync {
    fn create(&self, size: u64) -> Arc<dyn PlatformBuffer>;
}

/// Factory producing [`HeapBuffer`]s.
pub struct HeapBufferFactory;

impl BufferFactory for HeapBufferFactory {
    fn create(&self, size: u64) -> Arc<dyn PlatformBuffer> {
        Arc::new(HeapBuffer::new(size))
    }
}

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_BUS_ADDR: AtomicU64 = AtomicU64::new(0x1_0000_0000);

/// Heap-backed `PlatformBuffer`. Pages are assigned distinct fake bus
/// addresses at creation; pinning just tracks a refcount per range so misuse
/// (programming PTEs for unpinned pages) is caught in tests.
pub struct HeapBuffer {
    id: u64,
    bus_base: u64,
    data: Mutex<Vec<u8>>,
    pin_counts: Mutex<Vec<u32>>,
}

impl HeapBuffer {
    pub fn new(size: u64) -> Self {
        let size = crate::round_up(size.max(1), PAGE_SIZE);
        let page_count = (size >> PAGE_SHIFT) as usize;
        Self {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            bus_base: NEXT_BUS_ADDR.fetch_add(size, Ordering::Relaxed),
            data: Mutex::new(vec![0u8; size as usize]),
            pin_counts: Mutex::new(vec![0u32; page_count]),
        }
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<(), PlatformError> {
        let size = self.size();
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(()),
            _ => Err(PlatformError::OutOfRange { offset, len, size }),
        }
    }

    fn check_pages(&self, start_page: u32, page_count: u32) -> Result<(), PlatformError> {
        let total = self.pin_counts.lock().unwrap().len() as u64;
        let end = u64::from(start_page) + u64::from(page_count);
        if end > total {
            return Err(PlatformError::OutOfRange {
                offset: u64::from(start_page) << PAGE_SHIFT,
                len: u64::from(page_count) << PAGE_SHIFT,
                size: total << PAGE_SHIFT,
            });
        }
        Ok(())
    }
}

impl PlatformBuffer for HeapBuffer {
    fn size(&self) -> u64 {
        self.data.lock().unwrap().len() as u64
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), PlatformError> {
        self.check_range(offset, buf.len() as u64)?;
        let data = self.data.lock().unwrap();
        let start = offset as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<(), PlatformError> {
        self.check_range(offset, buf.len() as u64)?;
        let mut data = self.data.lock().unwrap();
        let start = offset as usize;
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn pin_pages(&self, start_page: u32, page_count: u32) -> Result<(), PlatformError> {
        self.check_pages(start_page, page_count)?;
        let mut counts = self.pin_counts.lock().unwrap();
        for page in start_page..start_page + page_count {
            counts[page as usize] += 1;
        }
        Ok(())
    }

    fn unpin_pages(&self, start_page: u32, page_count: u32) -> Result<(), PlatformError> {
        self.check_pages(start_page, page_count)?;
        let mut counts = self.pin_counts.lock().unwrap();
        for page in start_page..start_page + page_count {
            if counts[page as usize] == 0 {
                return Err(PlatformError::NotPinned {
                    start_page,
                    page_count,
                });
            }
            counts[page as usize] -= 1;
        }
        Ok(())
    }

    fn bus_addresses(&self, start_page: u32, page_count: u32) -> Result<Vec<u64>, PlatformError> {
        self.check_pages(start_page, page_count)?;
        let counts = self.pin_counts.lock().unwrap();
        for page in start_page..start_page + page_count {
            if counts[page as usize] == 0 {
                return Err(PlatformError::NotPinned {
                    start_page,
                    page_count,
                });
            }
        }
        Ok((start_page..start_page + page_count)
            .map(|page| self.bus_base + (u64::from(page) << PAGE_SHIFT))
            .collect())
    }
}
