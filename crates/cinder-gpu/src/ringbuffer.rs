use std::sync::Arc;

use cinder_platform::BufferFactory;

use crate::buffer::Buffer;
use crate::{CachingType, Status};

pub const RINGBUFFER_SIZE: u64 = 32 * 1024;

/// Circular u32 command stream. The CPU advances `tail` as it writes
/// commands; the hardware consumes up to `tail` and reports `head`.
pub struct Ringbuffer {
    buffer: Arc<Buffer>,
    head: u32,
    tail: u32,
}

impl Ringbuffer {
    pub fn new(buffer_factory: &dyn BufferFactory) -> Self {
        Self {
            buffer: Buffer::new(buffer_factory.create(RINGBUFFER_SIZE), CachingType::Llc),
            head: 0,
            tail: 0,
        }
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    pub fn head(&self) -> u32 {
        self.head
    }

    pub fn tail(&self) -> u32 {
        self.tail
    }

    /// True when `bytes` more command bytes fit without tail catching head.
    /// One slot is kept free so a full ring is distinguishable from empty.
    pub fn has_space(&self, bytes: u32) -> bool {
        let size = RINGBUFFER_SIZE as u32;
        let available = (self.head.wrapping_sub(self.tail).wrapping_sub(4)) % size;
        available >= bytes
    }

    pub fn write32(&mut self, value: u32) -> Result<(), Status> {
        assert!(self.has_space(4), "ringbuffer overflow");
        self.buffer.platform().write_u32(u64::from(self.tail), value)?;
        self.tail = (self.tail + 4) % RINGBUFFER_SIZE as u32;
        Ok(())
    }

    pub fn update_head(&mut self, head: u32) {
        assert_eq!(head % 4, 0);
        assert!(u64::from(head) < RINGBUFFER_SIZE);
        self.head = head;
    }

    /// After a reset the hardware starts over from offset 0.
    pub fn reset(&mut self) {
        self.head = 0;
        self.tail = 0;
    }
}
