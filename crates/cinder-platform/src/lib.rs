//! Platform capabilities consumed by the GPU driver core.
//!
//! The core decides *what* to do with hardware (which page-table entries to
//! write, which registers to program, when to wait for an interrupt); these
//! traits are the seams through which it does so. Concrete in-memory
//! implementations (`HeapBuffer`, `RamMmio`, `FakeInterrupt`) back the whole
//! stack in host tests.

#![forbid(unsafe_code)]

pub mod buffer;
pub mod event;
pub mod interrupt;
pub mod mmio;
pub mod semaphore;

pub use buffer::{BufferFactory, HeapBuffer, HeapBufferFactory, PlatformBuffer};
pub use event::PlatformEvent;
pub use interrupt::{FakeInterrupt, PlatformInterrupt};
pub use mmio::{Mmio, RamMmio, RegisterIo};
pub use semaphore::{PlatformSemaphore, SemaphorePort, WaitSet};

pub const PAGE_SIZE: u64 = 4096;
pub const PAGE_SHIFT: u32 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    #[error("access out of range: offset {offset:#x} len {len:#x} size {size:#x}")]
    OutOfRange { offset: u64, len: u64, size: u64 },
    #[error("pages [{start_page}, {start_page}+{page_count}) are not pinned")]
    NotPinned { start_page: u32, page_count: u32 },
}

/// Round `value` up to the next multiple of `alignment` (a power of two).
pub fn round_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}
