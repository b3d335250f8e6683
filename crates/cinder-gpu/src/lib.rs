//! GPU driver core: address-space and page-table management, command-buffer
//! execution, and the device thread that owns the hardware.
//!
//! Hardware is reached only through the capability traits in
//! `cinder-platform`, so the entire pipeline runs on the host against
//! in-memory fakes. The split mirrors the runtime layering: clients talk to a
//! [`connection::Connection`], connections queue requests on the
//! [`device::Device`], and the device thread alone programs registers.

#![forbid(unsafe_code)]

pub mod address_space;
pub mod allocator;
pub mod buffer;
pub mod command_buffer;
pub mod connection;
pub mod context;
pub mod device;
pub mod engine;
pub mod gtt;
pub mod mapping;
pub mod ppgtt;
pub mod progress;
pub mod registers;
pub mod ringbuffer;
pub mod sequencer;

pub use cinder_platform::{PAGE_SHIFT, PAGE_SIZE};

pub type GpuAddr = u64;

/// Sequence numbers start here so 0 on a fresh status page is never
/// mistaken for a completed submission.
pub const FIRST_SEQUENCE_NUMBER: u32 = 0x1000;

pub const HANGCHECK_TIMEOUT_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachingType {
    None,
    Llc,
    WriteThrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressSpaceId {
    Gtt,
    Ppgtt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineId {
    Render,
}

/// Driver-visible failure taxonomy. Recoverable faults (GPU hang, page
/// fault) are handled internally by reset and surface to the affected client
/// as `ContextKilled` on its next operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Status {
    #[error("out of gpu address space")]
    OutOfGpuMemory,
    #[error("memory access failed")]
    MemoryError,
    #[error("invalid arguments")]
    InvalidArgs,
    #[error("context killed")]
    ContextKilled,
    #[error("internal error")]
    Internal,
}

impl From<cinder_platform::PlatformError> for Status {
    fn from(_: cinder_platform::PlatformError) -> Self {
        Status::MemoryError
    }
}
