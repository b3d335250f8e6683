use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cinder_platform::PAGE_SHIFT;
use tracing::debug;

use crate::address_space::{
    get_shared_gpu_mapping, release_buffer, AddressSpace, MappingCache,
};
use crate::buffer::Buffer;
use crate::command_buffer::CommandBuffer;
use crate::context::{Context, RENDER_CONTEXT_PAGES};
use crate::device::Device;
use crate::mapping::GpuMapping;
use crate::ppgtt::PerProcessGtt;
use crate::{EngineId, Status};

const MAPPING_CACHE_CAPACITY: usize = 16;

/// Per-client connection: owns the client's address space and is the unit
/// of fault attribution. Once a fault or hang kills a connection, all of
/// its operations fail with `ContextKilled`; the client's recourse is to
/// reopen.
pub struct Connection {
    device: Arc<Device>,
    client_id: u64,
    address_space: Arc<dyn AddressSpace>,
    mapping_cache: MappingCache,
    killed: AtomicBool,
}

impl Connection {
    pub(crate) fn create(device: Arc<Device>, client_id: u64) -> Result<Arc<Self>, Status> {
        let ppgtt = PerProcessGtt::new(device.buffer_factory(), device.scratch_bus_addr())?;
        debug!(client_id, "connection opened");
        Ok(Arc::new(Self {
            device,
            client_id,
            address_space: ppgtt,
            mapping_cache: MappingCache::new(MAPPING_CACHE_CAPACITY),
            killed: AtomicBool::new(false),
        }))
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    pub fn address_space(&self) -> &Arc<dyn AddressSpace> {
        &self.address_space
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_killed(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }

    pub fn create_context(self: &Arc<Self>) -> Arc<Context> {
        let context = Context::new_client(Arc::downgrade(self));
        context.init_engine(
            EngineId::Render,
            RENDER_CONTEXT_PAGES,
            self.device.buffer_factory(),
        );
        context
    }

    /// Teardown runs on the device thread so it serializes behind any
    /// submissions already queued for the context.
    pub fn destroy_context(&self, context: Arc<Context>) {
        self.device.destroy_context(context);
    }

    /// Hands the command buffer to the device thread and blocks for the
    /// submission outcome.
    pub fn submit_command_buffer(&self, command_buffer: CommandBuffer) -> Result<u32, Status> {
        if self.is_killed() {
            return Err(Status::ContextKilled);
        }
        self.device.submit_command_buffer(command_buffer)
    }

    /// Maps `buffer[offset, offset + length)` into this connection's
    /// address space, reusing a compatible mapping when one exists. The
    /// mapping is also cached so a short-lived caller reference does not
    /// tear the range down.
    pub fn map_buffer(
        &self,
        buffer: &Arc<Buffer>,
        offset: u64,
        length: u64,
    ) -> Result<Arc<GpuMapping>, Status> {
        let mapping =
            get_shared_gpu_mapping(&self.address_space, buffer, offset, length, PAGE_SHIFT)?;
        self.mapping_cache.add(Arc::clone(&mapping));
        Ok(mapping)
    }

    /// Drops all of `buffer`'s mappings in this connection's address space.
    pub fn release_buffer(&self, buffer: &Buffer) {
        release_buffer(&self.address_space, &self.mapping_cache, buffer);
    }

    /// Blocks until the GPU is done with `buffer`. Fails fast when the
    /// connection has been killed; a reset releases in-flight counts, so
    /// the check happens on both sides of the wait.
    pub fn wait_rendering(&self, buffer: &Buffer) -> Result<(), Status> {
        if self.is_killed() {
            return Err(Status::ContextKilled);
        }
        buffer.wait_rendering();
        if self.is_killed() {
            return Err(Status::ContextKilled);
        }
        Ok(())
    }
}
