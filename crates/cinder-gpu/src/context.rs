use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use cinder_platform::{BufferFactory, PAGE_SHIFT, PAGE_SIZE};

use crate::address_space::{map_buffer_gpu, AddressSpace};
use crate::buffer::Buffer;
use crate::connection::Connection;
use crate::mapping::GpuMapping;
use crate::ringbuffer::{Ringbuffer, RINGBUFFER_SIZE};
use crate::{CachingType, EngineId, GpuAddr, Status};

pub const GLOBAL_CONTEXT_PAGES: u64 = 2;
pub const RENDER_CONTEXT_PAGES: u64 = 20;

// Context image layout (dword offsets in bytes). The hardware reads the
// ring setup from here when the context is scheduled.
const IMAGE_RING_HEAD_OFFSET: u64 = 0x10;
const IMAGE_RING_TAIL_OFFSET: u64 = 0x14;
const IMAGE_RING_BASE_OFFSET: u64 = 0x18;
const IMAGE_RING_SIZE_OFFSET: u64 = 0x1c;

/// CPU-visible page the hardware writes per-engine sequence numbers into.
pub struct HardwareStatusPage {
    buffer: Arc<Buffer>,
    mapping: Arc<GpuMapping>,
}

impl HardwareStatusPage {
    pub const SEQUENCE_NUMBER_OFFSET: u64 = 0x40;

    pub fn new(
        address_space: &Arc<dyn AddressSpace>,
        buffer_factory: &dyn BufferFactory,
    ) -> Result<Self, Status> {
        let buffer = Buffer::new(buffer_factory.create(PAGE_SIZE), CachingType::None);
        let mapping = map_buffer_gpu(address_space, &buffer, 0, PAGE_SIZE, PAGE_SHIFT)?;
        Ok(Self { buffer, mapping })
    }

    pub fn gpu_addr(&self) -> GpuAddr {
        self.mapping.gpu_addr()
    }

    /// GPU address the seqno store targets.
    pub fn sequence_number_gpu_addr(&self) -> GpuAddr {
        self.gpu_addr() + Self::SEQUENCE_NUMBER_OFFSET
    }

    pub fn read_sequence_number(&self) -> Result<u32, Status> {
        Ok(self.buffer.platform().read_u32(Self::SEQUENCE_NUMBER_OFFSET)?)
    }

    pub fn write_sequence_number(&self, seqno: u32) -> Result<(), Status> {
        Ok(self
            .buffer
            .platform()
            .write_u32(Self::SEQUENCE_NUMBER_OFFSET, seqno)?)
    }
}

struct PerEngineState {
    context_buffer: Arc<Buffer>,
    ringbuffer: Ringbuffer,
    context_mapping: Option<Arc<GpuMapping>>,
    ring_mapping: Option<Arc<GpuMapping>>,
}

static NEXT_CONTEXT_ID: AtomicU32 = AtomicU32::new(1);

/// Execution context: per-engine context image and ring, plus (for client
/// contexts) a back-reference to the owning connection so faults can be
/// attributed. The global context backs driver-internal submissions.
pub struct Context {
    id: u32,
    connection: Option<Weak<Connection>>,
    state: Mutex<HashMap<EngineId, PerEngineState>>,
}

impl Context {
    pub fn new_global() -> Arc<Self> {
        Self::new(None)
    }

    pub fn new_client(connection: Weak<Connection>) -> Arc<Self> {
        Self::new(Some(connection))
    }

    fn new(connection: Option<Weak<Connection>>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            connection,
            state: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn connection(&self) -> Option<Weak<Connection>> {
        self.connection.clone()
    }

    pub fn is_initialized(&self, engine_id: EngineId) -> bool {
        self.state.lock().unwrap().contains_key(&engine_id)
    }

    /// Creates the context image and ring for `engine_id`. Initializing an
    /// engine twice is a caller bug.
    pub fn init_engine(
        &self,
        engine_id: EngineId,
        context_pages: u64,
        buffer_factory: &dyn BufferFactory,
    ) {
        let mut state = self.state.lock().unwrap();
        assert!(
            !state.contains_key(&engine_id),
            "context {} already initialized for {engine_id:?}",
            self.id
        );
        state.insert(
            engine_id,
            PerEngineState {
                context_buffer: Buffer::new(
                    buffer_factory.create(context_pages * PAGE_SIZE),
                    CachingType::Llc,
                ),
                ringbuffer: Ringbuffer::new(buffer_factory),
                context_mapping: None,
                ring_mapping: None,
            },
        );
    }

    /// Maps the context image and ring and records the ring's location in
    /// the context image. Idempotent while already mapped.
    pub fn map_gpu(
        &self,
        engine_id: EngineId,
        address_space: &Arc<dyn AddressSpace>,
    ) -> Result<(), Status> {
        let mut state = self.state.lock().unwrap();
        let engine = state.get_mut(&engine_id).ok_or(Status::InvalidArgs)?;
        if engine.context_mapping.is_some() {
            return Ok(());
        }
        let context_mapping = map_buffer_gpu(
            address_space,
            &engine.context_buffer,
            0,
            engine.context_buffer.size(),
            PAGE_SHIFT,
        )?;
        let ring_mapping = match map_buffer_gpu(
            address_space,
            engine.ringbuffer.buffer(),
            0,
            RINGBUFFER_SIZE,
            PAGE_SHIFT,
        ) {
            Ok(mapping) => mapping,
            Err(err) => {
                drop(context_mapping);
                return Err(err);
            }
        };

        let image = engine.context_buffer.platform();
        image.write_u32(IMAGE_RING_HEAD_OFFSET, engine.ringbuffer.head())?;
        image.write_u32(IMAGE_RING_TAIL_OFFSET, engine.ringbuffer.tail())?;
        image.write_u32(IMAGE_RING_BASE_OFFSET, ring_mapping.gpu_addr() as u32)?;
        image.write_u32(IMAGE_RING_SIZE_OFFSET, RINGBUFFER_SIZE as u32)?;

        engine.context_mapping = Some(context_mapping);
        engine.ring_mapping = Some(ring_mapping);
        Ok(())
    }

    pub fn unmap_gpu(&self, engine_id: EngineId) {
        let mut state = self.state.lock().unwrap();
        if let Some(engine) = state.get_mut(&engine_id) {
            engine.context_mapping = None;
            engine.ring_mapping = None;
        }
    }

    pub fn context_gpu_addr(&self, engine_id: EngineId) -> Option<GpuAddr> {
        let state = self.state.lock().unwrap();
        state
            .get(&engine_id)?
            .context_mapping
            .as_ref()
            .map(|m| m.gpu_addr())
    }

    pub fn ring_gpu_addr(&self, engine_id: EngineId) -> Option<GpuAddr> {
        let state = self.state.lock().unwrap();
        state
            .get(&engine_id)?
            .ring_mapping
            .as_ref()
            .map(|m| m.gpu_addr())
    }

    /// Appends command dwords to the engine's ring.
    pub fn emit(&self, engine_id: EngineId, dwords: &[u32]) -> Result<(), Status> {
        let mut state = self.state.lock().unwrap();
        let engine = state.get_mut(&engine_id).ok_or(Status::InvalidArgs)?;
        if !engine.ringbuffer.has_space((dwords.len() * 4) as u32) {
            return Err(Status::Internal);
        }
        for dword in dwords {
            engine.ringbuffer.write32(*dword)?;
        }
        Ok(())
    }

    pub fn ring_tail(&self, engine_id: EngineId) -> u32 {
        self.state.lock().unwrap()[&engine_id].ringbuffer.tail()
    }

    pub fn update_ring_head(&self, engine_id: EngineId, head: u32) {
        if let Some(engine) = self.state.lock().unwrap().get_mut(&engine_id) {
            engine.ringbuffer.update_head(head);
        }
    }

    /// Publishes the current ring tail to the context image, where the
    /// hardware picks it up on the next execlist submission.
    pub fn publish_ring_tail(&self, engine_id: EngineId) -> Result<(), Status> {
        let state = self.state.lock().unwrap();
        let engine = state.get(&engine_id).ok_or(Status::InvalidArgs)?;
        Ok(engine
            .context_buffer
            .platform()
            .write_u32(IMAGE_RING_TAIL_OFFSET, engine.ringbuffer.tail())?)
    }

    /// After an engine reset the ring contents are abandoned.
    pub fn reset_ring(&self, engine_id: EngineId) -> Result<(), Status> {
        let mut state = self.state.lock().unwrap();
        let engine = state.get_mut(&engine_id).ok_or(Status::InvalidArgs)?;
        engine.ringbuffer.reset();
        let image = engine.context_buffer.platform();
        image.write_u32(IMAGE_RING_HEAD_OFFSET, 0)?;
        image.write_u32(IMAGE_RING_TAIL_OFFSET, 0)?;
        Ok(())
    }

    #[cfg(test)]
    pub fn ring_buffer_word(&self, engine_id: EngineId, index: u32) -> Result<u32, Status> {
        let state = self.state.lock().unwrap();
        let engine = state.get(&engine_id).ok_or(Status::InvalidArgs)?;
        Ok(engine
            .ringbuffer
            .buffer()
            .platform()
            .read_u32(u64::from(index) * 4)?)
    }

    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        for engine in state.values_mut() {
            engine.context_mapping = None;
            engine.ring_mapping = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gtt::Gtt;
    use cinder_platform::{HeapBuffer, HeapBufferFactory, RamMmio, RegisterIo};
    use pretty_assertions::assert_eq;

    fn new_gtt() -> Arc<dyn AddressSpace> {
        let reg_io = Arc::new(RegisterIo::new(Box::new(RamMmio::new(0x100000))));
        Gtt::new(reg_io, Arc::new(HeapBuffer::new(PAGE_SIZE))).unwrap()
    }

    #[test]
    fn ids_are_unique() {
        let a = Context::new_global();
        let b = Context::new_global();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn init_and_map_publishes_ring_location() {
        let aspace = new_gtt();
        let context = Context::new_global();
        context.init_engine(EngineId::Render, RENDER_CONTEXT_PAGES, &HeapBufferFactory);
        assert!(context.is_initialized(EngineId::Render));
        context.map_gpu(EngineId::Render, &aspace).unwrap();

        let ring_addr = context.ring_gpu_addr(EngineId::Render).unwrap();
        assert!(context.context_gpu_addr(EngineId::Render).is_some());

        // The image records the ring base and size for the hardware.
        let state = context.state.lock().unwrap();
        let image = state[&EngineId::Render].context_buffer.platform();
        assert_eq!(image.read_u32(IMAGE_RING_BASE_OFFSET).unwrap(), ring_addr as u32);
        assert_eq!(
            image.read_u32(IMAGE_RING_SIZE_OFFSET).unwrap(),
            RINGBUFFER_SIZE as u32
        );
    }

    #[test]
    #[should_panic(expected = "already initialized")]
    fn double_init_panics() {
        let context = Context::new_global();
        context.init_engine(EngineId::Render, RENDER_CONTEXT_PAGES, &HeapBufferFactory);
        context.init_engine(EngineId::Render, RENDER_CONTEXT_PAGES, &HeapBufferFactory);
    }

    #[test]
    fn emit_then_publish_updates_image_tail() {
        let aspace = new_gtt();
        let context = Context::new_global();
        context.init_engine(EngineId::Render, GLOBAL_CONTEXT_PAGES, &HeapBufferFactory);
        context.map_gpu(EngineId::Render, &aspace).unwrap();

        context.emit(EngineId::Render, &[1, 2, 3]).unwrap();
        assert_eq!(context.ring_tail(EngineId::Render), 12);
        context.publish_ring_tail(EngineId::Render).unwrap();

        let state = context.state.lock().unwrap();
        let image = state[&EngineId::Render].context_buffer.platform();
        assert_eq!(image.read_u32(IMAGE_RING_TAIL_OFFSET).unwrap(), 12);
    }

    #[test]
    fn status_page_round_trip() {
        let aspace = new_gtt();
        let page = HardwareStatusPage::new(&aspace, &HeapBufferFactory).unwrap();
        page.write_sequence_number(0x1234).unwrap();
        assert_eq!(page.read_sequence_number().unwrap(), 0x1234);
        assert_eq!(
            page.sequence_number_gpu_addr(),
            page.gpu_addr() + HardwareStatusPage::SEQUENCE_NUMBER_OFFSET
        );
    }
}
