use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cinder_platform::{BufferFactory, RegisterIo, PAGE_SHIFT, PAGE_SIZE};
use tracing::{debug, warn};

use crate::address_space::{map_buffer_gpu, AddressSpace};
use crate::buffer::Buffer;
use crate::command_buffer::CommandBuffer;
use crate::context::{
    Context, HardwareStatusPage, GLOBAL_CONTEXT_PAGES, RENDER_CONTEXT_PAGES,
};
use crate::mapping::GpuMapping;
use crate::registers::{
    ActiveHeadPointer, ExeclistSubmitPort, GraphicsMode, HardwareStatusMask,
    HardwareStatusPageAddress, RENDER_ENGINE_MMIO_BASE,
};
use crate::sequencer::Sequencer;
use crate::{CachingType, EngineId, Status};

// Command stream instructions.
const MI_NOOP: u32 = 0;
const MI_BATCH_BUFFER_END: u32 = 0x0a << 23;
const MI_USER_INTERRUPT: u32 = 0x02 << 23;
const MI_STORE_DWORD_IMM: u32 = (0x20 << 23) | 2;
const MI_BATCH_BUFFER_START: u32 = (0x31 << 23) | 1;
const MI_BATCH_PPGTT: u32 = 1 << 8;

/// Capabilities the engine borrows from its owning device.
pub trait EngineOwner: Send + Sync {
    fn register_io(&self) -> &Arc<RegisterIo>;
    fn sequencer(&self) -> &Sequencer;
    fn buffer_factory(&self) -> &dyn BufferFactory;
    /// The GGTT; context images and rings always live here.
    fn global_address_space(&self) -> &Arc<dyn AddressSpace>;
}

/// What a retired sequence number was executing.
enum MappedBatch {
    CommandBuffer(CommandBuffer),
    RenderInit {
        buffer: Arc<Buffer>,
        _mapping: Arc<GpuMapping>,
    },
}

impl MappedBatch {
    fn context(&self) -> Option<Arc<Context>> {
        match self {
            MappedBatch::CommandBuffer(cmd_buf) => cmd_buf.context(),
            MappedBatch::RenderInit { .. } => None,
        }
    }

    fn decrement_inflight(&self) {
        match self {
            MappedBatch::CommandBuffer(cmd_buf) => {
                for resource in cmd_buf.resources() {
                    resource.buffer.decrement_inflight();
                }
            }
            MappedBatch::RenderInit { buffer, .. } => buffer.decrement_inflight(),
        }
    }
}

struct InflightSequence {
    sequence_number: u32,
    ring_tail: u32,
    batch: MappedBatch,
}

/// Render engine command streamer. Owns the execlist submission state and
/// the FIFO of in-flight sequences; everything here runs on the device
/// thread.
pub struct RenderEngine {
    mmio_base: u64,
    status_page: HardwareStatusPage,
    inflight: VecDeque<InflightSequence>,
    current_context_id: Option<u32>,
    render_init_done: bool,
}

impl RenderEngine {
    pub fn new(owner: &dyn EngineOwner) -> Result<Self, Status> {
        let status_page =
            HardwareStatusPage::new(owner.global_address_space(), owner.buffer_factory())?;
        Ok(Self {
            mmio_base: RENDER_ENGINE_MMIO_BASE,
            status_page,
            inflight: VecDeque::new(),
            current_context_id: None,
            render_init_done: false,
        })
    }

    pub fn id(&self) -> EngineId {
        EngineId::Render
    }

    pub fn status_page(&self) -> &HardwareStatusPage {
        &self.status_page
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    /// Sequence number of the oldest unretired submission, if any.
    pub fn oldest_inflight_sequence_number(&self) -> Option<u32> {
        self.inflight.front().map(|s| s.sequence_number)
    }

    /// True while any unretired submission executes from `context_id`'s ring.
    pub fn has_inflight_for(&self, context_id: u32) -> bool {
        self.inflight
            .iter()
            .any(|seq| seq.batch.context().map_or(false, |c| c.id() == context_id))
    }

    /// Creates this engine's context image and ring for `context`. The
    /// global context gets the small image.
    pub fn init_context(&self, context: &Context, owner: &dyn EngineOwner) {
        let pages = if context.connection().is_none() {
            GLOBAL_CONTEXT_PAGES
        } else {
            RENDER_CONTEXT_PAGES
        };
        context.init_engine(EngineId::Render, pages, owner.buffer_factory());
    }

    /// Programs the status page and execlist mode and seeds the status page
    /// with a fresh baseline sequence number, which is returned. Also run
    /// after reset.
    pub fn init_hardware(&mut self, owner: &dyn EngineOwner) -> Result<u32, Status> {
        let reg_io = owner.register_io();
        HardwareStatusPageAddress::write(reg_io, self.mmio_base, self.status_page.gpu_addr());
        GraphicsMode::enable_execlist(reg_io, self.mmio_base);
        HardwareStatusMask::write(reg_io, self.mmio_base, 0);

        let baseline = owner.sequencer().next_sequence_number();
        self.status_page.write_sequence_number(baseline)?;
        self.current_context_id = None;
        Ok(baseline)
    }

    /// One-time hardware-initialization batch, issued through the global
    /// context after `init_hardware`. Idempotent; returns the batch's
    /// sequence number when one was submitted.
    pub fn render_init(
        &mut self,
        global_context: &Arc<Context>,
        owner: &dyn EngineOwner,
    ) -> Result<Option<u32>, Status> {
        if self.render_init_done {
            return Ok(None);
        }
        let buffer = Buffer::new(owner.buffer_factory().create(PAGE_SIZE), CachingType::Llc);
        for i in 0..4 {
            buffer.platform().write_u32(i * 4, MI_NOOP)?;
        }
        buffer.platform().write_u32(16, MI_BATCH_BUFFER_END)?;
        let mapping = map_buffer_gpu(
            owner.global_address_space(),
            &buffer,
            0,
            PAGE_SIZE,
            PAGE_SHIFT,
        )?;

        let seqno = owner.sequencer().next_sequence_number();
        buffer.increment_inflight();
        let batch_gpu_addr = mapping.gpu_addr();
        self.emit_batch(global_context, batch_gpu_addr, false, seqno, owner)?;
        self.inflight.push_back(InflightSequence {
            sequence_number: seqno,
            ring_tail: global_context.ring_tail(EngineId::Render),
            batch: MappedBatch::RenderInit {
                buffer,
                _mapping: mapping,
            },
        });
        self.render_init_done = true;
        debug!(seqno, "render init batch submitted");
        Ok(Some(seqno))
    }

    /// Submits a prepared command buffer and returns its sequence number.
    pub fn submit_command_buffer(
        &mut self,
        mut cmd_buf: CommandBuffer,
        owner: &dyn EngineOwner,
    ) -> Result<u32, Status> {
        assert!(cmd_buf.is_prepared());
        let context = cmd_buf.context().ok_or(Status::ContextKilled)?;
        let batch_gpu_addr = cmd_buf.batch_gpu_addr().ok_or(Status::Internal)?;

        // Client batches execute out of the per-process address space.
        let ppgtt = context.connection().is_some();

        let seqno = owner.sequencer().next_sequence_number();
        cmd_buf.set_sequence_number(seqno);
        for resource in cmd_buf.resources() {
            resource.buffer.increment_inflight();
        }

        if let Err(err) = self.emit_batch(&context, batch_gpu_addr, ppgtt, seqno, owner) {
            for resource in cmd_buf.resources() {
                resource.buffer.decrement_inflight();
            }
            return Err(err);
        }

        self.inflight.push_back(InflightSequence {
            sequence_number: seqno,
            ring_tail: context.ring_tail(EngineId::Render),
            batch: MappedBatch::CommandBuffer(cmd_buf),
        });
        debug!(seqno, context_id = context.id(), "command buffer submitted");
        Ok(seqno)
    }

    /// Writes the batch-start, seqno store and user interrupt into the
    /// context's ring and hands the context to the execlist port.
    fn emit_batch(
        &mut self,
        context: &Arc<Context>,
        batch_gpu_addr: u64,
        ppgtt: bool,
        seqno: u32,
        owner: &dyn EngineOwner,
    ) -> Result<(), Status> {
        context.map_gpu(EngineId::Render, owner.global_address_space())?;

        let mut start = MI_BATCH_BUFFER_START;
        if ppgtt {
            start |= MI_BATCH_PPGTT;
        }
        let seqno_addr = self.status_page.sequence_number_gpu_addr();
        context.emit(
            EngineId::Render,
            &[
                start,
                batch_gpu_addr as u32,
                (batch_gpu_addr >> 32) as u32,
                MI_STORE_DWORD_IMM,
                seqno_addr as u32,
                (seqno_addr >> 32) as u32,
                seqno,
                MI_USER_INTERRUPT,
                MI_NOOP,
                MI_NOOP,
            ],
        )?;
        context.publish_ring_tail(EngineId::Render)?;

        if self.current_context_id != Some(context.id()) {
            let context_gpu_addr = context
                .context_gpu_addr(EngineId::Render)
                .ok_or(Status::Internal)?;
            let descriptor =
                ExeclistSubmitPort::context_descriptor(context_gpu_addr, context.id(), ppgtt);
            ExeclistSubmitPort::submit(owner.register_io(), self.mmio_base, 0, descriptor);
            self.current_context_id = Some(context.id());
        }
        Ok(())
    }

    /// Retires every in-flight sequence up to and including `hw_seqno`, in
    /// FIFO order, releasing buffer in-flight counts.
    pub fn process_completed_command_buffers(&mut self, hw_seqno: u32) {
        while let Some(front) = self.inflight.front() {
            if front.sequence_number > hw_seqno {
                break;
            }
            let Some(seq) = self.inflight.pop_front() else {
                break;
            };
            if let Some(context) = seq.batch.context() {
                context.update_ring_head(EngineId::Render, seq.ring_tail);
            }
            seq.batch.decrement_inflight();
            debug!(seqno = seq.sequence_number, "sequence retired");
        }
    }

    /// Abandons all in-flight work without waiting for the hardware:
    /// counters are released, rings reset, and the contexts that had work
    /// queued are returned so the device can kill their connections.
    pub fn drain_inflight(&mut self) -> Vec<Arc<Context>> {
        let mut contexts: Vec<Arc<Context>> = Vec::new();
        while let Some(seq) = self.inflight.pop_front() {
            if let Some(context) = seq.batch.context() {
                if !contexts.iter().any(|c| c.id() == context.id()) {
                    contexts.push(context);
                }
            }
            seq.batch.decrement_inflight();
        }
        for context in &contexts {
            if let Err(err) = context.reset_ring(EngineId::Render) {
                warn!(context_id = context.id(), %err, "ring reset failed");
            }
        }
        self.current_context_id = None;
        self.render_init_done = false;
        contexts
    }

    /// Polls completions until the in-flight queue drains or `timeout`
    /// elapses.
    pub fn wait_idle(&mut self, timeout: Duration) -> Result<(), Status> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.inflight.is_empty() {
                return Ok(());
            }
            let hw_seqno = self.status_page.read_sequence_number()?;
            self.process_completed_command_buffers(hw_seqno);
            if self.inflight.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(
                    inflight = self.inflight.len(),
                    "wait_idle timed out"
                );
                return Err(Status::Internal);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn active_head_pointer(&self, owner: &dyn EngineOwner) -> u64 {
        ActiveHeadPointer::read(owner.register_io(), self.mmio_base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_buffer::{ExecResource, Relocation};
    use crate::gtt::Gtt;
    use cinder_platform::{HeapBuffer, HeapBufferFactory, RamMmio};
    use pretty_assertions::assert_eq;

    struct TestOwner {
        reg_io: Arc<RegisterIo>,
        sequencer: Sequencer,
        factory: HeapBufferFactory,
        gtt: Arc<dyn AddressSpace>,
    }

    impl TestOwner {
        fn new() -> Self {
            let reg_io = Arc::new(RegisterIo::new(Box::new(RamMmio::new(0x100000))));
            let gtt: Arc<dyn AddressSpace> =
                Gtt::new(Arc::clone(&reg_io), Arc::new(HeapBuffer::new(PAGE_SIZE))).unwrap();
            Self {
                reg_io,
                sequencer: Sequencer::new(),
                factory: HeapBufferFactory,
                gtt,
            }
        }
    }

    impl EngineOwner for TestOwner {
        fn register_io(&self) -> &Arc<RegisterIo> {
            &self.reg_io
        }
        fn sequencer(&self) -> &Sequencer {
            &self.sequencer
        }
        fn buffer_factory(&self) -> &dyn BufferFactory {
            &self.factory
        }
        fn global_address_space(&self) -> &Arc<dyn AddressSpace> {
            &self.gtt
        }
    }

    fn prepared_command_buffer(
        owner: &TestOwner,
        context: &Arc<Context>,
    ) -> (CommandBuffer, Arc<Buffer>) {
        let batch = Buffer::new(owner.factory.create(PAGE_SIZE), CachingType::Llc);
        let mut cmd_buf = CommandBuffer::new(
            Arc::downgrade(context),
            vec![ExecResource {
                buffer: Arc::clone(&batch),
                offset: 0,
                length: PAGE_SIZE,
                relocations: Vec::<Relocation>::new(),
            }],
            0,
        );
        cmd_buf.prepare_for_execution(&owner.gtt).unwrap();
        (cmd_buf, batch)
    }

    fn init_engine(owner: &TestOwner) -> (RenderEngine, Arc<Context>) {
        let mut engine = RenderEngine::new(owner).unwrap();
        let context = Context::new_global();
        engine.init_context(&context, owner);
        engine.init_hardware(owner).unwrap();
        (engine, context)
    }

    #[test]
    fn init_hardware_seeds_baseline() {
        let owner = TestOwner::new();
        let (engine, _context) = init_engine(&owner);
        assert_eq!(
            engine.status_page().read_sequence_number().unwrap(),
            crate::FIRST_SEQUENCE_NUMBER
        );
    }

    #[test]
    fn submit_emits_ring_commands_and_descriptor() {
        let owner = TestOwner::new();
        let (mut engine, context) = init_engine(&owner);
        let (cmd_buf, batch) = prepared_command_buffer(&owner, &context);
        let batch_addr = cmd_buf.batch_gpu_addr().unwrap();

        let seqno = engine.submit_command_buffer(cmd_buf, &owner).unwrap();
        assert_eq!(batch.inflight_count(), 1);
        assert_eq!(engine.inflight_count(), 1);

        // Ring holds batch start, seqno store, user interrupt.
        let ring = context.ring_gpu_addr(EngineId::Render);
        assert!(ring.is_some());
        assert_eq!(context.ring_tail(EngineId::Render), 40);
        let state = engine.status_page().sequence_number_gpu_addr();
        let expect = [
            MI_BATCH_BUFFER_START,
            batch_addr as u32,
            (batch_addr >> 32) as u32,
            MI_STORE_DWORD_IMM,
            state as u32,
            (state >> 32) as u32,
            seqno,
            MI_USER_INTERRUPT,
            MI_NOOP,
            MI_NOOP,
        ];
        // Read the ring contents back through the context's ring buffer.
        let ring_words = ring_contents(&context, expect.len());
        assert_eq!(ring_words, expect);

        // The execlist port saw the context descriptor (last write is the
        // low half of element 0).
        let port = owner.reg_io.read32(RENDER_ENGINE_MMIO_BASE + 0x230);
        let desc = ExeclistSubmitPort::context_descriptor(
            context.context_gpu_addr(EngineId::Render).unwrap(),
            context.id(),
            false,
        );
        assert_eq!(port, desc as u32);
    }

    fn ring_contents(context: &Arc<Context>, dwords: usize) -> Vec<u32> {
        // Reach through the context state for the ring's backing buffer.
        let aspace_words: Vec<u32> = (0..dwords)
            .map(|i| {
                context
                    .ring_buffer_word(EngineId::Render, i as u32)
                    .unwrap()
            })
            .collect();
        aspace_words
    }

    #[test]
    fn retirement_is_fifo_and_releases_counters() {
        let owner = TestOwner::new();
        let (mut engine, context) = init_engine(&owner);

        let (a, buf_a) = prepared_command_buffer(&owner, &context);
        let (b, buf_b) = prepared_command_buffer(&owner, &context);
        let (c, buf_c) = prepared_command_buffer(&owner, &context);
        let seq_a = engine.submit_command_buffer(a, &owner).unwrap();
        let seq_b = engine.submit_command_buffer(b, &owner).unwrap();
        let seq_c = engine.submit_command_buffer(c, &owner).unwrap();
        assert!(seq_a < seq_b && seq_b < seq_c);

        engine.process_completed_command_buffers(seq_b);
        assert_eq!(buf_a.inflight_count(), 0);
        assert_eq!(buf_b.inflight_count(), 0);
        assert_eq!(buf_c.inflight_count(), 1);
        assert_eq!(engine.oldest_inflight_sequence_number(), Some(seq_c));

        engine.process_completed_command_buffers(seq_c);
        assert_eq!(buf_c.inflight_count(), 0);
        assert_eq!(engine.inflight_count(), 0);
    }

    #[test]
    fn second_submission_same_context_skips_descriptor() {
        let owner = TestOwner::new();
        let (mut engine, context) = init_engine(&owner);

        let (a, _) = prepared_command_buffer(&owner, &context);
        engine.submit_command_buffer(a, &owner).unwrap();
        // Scribble over the port; a second submit on the same context must
        // not rewrite it.
        owner.reg_io.write32(RENDER_ENGINE_MMIO_BASE + 0x230, 0x5555_5555);
        let (b, _) = prepared_command_buffer(&owner, &context);
        engine.submit_command_buffer(b, &owner).unwrap();
        assert_eq!(
            owner.reg_io.read32(RENDER_ENGINE_MMIO_BASE + 0x230),
            0x5555_5555
        );
    }

    #[test]
    fn drain_releases_counters_and_reports_contexts() {
        let owner = TestOwner::new();
        let (mut engine, context) = init_engine(&owner);
        let (a, buf_a) = prepared_command_buffer(&owner, &context);
        let (b, buf_b) = prepared_command_buffer(&owner, &context);
        engine.submit_command_buffer(a, &owner).unwrap();
        engine.submit_command_buffer(b, &owner).unwrap();

        let contexts = engine.drain_inflight();
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].id(), context.id());
        assert_eq!(buf_a.inflight_count(), 0);
        assert_eq!(buf_b.inflight_count(), 0);
        assert_eq!(context.ring_tail(EngineId::Render), 0);
    }

    #[test]
    fn render_init_is_idempotent() {
        let owner = TestOwner::new();
        let (mut engine, context) = init_engine(&owner);
        engine.render_init(&context, &owner).unwrap();
        assert_eq!(engine.inflight_count(), 1);
        engine.render_init(&context, &owner).unwrap();
        assert_eq!(engine.inflight_count(), 1);

        // Simulate completion.
        let hw = engine.status_page();
        let seqno = engine.oldest_inflight_sequence_number().unwrap();
        hw.write_sequence_number(seqno).unwrap();
        engine.wait_idle(Duration::from_secs(1)).unwrap();
        assert_eq!(engine.inflight_count(), 0);
    }
}
