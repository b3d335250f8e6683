use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use cinder_platform::{
    BufferFactory, PlatformBuffer, PlatformEvent, PlatformInterrupt, PlatformSemaphore,
    RegisterIo, SemaphorePort, WaitSet, PAGE_SHIFT, PAGE_SIZE,
};
use tracing::{debug, error, warn};

use crate::address_space::{get_shared_gpu_mapping, AddressSpace};
use crate::buffer::Buffer;
use crate::command_buffer::CommandBuffer;
use crate::connection::Connection;
use crate::context::Context;
use crate::engine::{EngineOwner, RenderEngine};
use crate::gtt::Gtt;
use crate::mapping::GpuMapping;
use crate::progress::GpuProgress;
use crate::registers::{
    AllEngineFault, DisplayPlaneSurfaceAddress, EngineFault, FaultTlbReadData, ForceWake,
    GraphicsDeviceResetControl, InterruptBits, MasterInterruptControl, RenderInterrupt,
};
use crate::sequencer::Sequencer;
use crate::{GpuAddr, Status, HANGCHECK_TIMEOUT_MS};

const HANGCHECK_TIMEOUT: Duration = Duration::from_millis(HANGCHECK_TIMEOUT_MS);
const RESET_POLL_LIMIT: u32 = 100;

/// One-value reply slot for requests the caller blocks on.
struct Reply<T> {
    event: PlatformEvent,
    value: Mutex<Option<T>>,
}

impl<T> Reply<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            event: PlatformEvent::new(),
            value: Mutex::new(None),
        })
    }

    fn set(&self, value: T) {
        *self.value.lock().unwrap() = Some(value);
        self.event.signal();
    }

    fn wait(&self) -> Option<T> {
        while !self.event.wait(Duration::from_secs(5)) {
            warn!("still waiting for device thread reply");
        }
        self.value.lock().unwrap().take()
    }
}

enum DeviceRequest {
    SubmitCommandBuffer {
        command_buffer: Box<CommandBuffer>,
        reply: Arc<Reply<Result<u32, Status>>>,
    },
    DestroyContext {
        context: Arc<Context>,
    },
    Flip {
        buffer: Arc<Buffer>,
        wait_semaphores: Vec<Arc<PlatformSemaphore>>,
        signal_semaphores: Vec<Arc<PlatformSemaphore>>,
    },
    Interrupt {
        ack: Arc<PlatformEvent>,
    },
}

struct RequestQueue {
    requests: VecDeque<DeviceRequest>,
    shutdown: bool,
}

struct HwState {
    engine: RenderEngine,
    progress: GpuProgress,
    // Contexts whose destroy arrived while the engine still had their work
    // in flight; torn down once their last sequence retires.
    pending_destroy: Vec<Arc<Context>>,
}

struct FlipState {
    // Keeps the scanout buffer's GTT range alive until the next flip.
    scanout_mapping: Option<Arc<GpuMapping>>,
    signal_semaphores: Vec<Arc<PlatformSemaphore>>,
}

/// Hardware-access capabilities handed to the engine; grouped so the engine
/// does not need a reference back to the device.
struct EngineResources {
    register_io: Arc<RegisterIo>,
    sequencer: Sequencer,
    buffer_factory: Arc<dyn BufferFactory>,
    gtt: Arc<dyn AddressSpace>,
}

impl EngineOwner for EngineResources {
    fn register_io(&self) -> &Arc<RegisterIo> {
        &self.register_io
    }

    fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    fn buffer_factory(&self) -> &dyn BufferFactory {
        self.buffer_factory.as_ref()
    }

    fn global_address_space(&self) -> &Arc<dyn AddressSpace> {
        &self.gtt
    }
}

/// Point-in-time diagnostics captured when a fault or hang is handled.
#[derive(Debug, Clone)]
pub struct DumpState {
    pub device_id: u32,
    pub last_submitted_sequence_number: u32,
    pub last_completed_sequence_number: u32,
    pub inflight_count: usize,
    pub active_head_pointer: u64,
    pub fault: EngineFault,
    pub fault_gpu_addr: GpuAddr,
}

impl fmt::Display for DumpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- device dump (id {:#x}) ---", self.device_id)?;
        writeln!(
            f,
            "sequence numbers: submitted {:#x} completed {:#x} ({} in flight)",
            self.last_submitted_sequence_number,
            self.last_completed_sequence_number,
            self.inflight_count
        )?;
        writeln!(f, "active head pointer: {:#x}", self.active_head_pointer)?;
        if self.fault.valid {
            writeln!(
                f,
                "engine fault: engine {} src {} type {} gpu_addr {:#x}",
                self.fault.engine, self.fault.src, self.fault.fault_type, self.fault_gpu_addr
            )?;
        } else {
            writeln!(f, "no engine fault")?;
        }
        Ok(())
    }
}

/// The device: single owner of the hardware. All register access after
/// initialization happens on the device thread, which services the request
/// queue; the interrupt thread and the semaphore-port wait thread feed it.
pub struct Device {
    device_id: u32,
    resources: EngineResources,
    interrupt: Arc<dyn PlatformInterrupt>,
    // Holds an extra pin on the scratch page shared with client PPGTTs.
    _scratch: Arc<dyn PlatformBuffer>,
    scratch_bus_addr: u64,
    global_context: Arc<Context>,
    hw: Mutex<HwState>,
    queue: Mutex<RequestQueue>,
    queue_cond: Condvar,
    semaphore_port: Arc<SemaphorePort>,
    flip: Mutex<FlipState>,
    device_thread_id: Mutex<Option<ThreadId>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Device {
    pub fn create(
        register_io: Arc<RegisterIo>,
        interrupt: Arc<dyn PlatformInterrupt>,
        buffer_factory: Arc<dyn BufferFactory>,
        device_id: u32,
    ) -> Result<Arc<Self>, Status> {
        let scratch = buffer_factory.create(PAGE_SIZE);
        scratch.pin_pages(0, 1)?;
        let scratch_bus_addr = scratch.bus_addresses(0, 1)?[0];

        let gtt: Arc<dyn AddressSpace> = Gtt::new(Arc::clone(&register_io), Arc::clone(&scratch))?;
        let resources = EngineResources {
            register_io,
            sequencer: Sequencer::new(),
            buffer_factory,
            gtt,
        };

        ForceWake::request(&resources.register_io);

        let mut engine = RenderEngine::new(&resources)?;
        let global_context = Context::new_global();
        engine.init_context(&global_context, &resources);

        let baseline = engine.init_hardware(&resources)?;
        let mut progress = GpuProgress::new(baseline);
        if let Some(seqno) = engine.render_init(&global_context, &resources)? {
            progress.submitted(seqno);
        }

        RenderInterrupt::enable(
            &resources.register_io,
            InterruptBits::USER | InterruptBits::PAGE_FAULT | InterruptBits::CONTEXT_SWITCH,
        );
        MasterInterruptControl::enable(&resources.register_io, true);

        let device = Arc::new(Self {
            device_id,
            resources,
            interrupt,
            _scratch: scratch,
            scratch_bus_addr,
            global_context,
            hw: Mutex::new(HwState {
                engine,
                progress,
                pending_destroy: Vec::new(),
            }),
            queue: Mutex::new(RequestQueue {
                requests: VecDeque::new(),
                shutdown: false,
            }),
            queue_cond: Condvar::new(),
            semaphore_port: Arc::new(SemaphorePort::new()),
            flip: Mutex::new(FlipState {
                scanout_mapping: None,
                signal_semaphores: Vec::new(),
            }),
            device_thread_id: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
        });

        device.start_threads();
        Ok(device)
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub(crate) fn buffer_factory(&self) -> &dyn BufferFactory {
        self.resources.buffer_factory.as_ref()
    }

    pub(crate) fn scratch_bus_addr(&self) -> u64 {
        self.scratch_bus_addr
    }

    /// Opens a client connection with its own per-process address space.
    pub fn open(self: &Arc<Self>, client_id: u64) -> Result<Arc<Connection>, Status> {
        Connection::create(Arc::clone(self), client_id)
    }

    fn start_threads(self: &Arc<Self>) {
        let mut threads = self.threads.lock().unwrap();

        let device = Arc::clone(self);
        threads.push(thread::spawn(move || device.device_thread_loop()));

        let device = Arc::clone(self);
        threads.push(thread::spawn(move || device.interrupt_thread_loop()));

        let port = Arc::clone(&self.semaphore_port);
        threads.push(thread::spawn(move || while port.wait_one() {}));
    }

    /// Stops the threads and releases the hardware. Must be called from a
    /// client thread; further requests fail.
    pub fn shutdown(&self) {
        self.assert_not_device_thread();
        {
            let mut queue = self.queue.lock().unwrap();
            if queue.shutdown {
                return;
            }
            queue.shutdown = true;
            self.queue_cond.notify_all();
        }
        self.interrupt.close();
        self.semaphore_port.close();
        let handles: Vec<_> = self.threads.lock().unwrap().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                error!("device worker thread panicked");
            }
        }
        MasterInterruptControl::enable(&self.resources.register_io, false);
        ForceWake::release(&self.resources.register_io);
    }

    fn assert_not_device_thread(&self) {
        let id = self.device_thread_id.lock().unwrap();
        assert!(
            *id != Some(thread::current().id()),
            "blocking device operation called from the device thread"
        );
    }

    // --- request queue ---

    fn enqueue(&self, request: DeviceRequest, front: bool) -> bool {
        let mut queue = self.queue.lock().unwrap();
        if queue.shutdown {
            return false;
        }
        if front {
            queue.requests.push_front(request);
        } else {
            queue.requests.push_back(request);
        }
        self.queue_cond.notify_all();
        true
    }

    /// Queues a submission and blocks for the device thread's answer: the
    /// assigned sequence number, or the failure status.
    pub(crate) fn submit_command_buffer(
        &self,
        command_buffer: CommandBuffer,
    ) -> Result<u32, Status> {
        self.assert_not_device_thread();
        let reply = Reply::new();
        let queued = self.enqueue(
            DeviceRequest::SubmitCommandBuffer {
                command_buffer: Box::new(command_buffer),
                reply: Arc::clone(&reply),
            },
            false,
        );
        if !queued {
            return Err(Status::Internal);
        }
        reply.wait().unwrap_or(Err(Status::Internal))
    }

    /// Context teardown is deferred to the device thread so it serializes
    /// with submissions already queued for the context.
    pub(crate) fn destroy_context(&self, context: Arc<Context>) {
        self.enqueue(DeviceRequest::DestroyContext { context }, false);
    }

    /// Queues a page flip to `buffer`, gated on `wait_semaphores`. The
    /// previous flip's signal semaphores fire when this one reaches the
    /// display register.
    pub fn flip(
        &self,
        buffer: Arc<Buffer>,
        wait_semaphores: Vec<Arc<PlatformSemaphore>>,
        signal_semaphores: Vec<Arc<PlatformSemaphore>>,
    ) {
        self.enqueue(
            DeviceRequest::Flip {
                buffer,
                wait_semaphores,
                signal_semaphores,
            },
            false,
        );
    }

    pub fn dump_state(&self) -> DumpState {
        let hw = self.hw.lock().unwrap();
        self.snapshot(&hw)
    }

    fn snapshot(&self, hw: &HwState) -> DumpState {
        let reg_io = &self.resources.register_io;
        DumpState {
            device_id: self.device_id,
            last_submitted_sequence_number: hw.progress.last_submitted(),
            last_completed_sequence_number: hw.progress.last_completed(),
            inflight_count: hw.engine.inflight_count(),
            active_head_pointer: hw.engine.active_head_pointer(&self.resources),
            fault: AllEngineFault::read(reg_io),
            fault_gpu_addr: FaultTlbReadData::read(reg_io),
        }
    }

    pub fn dump_to_string(&self) -> String {
        self.dump_state().to_string()
    }

    // --- device thread ---

    fn device_thread_loop(self: Arc<Self>) {
        *self.device_thread_id.lock().unwrap() = Some(thread::current().id());
        debug!("device thread started");

        enum Action {
            Request(DeviceRequest),
            HangCheck,
            Shutdown,
        }

        loop {
            let deadline = {
                let hw = self.hw.lock().unwrap();
                hw.progress.hang_deadline(HANGCHECK_TIMEOUT)
            };
            let action = {
                let mut queue = self.queue.lock().unwrap();
                loop {
                    if queue.shutdown {
                        break Action::Shutdown;
                    }
                    if let Some(request) = queue.requests.pop_front() {
                        break Action::Request(request);
                    }
                    match deadline {
                        Some(deadline) => {
                            let now = Instant::now();
                            if now >= deadline {
                                break Action::HangCheck;
                            }
                            let (guard, _) = self
                                .queue_cond
                                .wait_timeout(queue, deadline - now)
                                .unwrap();
                            queue = guard;
                        }
                        None => queue = self.queue_cond.wait(queue).unwrap(),
                    }
                }
            };
            // Handlers run with the queue lock released.
            match action {
                Action::Shutdown => break,
                Action::HangCheck => self.hang_check(),
                Action::Request(request) => self.process_request(request),
            }
        }

        // Unblock anyone still parked on a reply.
        let leftovers: Vec<_> = {
            let mut queue = self.queue.lock().unwrap();
            queue.requests.drain(..).collect()
        };
        for request in leftovers {
            match request {
                DeviceRequest::SubmitCommandBuffer { reply, .. } => {
                    reply.set(Err(Status::Internal));
                }
                DeviceRequest::Interrupt { ack } => ack.signal(),
                DeviceRequest::DestroyContext { .. } | DeviceRequest::Flip { .. } => {}
            }
        }
        debug!("device thread exited");
    }

    fn process_request(self: &Arc<Self>, request: DeviceRequest) {
        match request {
            DeviceRequest::SubmitCommandBuffer {
                command_buffer,
                reply,
            } => {
                reply.set(self.process_command_buffer(*command_buffer));
            }
            DeviceRequest::DestroyContext { context } => {
                let mut hw = self.hw.lock().unwrap();
                if hw.engine.has_inflight_for(context.id()) {
                    // Unmapping now would pull the ring out from under the
                    // hardware; park the destroy until the work retires.
                    debug!(context_id = context.id(), "context destroy deferred");
                    hw.pending_destroy.push(context);
                } else {
                    drop(hw);
                    debug!(context_id = context.id(), "destroying context");
                    context.shutdown();
                }
            }
            DeviceRequest::Flip {
                buffer,
                wait_semaphores,
                signal_semaphores,
            } => self.process_flip_request(buffer, wait_semaphores, signal_semaphores),
            DeviceRequest::Interrupt { ack } => {
                self.process_interrupts();
                ack.signal();
            }
        }
    }

    fn process_command_buffer(&self, mut command_buffer: CommandBuffer) -> Result<u32, Status> {
        let context = command_buffer.context().ok_or(Status::ContextKilled)?;
        let connection = context
            .connection()
            .ok_or(Status::InvalidArgs)?
            .upgrade()
            .ok_or(Status::ContextKilled)?;
        if connection.is_killed() {
            return Err(Status::ContextKilled);
        }
        command_buffer.prepare_for_execution(connection.address_space())?;

        let mut hw = self.hw.lock().unwrap();
        let seqno = hw
            .engine
            .submit_command_buffer(command_buffer, &self.resources)?;
        hw.progress.submitted(seqno);
        Ok(seqno)
    }

    // --- interrupts, completion, recovery ---

    fn process_interrupts(&self) {
        let reg_io = &self.resources.register_io;
        let master = MasterInterruptControl::read(reg_io);
        MasterInterruptControl::enable(reg_io, false);

        if master & MasterInterruptControl::RENDER_PENDING != 0 {
            let identity = RenderInterrupt::identity(reg_io);
            RenderInterrupt::acknowledge(reg_io, identity);

            let fault = AllEngineFault::read(reg_io);
            if fault.valid || identity.contains(InterruptBits::PAGE_FAULT) {
                self.handle_fault();
            } else if identity.contains(InterruptBits::USER)
                || identity.contains(InterruptBits::CONTEXT_SWITCH)
            {
                self.process_completed_command_buffers();
            }
        }

        MasterInterruptControl::enable(reg_io, true);
    }

    fn process_completed_command_buffers(&self) {
        let mut hw = self.hw.lock().unwrap();
        let hw_seqno = match hw.engine.status_page().read_sequence_number() {
            Ok(seqno) => seqno,
            Err(err) => {
                warn!(%err, "status page read failed");
                return;
            }
        };
        hw.engine.process_completed_command_buffers(hw_seqno);
        hw.progress.completed(hw_seqno);
        Self::flush_pending_destroys(&mut hw);
    }

    /// Tears down contexts whose deferred destroy is no longer blocked by
    /// in-flight work.
    fn flush_pending_destroys(hw: &mut HwState) {
        let mut i = 0;
        while i < hw.pending_destroy.len() {
            if hw.engine.has_inflight_for(hw.pending_destroy[i].id()) {
                i += 1;
            } else {
                let context = hw.pending_destroy.swap_remove(i);
                debug!(context_id = context.id(), "destroying context");
                context.shutdown();
            }
        }
    }

    fn handle_fault(&self) {
        let mut hw = self.hw.lock().unwrap();
        let dump = self.snapshot(&hw);
        error!("engine fault\n{dump}");
        self.reset_engine(&mut hw);
    }

    fn hang_check(&self) {
        let mut hw = self.hw.lock().unwrap();
        if !hw.progress.work_outstanding() {
            return;
        }
        let hw_seqno = match hw.engine.status_page().read_sequence_number() {
            Ok(seqno) => seqno,
            Err(err) => {
                warn!(%err, "status page read failed");
                return;
            }
        };
        if hw_seqno > hw.progress.last_completed() {
            hw.engine.process_completed_command_buffers(hw_seqno);
            hw.progress.completed(hw_seqno);
            Self::flush_pending_destroys(&mut hw);
            return;
        }
        if hw.progress.hung(HANGCHECK_TIMEOUT) {
            let dump = self.snapshot(&hw);
            error!(
                "no progress past sequence number {:#x}, resetting\n{dump}",
                hw.progress.last_completed()
            );
            self.reset_engine(&mut hw);
        }
    }

    /// Abandons in-flight work, kills the affected client connections,
    /// resets the render engine and reinitializes it.
    fn reset_engine(&self, hw: &mut HwState) {
        let reg_io = &self.resources.register_io;

        let contexts = hw.engine.drain_inflight();
        for context in &contexts {
            if let Some(connection) = context.connection().and_then(|weak| weak.upgrade()) {
                warn!(client_id = connection.client_id(), "killing connection");
                connection.mark_killed();
            }
        }
        hw.progress.reset();
        // The drain emptied the in-flight queue, so every parked destroy
        // can complete.
        Self::flush_pending_destroys(hw);

        AllEngineFault::clear(reg_io);
        GraphicsDeviceResetControl::request_render_reset(reg_io);
        let mut polls = 0;
        while !GraphicsDeviceResetControl::render_reset_complete(reg_io) {
            polls += 1;
            if polls >= RESET_POLL_LIMIT {
                warn!("reset handshake did not complete, proceeding");
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }

        match hw.engine.init_hardware(&self.resources) {
            Ok(baseline) => hw.progress = GpuProgress::new(baseline),
            Err(err) => error!(%err, "hardware reinit failed"),
        }
        match hw.engine.render_init(&self.global_context, &self.resources) {
            Ok(Some(seqno)) => hw.progress.submitted(seqno),
            Ok(None) => {}
            Err(err) => error!(%err, "render init after reset failed"),
        }
    }

    // --- interrupt thread ---

    fn interrupt_thread_loop(self: Arc<Self>) {
        debug!("interrupt thread started");
        while self.interrupt.wait() {
            let ack = Arc::new(PlatformEvent::new());
            // Interrupts jump the queue so completion latency stays flat
            // under a backlog of submissions.
            if !self.enqueue(
                DeviceRequest::Interrupt {
                    ack: Arc::clone(&ack),
                },
                true,
            ) {
                break;
            }
            while !ack.wait(Duration::from_secs(5)) {
                warn!("interrupt servicing is slow");
            }
            self.interrupt.complete();
        }
        debug!("interrupt thread exited");
    }

    // --- display flip ---

    fn process_flip_request(
        self: &Arc<Self>,
        buffer: Arc<Buffer>,
        wait_semaphores: Vec<Arc<PlatformSemaphore>>,
        signal_semaphores: Vec<Arc<PlatformSemaphore>>,
    ) {
        if wait_semaphores.is_empty() {
            self.present_flip(&buffer, signal_semaphores);
            return;
        }
        // Re-queue once the wait semaphores fire; the port's wait thread
        // runs the callback. Weak so the port never keeps the device alive.
        let device: Weak<Device> = Arc::downgrade(self);
        self.semaphore_port.add_wait_set(WaitSet::new(
            wait_semaphores,
            Box::new(move || {
                if let Some(device) = device.upgrade() {
                    device.enqueue(
                        DeviceRequest::Flip {
                            buffer,
                            wait_semaphores: Vec::new(),
                            signal_semaphores,
                        },
                        false,
                    );
                }
            }),
        ));
    }

    fn present_flip(&self, buffer: &Arc<Buffer>, signal_semaphores: Vec<Arc<PlatformSemaphore>>) {
        let mapping = match get_shared_gpu_mapping(
            &self.resources.gtt,
            buffer,
            0,
            buffer.size(),
            PAGE_SHIFT,
        ) {
            Ok(mapping) => mapping,
            Err(err) => {
                warn!(buffer_id = buffer.id(), %err, "flip mapping failed");
                return;
            }
        };
        DisplayPlaneSurfaceAddress::write(&self.resources.register_io, mapping.gpu_addr());
        debug!(buffer_id = buffer.id(), gpu_addr = mapping.gpu_addr(), "flipped");

        let mut flip = self.flip.lock().unwrap();
        // The previous scanout buffer is off screen now; release its
        // semaphores and keep the new mapping until the next flip.
        for semaphore in flip.signal_semaphores.drain(..) {
            semaphore.signal();
        }
        flip.scanout_mapping = Some(mapping);
        flip.signal_semaphores = signal_semaphores;
    }
}
