//! End-to-end scenarios over the in-memory platform fakes: the test plays
//! the hardware's part through the raw register bank and the fake
//! interrupt line.

use std::sync::Arc;
use std::time::{Duration, Instant};

use cinder_gpu::buffer::Buffer;
use cinder_gpu::command_buffer::{CommandBuffer, ExecResource};
use cinder_gpu::device::Device;
use cinder_gpu::registers::DisplayPlaneSurfaceAddress;
use cinder_gpu::{CachingType, Status, PAGE_SIZE};
use cinder_platform::{
    BufferFactory, FakeInterrupt, HeapBufferFactory, PlatformSemaphore, RamMmio, RegisterIo,
};

// Interrupt-delivery register block, as programmed by the driver.
const MASTER_INTERRUPT_CONTROL: u64 = 0x44200;
const RENDER_INTERRUPT_IDENTITY: u64 = 0x44308;
const MASTER_ENABLE: u32 = 1 << 31;
const MASTER_RENDER_PENDING: u32 = 1 << 0;
const IRQ_PAGE_FAULT: u32 = 1 << 7;
const ALL_ENGINE_FAULT: u64 = 0x4094;
const FAULT_VALID: u32 = 1 << 0;

fn new_device() -> (Arc<Device>, Arc<RegisterIo>, Arc<FakeInterrupt>) {
    let reg_io = Arc::new(RegisterIo::new(Box::new(RamMmio::new(0x400000))));
    let interrupt = Arc::new(FakeInterrupt::new());
    let device = Device::create(
        Arc::clone(&reg_io),
        interrupt.clone(),
        Arc::new(HeapBufferFactory),
        0x1916,
    )
    .unwrap();
    (device, reg_io, interrupt)
}

fn new_buffer(pages: u64) -> Arc<Buffer> {
    Buffer::new(HeapBufferFactory.create(pages * PAGE_SIZE), CachingType::Llc)
}

fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn fault_kills_connection_and_device_recovers() {
    let (device, reg_io, interrupt) = new_device();
    let connection = device.open(7).unwrap();
    let context = connection.create_context();

    let batch = new_buffer(1);
    let command_buffer = CommandBuffer::new(
        Arc::downgrade(&context),
        vec![ExecResource {
            buffer: Arc::clone(&batch),
            offset: 0,
            length: PAGE_SIZE,
            relocations: Vec::new(),
        }],
        0,
    );
    connection.submit_command_buffer(command_buffer).unwrap();

    // Latch a page fault and raise the interrupt line.
    reg_io.write32(ALL_ENGINE_FAULT, FAULT_VALID | (3 << 3));
    reg_io.write32(
        RENDER_INTERRUPT_IDENTITY,
        reg_io.read32(RENDER_INTERRUPT_IDENTITY) | IRQ_PAGE_FAULT,
    );
    reg_io.write32(MASTER_INTERRUPT_CONTROL, MASTER_ENABLE | MASTER_RENDER_PENDING);
    interrupt.signal();

    assert!(wait_until(|| connection.is_killed(), Duration::from_secs(2)));
    // The reset abandoned the batch; nothing is left in flight.
    assert!(wait_until(
        || batch.inflight_count() == 0,
        Duration::from_secs(2)
    ));
    assert_eq!(
        connection.wait_rendering(&batch).unwrap_err(),
        Status::ContextKilled
    );
    // Fault latch cleared by the recovery path.
    assert!(wait_until(
        || reg_io.read32(ALL_ENGINE_FAULT) & FAULT_VALID == 0,
        Duration::from_secs(2)
    ));

    // Other connections are unaffected.
    let connection2 = device.open(8).unwrap();
    assert!(!connection2.is_killed());

    device.shutdown();
}

#[test]
fn buffer_mapping_lifecycle_over_connection() {
    let (device, _reg_io, _interrupt) = new_device();
    let connection = device.open(1).unwrap();

    let buffer = new_buffer(4);
    let mapping = connection.map_buffer(&buffer, 0, 2 * PAGE_SIZE).unwrap();
    // Pages are pinned while mapped.
    assert!(buffer.platform().bus_addresses(0, 2).is_ok());

    // Compatible request reuses the mapping.
    let again = connection.map_buffer(&buffer, 0, 2 * PAGE_SIZE).unwrap();
    assert!(Arc::ptr_eq(&mapping, &again));
    drop(again);
    drop(mapping);
    // The connection's cache still holds it.
    assert!(buffer.platform().bus_addresses(0, 2).is_ok());

    connection.release_buffer(&buffer);
    assert!(buffer.platform().bus_addresses(0, 2).is_err());

    // Idle buffer: wait_rendering returns immediately.
    connection.wait_rendering(&buffer).unwrap();

    device.shutdown();
}

#[test]
fn flips_gate_on_wait_semaphores_and_signal_on_replacement() {
    let (device, reg_io, _interrupt) = new_device();

    let first = new_buffer(1);
    let second = new_buffer(1);
    let first_done = Arc::new(PlatformSemaphore::new());
    let second_done = Arc::new(PlatformSemaphore::new());
    let gate = Arc::new(PlatformSemaphore::new());

    device.flip(Arc::clone(&first), Vec::new(), vec![Arc::clone(&first_done)]);
    assert!(wait_until(
        || DisplayPlaneSurfaceAddress::read(&reg_io) != 0,
        Duration::from_secs(2)
    ));
    let first_addr = DisplayPlaneSurfaceAddress::read(&reg_io);
    assert!(!first_done.is_signaled());

    // Second flip waits on `gate` before reaching the display register.
    device.flip(
        Arc::clone(&second),
        vec![Arc::clone(&gate)],
        vec![Arc::clone(&second_done)],
    );
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(DisplayPlaneSurfaceAddress::read(&reg_io), first_addr);
    assert!(!first_done.is_signaled());

    gate.signal();
    // Once the gated flip lands, the first buffer is off screen and its
    // semaphore fires.
    assert!(wait_until(|| first_done.is_signaled(), Duration::from_secs(2)));
    assert_ne!(DisplayPlaneSurfaceAddress::read(&reg_io), first_addr);
    assert!(!second_done.is_signaled());

    device.shutdown();
}
