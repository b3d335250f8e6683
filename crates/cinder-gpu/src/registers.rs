//! Register programming protocol, expressed as one unit struct per register
//! with the offset and bit layout as associated consts. All access goes
//! through a shared [`RegisterIo`]; writes that must land before the caller
//! proceeds are followed by a posting read.

use bitflags::bitflags;
use cinder_platform::RegisterIo;

use crate::GpuAddr;

/// Per-engine register blocks are offsets from the engine's mmio base.
pub const RENDER_ENGINE_MMIO_BASE: u64 = 0x2000;

pub struct HardwareStatusPageAddress;

impl HardwareStatusPageAddress {
    const OFFSET: u64 = 0x80;

    pub fn write(reg_io: &RegisterIo, mmio_base: u64, addr: GpuAddr) {
        assert_eq!(addr >> 32, 0, "status page must map below 4G");
        reg_io.write32(mmio_base + Self::OFFSET, addr as u32);
        reg_io.posting_read32(mmio_base + Self::OFFSET);
    }
}

/// Masked register: the high 16 bits select which low bits the write
/// affects.
pub struct GraphicsMode;

impl GraphicsMode {
    const OFFSET: u64 = 0x29c;
    pub const EXECLIST_ENABLE: u32 = 1 << 15;

    pub fn enable_execlist(reg_io: &RegisterIo, mmio_base: u64) {
        reg_io.write32(
            mmio_base + Self::OFFSET,
            (Self::EXECLIST_ENABLE << 16) | Self::EXECLIST_ENABLE,
        );
        reg_io.posting_read32(mmio_base + Self::OFFSET);
    }
}

pub struct HardwareStatusMask;

impl HardwareStatusMask {
    const OFFSET: u64 = 0x98;

    pub fn write(reg_io: &RegisterIo, mmio_base: u64, mask: u32) {
        reg_io.write32(mmio_base + Self::OFFSET, mask);
    }
}

pub struct ActiveHeadPointer;

impl ActiveHeadPointer {
    const OFFSET: u64 = 0x74;
    const OFFSET_UPPER: u64 = 0x5c;

    pub fn read(reg_io: &RegisterIo, mmio_base: u64) -> u64 {
        let lower = reg_io.read32(mmio_base + Self::OFFSET);
        let upper = reg_io.read32(mmio_base + Self::OFFSET_UPPER);
        u64::from(lower) | (u64::from(upper) << 32)
    }
}

pub struct ExeclistSubmitPort;

impl ExeclistSubmitPort {
    const OFFSET: u64 = 0x230;

    const VALID: u64 = 1 << 0;
    const LEGACY_MODE_32BIT: u64 = 1 << 3;
    const PPGTT_ENABLE: u64 = 1 << 8;

    pub fn context_descriptor(gpu_addr: GpuAddr, context_id: u32, ppgtt: bool) -> u64 {
        let mut desc = gpu_addr | Self::VALID | Self::LEGACY_MODE_32BIT;
        if ppgtt {
            desc |= Self::PPGTT_ENABLE;
        }
        desc | (u64::from(context_id) << 32)
    }

    /// Element 1 first, element 0 last; the port latches on the final write.
    pub fn submit(reg_io: &RegisterIo, mmio_base: u64, descriptor1: u64, descriptor0: u64) {
        let port = mmio_base + Self::OFFSET;
        reg_io.write32(port, (descriptor1 >> 32) as u32);
        reg_io.write32(port, descriptor1 as u32);
        reg_io.write32(port, (descriptor0 >> 32) as u32);
        reg_io.write32(port, descriptor0 as u32);
        reg_io.posting_read32(mmio_base + ExeclistStatus::OFFSET);
    }
}

pub struct ExeclistStatus;

impl ExeclistStatus {
    const OFFSET: u64 = 0x234;

    pub fn read(reg_io: &RegisterIo, mmio_base: u64) -> u32 {
        reg_io.read32(mmio_base + Self::OFFSET)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineFault {
    pub valid: bool,
    pub engine: u8,
    pub src: u8,
    pub fault_type: u8,
}

pub struct AllEngineFault;

impl AllEngineFault {
    const OFFSET: u64 = 0x4094;

    const VALID: u32 = 1 << 0;
    const TYPE_SHIFT: u32 = 1;
    const TYPE_MASK: u32 = 0x3;
    const SRC_SHIFT: u32 = 3;
    const SRC_MASK: u32 = 0xff;
    const ENGINE_SHIFT: u32 = 12;
    const ENGINE_MASK: u32 = 0x3;

    pub fn read(reg_io: &RegisterIo) -> EngineFault {
        let val = reg_io.read32(Self::OFFSET);
        EngineFault {
            valid: val & Self::VALID != 0,
            engine: ((val >> Self::ENGINE_SHIFT) & Self::ENGINE_MASK) as u8,
            src: ((val >> Self::SRC_SHIFT) & Self::SRC_MASK) as u8,
            fault_type: ((val >> Self::TYPE_SHIFT) & Self::TYPE_MASK) as u8,
        }
    }

    pub fn clear(reg_io: &RegisterIo) {
        reg_io.write32(Self::OFFSET, 0);
        reg_io.posting_read32(Self::OFFSET);
    }

    #[cfg(test)]
    pub fn inject(reg_io: &RegisterIo, engine: u8, src: u8, fault_type: u8) {
        let val = Self::VALID
            | (u32::from(fault_type) << Self::TYPE_SHIFT)
            | (u32::from(src) << Self::SRC_SHIFT)
            | (u32::from(engine) << Self::ENGINE_SHIFT);
        reg_io.write32(Self::OFFSET, val);
    }
}

pub struct FaultTlbReadData;

impl FaultTlbReadData {
    const OFFSET_LOWER: u64 = 0x4b10;
    const OFFSET_UPPER: u64 = 0x4b14;

    /// GPU address of the faulting access, page aligned.
    pub fn read(reg_io: &RegisterIo) -> GpuAddr {
        let lower = reg_io.read32(Self::OFFSET_LOWER);
        let upper = reg_io.read32(Self::OFFSET_UPPER);
        (u64::from(lower) | (u64::from(upper) << 32)) & !0xfff
    }
}

pub struct ForceWake;

impl ForceWake {
    const OFFSET_REQUEST: u64 = 0xa188;
    const OFFSET_STATUS: u64 = 0x130044;
    const DOMAIN_BIT: u32 = 1 << 0;

    pub fn request(reg_io: &RegisterIo) {
        reg_io.write32(Self::OFFSET_REQUEST, (Self::DOMAIN_BIT << 16) | Self::DOMAIN_BIT);
        reg_io.posting_read32(Self::OFFSET_STATUS);
    }

    pub fn release(reg_io: &RegisterIo) {
        reg_io.write32(Self::OFFSET_REQUEST, Self::DOMAIN_BIT << 16);
    }

    pub fn is_active(reg_io: &RegisterIo) -> bool {
        reg_io.read32(Self::OFFSET_STATUS) & Self::DOMAIN_BIT != 0
    }
}

pub struct MasterInterruptControl;

impl MasterInterruptControl {
    const OFFSET: u64 = 0x44200;
    const ENABLE: u32 = 1 << 31;
    pub const RENDER_PENDING: u32 = 1 << 0;

    pub fn enable(reg_io: &RegisterIo, enable: bool) {
        reg_io.write32(Self::OFFSET, if enable { Self::ENABLE } else { 0 });
    }

    pub fn read(reg_io: &RegisterIo) -> u32 {
        reg_io.read32(Self::OFFSET)
    }
}

bitflags! {
    /// Render-engine interrupt sources, shared by the mask, identity and
    /// enable registers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InterruptBits: u32 {
        const USER = 1 << 0;
        const PAGE_FAULT = 1 << 7;
        const CONTEXT_SWITCH = 1 << 8;
    }
}

pub struct RenderInterrupt;

impl RenderInterrupt {
    const OFFSET_MASK: u64 = 0x44304;
    const OFFSET_IDENTITY: u64 = 0x44308;
    const OFFSET_ENABLE: u64 = 0x4430c;

    pub fn enable(reg_io: &RegisterIo, bits: InterruptBits) {
        reg_io.write32(Self::OFFSET_MASK, !bits.bits());
        reg_io.write32(Self::OFFSET_ENABLE, bits.bits());
    }

    pub fn identity(reg_io: &RegisterIo) -> InterruptBits {
        InterruptBits::from_bits_truncate(reg_io.read32(Self::OFFSET_IDENTITY))
    }

    /// Clears the handled source bits from the latched identity value.
    pub fn acknowledge(reg_io: &RegisterIo, bits: InterruptBits) {
        let latched = reg_io.read32(Self::OFFSET_IDENTITY);
        reg_io.write32(Self::OFFSET_IDENTITY, latched & !bits.bits());
        reg_io.posting_read32(Self::OFFSET_IDENTITY);
    }

    #[cfg(test)]
    pub fn inject(reg_io: &RegisterIo, bits: InterruptBits) {
        reg_io.write32(
            Self::OFFSET_IDENTITY,
            reg_io.read32(Self::OFFSET_IDENTITY) | bits.bits(),
        );
        reg_io.write32(
            MasterInterruptControl::OFFSET,
            MasterInterruptControl::read(reg_io) | MasterInterruptControl::RENDER_PENDING,
        );
    }
}

pub struct GraphicsDeviceResetControl;

impl GraphicsDeviceResetControl {
    const OFFSET: u64 = 0x941c;
    pub const RENDER_RESET: u32 = 1 << 1;

    pub fn request_render_reset(reg_io: &RegisterIo) {
        reg_io.write32(Self::OFFSET, Self::RENDER_RESET);
        reg_io.posting_read32(Self::OFFSET);
    }

    /// The bit self-clears when the reset completes.
    pub fn render_reset_complete(reg_io: &RegisterIo) -> bool {
        reg_io.read32(Self::OFFSET) & Self::RENDER_RESET == 0
    }
}

pub struct DisplayPlaneSurfaceAddress;

impl DisplayPlaneSurfaceAddress {
    const OFFSET: u64 = 0x7019c;

    pub fn write(reg_io: &RegisterIo, addr: GpuAddr) {
        assert_eq!(addr >> 32, 0, "display surface must map below 4G");
        reg_io.write32(Self::OFFSET, addr as u32);
        reg_io.posting_read32(Self::OFFSET);
    }

    pub fn read(reg_io: &RegisterIo) -> u32 {
        reg_io.read32(Self::OFFSET)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_platform::RamMmio;
    use pretty_assertions::assert_eq;

    fn new_reg_io() -> RegisterIo {
        RegisterIo::new(Box::new(RamMmio::new(0x200000)))
    }

    #[test]
    fn context_descriptor_layout() {
        let desc = ExeclistSubmitPort::context_descriptor(0x10000, 7, true);
        assert_eq!(desc & 0xfff, 0b1_0000_1001);
        assert_eq!(desc & !0xfff & 0xffff_ffff, 0x10000);
        assert_eq!(desc >> 32, 7);

        let desc = ExeclistSubmitPort::context_descriptor(0x2000, 1, false);
        assert_eq!(desc & (1 << 8), 0);
    }

    #[test]
    fn graphics_mode_masked_write() {
        let reg_io = new_reg_io();
        GraphicsMode::enable_execlist(&reg_io, RENDER_ENGINE_MMIO_BASE);
        let val = reg_io.read32(RENDER_ENGINE_MMIO_BASE + 0x29c);
        assert_eq!(val & 0xffff, GraphicsMode::EXECLIST_ENABLE);
        assert_eq!(val >> 16, GraphicsMode::EXECLIST_ENABLE);
    }

    #[test]
    fn fault_fields_round_trip() {
        let reg_io = new_reg_io();
        assert!(!AllEngineFault::read(&reg_io).valid);
        AllEngineFault::inject(&reg_io, 2, 0x5a, 1);
        let fault = AllEngineFault::read(&reg_io);
        assert_eq!(
            fault,
            EngineFault {
                valid: true,
                engine: 2,
                src: 0x5a,
                fault_type: 1,
            }
        );
        AllEngineFault::clear(&reg_io);
        assert!(!AllEngineFault::read(&reg_io).valid);
    }

    #[test]
    fn active_head_pointer_is_split_64bit() {
        let reg_io = new_reg_io();
        reg_io.write32(RENDER_ENGINE_MMIO_BASE + 0x74, 0x1234);
        reg_io.write32(RENDER_ENGINE_MMIO_BASE + 0x5c, 0x1);
        assert_eq!(
            ActiveHeadPointer::read(&reg_io, RENDER_ENGINE_MMIO_BASE),
            0x1_0000_1234
        );
    }

    #[test]
    fn forcewake_handshake() {
        let reg_io = new_reg_io();
        ForceWake::request(&reg_io);
        assert_eq!(reg_io.read32(0xa188), (1 << 16) | 1);
        // The hardware acknowledges through the status register.
        reg_io.write32(0x130044, 1);
        assert!(ForceWake::is_active(&reg_io));
        ForceWake::release(&reg_io);
        assert_eq!(reg_io.read32(0xa188), 1 << 16);
    }

    #[test]
    fn interrupt_enable_sets_mask_and_enable() {
        let reg_io = new_reg_io();
        let bits = InterruptBits::USER | InterruptBits::PAGE_FAULT | InterruptBits::CONTEXT_SWITCH;
        RenderInterrupt::enable(&reg_io, bits);
        assert_eq!(reg_io.read32(0x4430c), bits.bits());
        assert_eq!(reg_io.read32(0x44304), !bits.bits());
    }
}
