use std::sync::Mutex;

/// Register-file access, 32-bit granularity.
///
/// `write32` takes `&mut self`; concurrent access is serialized by
/// [`RegisterIo`], which is the only thing that should hold an `Mmio`.
pub trait Mmio: Send {
    fn size(&self) -> u64;
    fn read32(&mut self, offset: u64) -> u32;
    fn write32(&mut self, offset: u64, val: u32);
}

/// Shared handle to the register bank. Serializes all accesses and provides
/// the 64-bit and posting-read helpers the programming protocol needs.
///
/// A posting read forces previously posted writes to reach the device before
/// the caller proceeds; on the fake RAM-backed bank it is just a read.
pub struct RegisterIo {
    mmio: Mutex<Box<dyn Mmio>>,
}

impl RegisterIo {
    pub fn new(mmio: Box<dyn Mmio>) -> Self {
        Self {
            mmio: Mutex::new(mmio),
        }
    }

    pub fn size(&self) -> u64 {
        self.mmio.lock().unwrap().size()
    }

    pub fn read32(&self, offset: u64) -> u32 {
        self.mmio.lock().unwrap().read32(offset)
    }

    pub fn write32(&self, offset: u64, val: u32) {
        self.mmio.lock().unwrap().write32(offset, val);
    }

    pub fn posting_read32(&self, offset: u64) -> u32 {
        self.read32(offset)
    }

    /// 64-bit access as two 32-bit halves, low half first.
    pub fn read64(&self, offset: u64) -> u64 {
        let mut mmio = self.mmio.lock().unwrap();
        let lo = mmio.read32(offset);
        let hi = mmio.read32(offset + 4);
        u64::from(lo) | (u64::from(hi) << 32)
    }

    pub fn write64(&self, offset: u64, val: u64) {
        let mut mmio = self.mmio.lock().unwrap();
        mmio.write32(offset, val as u32);
        mmio.write32(offset + 4, (val >> 32) as u32);
    }
}

/// RAM-backed register bank for host tests. Reads return whatever was last
/// written; register side effects are the test's job to emulate.
pub struct RamMmio {
    data: Vec<u8>,
}

impl RamMmio {
    pub fn new(size: u64) -> Self {
        assert_eq!(size % 4, 0);
        Self {
            data: vec![0u8; size as usize],
        }
    }
}

impl Mmio for RamMmio {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read32(&mut self, offset: u64) -> u32 {
        let start = offset as usize;
        let bytes: [u8; 4] = self.data[start..start + 4].try_into().unwrap();
        u32::from_le_bytes(bytes)
    }

    fn write32(&mut self, offset: u64, val: u32) {
        let start = offset as usize;
        self.data[start..start + 4].copy_from_slice(&val.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_round_trip() {
        let reg_io = RegisterIo::new(Box::new(RamMmio::new(0x100)));
        reg_io.write32(0x10, 0xdead_beef);
        assert_eq!(reg_io.read32(0x10), 0xdead_beef);
        assert_eq!(reg_io.posting_read32(0x10), 0xdead_beef);
        assert_eq!(reg_io.read32(0x14), 0);
    }

    #[test]
    fn split_64bit_halves() {
        let reg_io = RegisterIo::new(Box::new(RamMmio::new(0x100)));
        reg_io.write64(0x20, 0x0123_4567_89ab_cdef);
        assert_eq!(reg_io.read32(0x20), 0x89ab_cdef);
        assert_eq!(reg_io.read32(0x24), 0x0123_4567);
        assert_eq!(reg_io.read64(0x20), 0x0123_4567_89ab_cdef);
    }
}
