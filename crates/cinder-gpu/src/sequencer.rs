use std::sync::atomic::{AtomicU32, Ordering};

use crate::FIRST_SEQUENCE_NUMBER;

/// Hands out strictly increasing sequence numbers, device-wide. Wrap of the
/// 32-bit space would break every `<=` retirement comparison, so it panics;
/// at realistic submission rates it is decades away.
pub struct Sequencer {
    next: AtomicU32,
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequencer {
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(FIRST_SEQUENCE_NUMBER),
        }
    }

    pub fn next_sequence_number(&self) -> u32 {
        let seqno = self.next.fetch_add(1, Ordering::Relaxed);
        assert_ne!(seqno, u32::MAX, "sequence number space exhausted");
        seqno
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_nonzero_base_and_increases() {
        let sequencer = Sequencer::new();
        let a = sequencer.next_sequence_number();
        let b = sequencer.next_sequence_number();
        let c = sequencer.next_sequence_number();
        assert_eq!(a, FIRST_SEQUENCE_NUMBER);
        assert!(a < b && b < c);
    }
}
