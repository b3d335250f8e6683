use std::time::{Duration, Instant};

/// Hang-check bookkeeping: tracks the newest submitted and completed
/// sequence numbers and how long the engine has been stalled on the gap.
pub struct GpuProgress {
    last_submitted: u32,
    last_completed: u32,
    stalled_since: Option<Instant>,
}

impl GpuProgress {
    /// `baseline` is the sequence number the status page was initialized
    /// with; nothing older than it can ever retire.
    pub fn new(baseline: u32) -> Self {
        Self {
            last_submitted: baseline,
            last_completed: baseline,
            stalled_since: None,
        }
    }

    pub fn submitted(&mut self, seqno: u32) {
        assert!(seqno > self.last_submitted);
        self.last_submitted = seqno;
        if self.stalled_since.is_none() {
            self.stalled_since = Some(Instant::now());
        }
    }

    pub fn completed(&mut self, seqno: u32) {
        if seqno <= self.last_completed {
            return;
        }
        self.last_completed = seqno;
        // Forward progress restarts the stall clock.
        self.stalled_since = if seqno < self.last_submitted {
            Some(Instant::now())
        } else {
            None
        };
    }

    pub fn last_submitted(&self) -> u32 {
        self.last_submitted
    }

    pub fn last_completed(&self) -> u32 {
        self.last_completed
    }

    pub fn work_outstanding(&self) -> bool {
        self.last_completed < self.last_submitted
    }

    /// Instant at which the engine counts as hung, while work is outstanding.
    pub fn hang_deadline(&self, timeout: Duration) -> Option<Instant> {
        self.stalled_since.map(|start| start + timeout)
    }

    pub fn hung(&self, timeout: Duration) -> bool {
        match self.stalled_since {
            Some(start) => start.elapsed() >= timeout,
            None => false,
        }
    }

    /// After a reset the retired work is gone; account everything
    /// submitted as completed so the stall clock stops.
    pub fn reset(&mut self) {
        self.last_completed = self.last_submitted;
        self.stalled_since = None;
    }
}
