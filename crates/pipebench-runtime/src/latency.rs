/// Buffered microseconds are folded into the float total once they pass this
/// mark (100 s).
pub const FLUSH_THRESHOLD_US: u64 = 100_000_000;

/// Running per-iteration latency sum.
///
/// Samples are summed as integer microseconds and converted to a millisecond
/// float only when the buffer passes [`FLUSH_THRESHOLD_US`] or on read.
#[derive(Clone, Debug, Default)]
pub struct LatencyAccumulator {
    buffer_us: u64,
    total_ms: f64,
    samples: u64,
}

impl LatencyAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, latency_us: u64) {
        self.buffer_us = self.buffer_us.saturating_add(latency_us);
        self.samples += 1;
        if self.buffer_us > FLUSH_THRESHOLD_US {
            self.flush();
        }
    }

    pub fn flush(&mut self) {
        self.total_ms += self.buffer_us as f64 / 1000.0;
        self.buffer_us = 0;
    }

    /// Flush and return the total in milliseconds.
    pub fn total_ms(&mut self) -> f64 {
        self.flush();
        self.total_ms
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn buffered_us(&self) -> u64 {
        self.buffer_us
    }
}
