use serde::Serialize;

/// Outcome of one benchmark run.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BenchReport {
    /// Mean end-to-end latency of one iteration on one device.
    pub avg_latency_ms: f64,
    /// Items (iterations x batch) per second over all devices.
    pub throughput: f64,
    pub shape_info: String,
    pub batch: usize,
    pub devices: Vec<u32>,
    pub iterations: u64,
    pub wall_clock_ms: f64,
    pub copy_elision: bool,
}

impl BenchReport {
    pub fn avg_latency_us(&self) -> f64 {
        self.avg_latency_ms * 1000.0
    }
}

/// Mean per-iteration latency in milliseconds given the summed per-device
/// totals (also milliseconds).
pub fn average_latency_ms(total_latency_ms: f64, devices: usize, iterations: u64) -> f64 {
    let runs = devices as f64 * iterations as f64;
    if runs == 0.0 {
        return 0.0;
    }
    total_latency_ms / runs
}

/// Items per second. A zero-length wall clock yields 0.
pub fn throughput(devices: usize, iterations: u64, batch: usize, wall_clock_ms: f64) -> f64 {
    if wall_clock_ms <= 0.0 {
        return 0.0;
    }
    devices as f64 * iterations as f64 * batch as f64 * 1000.0 / wall_clock_ms
}
