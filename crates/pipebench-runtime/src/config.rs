use std::collections::HashSet;

use pipebench_core::ModelArtifact;

use crate::{BenchError, BenchResult};

pub const DEFAULT_ITERATIONS: u64 = 100;
pub const DEFAULT_QUEUE_DEPTH: usize = 3;

#[derive(Clone, Debug)]
pub struct BenchConfig {
    pub artifact: ModelArtifact,
    /// Iterations per device.
    pub iterations: u64,
    /// Skip host/device transfers and time the launch only.
    pub copy_elision: bool,
    /// Devices to run on; empty means every enumerated device.
    pub device_ids: Vec<u32>,
    pub queue_depth: usize,
    /// Batch size to run; defaults to the last stage's batch.
    pub batch: Option<usize>,
}

impl BenchConfig {
    pub fn new(artifact: ModelArtifact) -> Self {
        Self {
            artifact,
            iterations: DEFAULT_ITERATIONS,
            copy_elision: false,
            device_ids: Vec::new(),
            queue_depth: DEFAULT_QUEUE_DEPTH,
            batch: None,
        }
    }

    pub fn with_iterations(mut self, iterations: u64) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_copy_elision(mut self, copy_elision: bool) -> Self {
        self.copy_elision = copy_elision;
        self
    }

    pub fn with_devices(mut self, device_ids: impl Into<Vec<u32>>) -> Self {
        self.device_ids = device_ids.into();
        self
    }

    pub fn with_queue_depth(mut self, queue_depth: usize) -> Self {
        self.queue_depth = queue_depth;
        self
    }

    pub fn with_batch(mut self, batch: Option<usize>) -> Self {
        self.batch = batch;
        self
    }

    pub fn validate(&self) -> BenchResult<()> {
        if self.iterations == 0 {
            return Err(BenchError::InvalidConfig(
                "iterations must be at least 1".to_string(),
            ));
        }
        if self.queue_depth == 0 {
            return Err(BenchError::InvalidConfig(
                "queue depth must be at least 1".to_string(),
            ));
        }
        if self.batch == Some(0) {
            return Err(BenchError::InvalidConfig(
                "batch must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Device ids this run uses given `available` enumerated devices.
    pub fn resolve_devices(&self, available: usize) -> BenchResult<Vec<u32>> {
        if available == 0 {
            return Err(BenchError::NoDevices);
        }
        if self.device_ids.is_empty() {
            let count = u32::try_from(available).map_err(|_| {
                BenchError::InvalidConfig(format!("{available} devices cannot be addressed"))
            })?;
            return Ok((0..count).collect());
        }

        let mut seen = HashSet::with_capacity(self.device_ids.len());
        for &device_id in &self.device_ids {
            if device_id as usize >= available {
                return Err(BenchError::UnknownDevice {
                    device_id,
                    available,
                });
            }
            if !seen.insert(device_id) {
                return Err(BenchError::DuplicateDevice(device_id));
            }
        }
        Ok(self.device_ids.clone())
    }
}
