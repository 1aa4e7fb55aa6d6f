//! Simulated accelerator backend.
//!
//! Devices are plain host memory. Every transfer and launch sleeps for a
//! configurable time, faults can be injected at a given call, and shared
//! counters record acquisitions, allocations and calls so callers can check
//! that everything handed out was returned.

mod profile;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use parking_lot::Mutex;
use pipebench_core::{Backend, Computation, DeviceRuntime, ModelArtifact, StageSpec, TensorDesc};
use tracing::debug;

pub use profile::*;

#[derive(Debug, Default)]
pub struct SimCounters {
    acquired: AtomicU64,
    released: AtomicU64,
    allocated: AtomicU64,
    freed: AtomicU64,
    loads: AtomicU64,
    to_device: AtomicU64,
    executes: AtomicU64,
    from_device: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub acquired: u64,
    pub released: u64,
    pub allocated: u64,
    pub freed: u64,
    pub loads: u64,
    pub to_device: u64,
    pub executes: u64,
    pub from_device: u64,
}

impl CounterSnapshot {
    /// Devices acquired but not yet released.
    pub fn live_devices(&self) -> u64 {
        self.acquired - self.released
    }

    /// Tensors allocated but not yet freed.
    pub fn live_tensors(&self) -> u64 {
        self.allocated - self.freed
    }
}

impl SimCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            acquired: self.acquired.load(Ordering::SeqCst),
            released: self.released.load(Ordering::SeqCst),
            allocated: self.allocated.load(Ordering::SeqCst),
            freed: self.freed.load(Ordering::SeqCst),
            loads: self.loads.load(Ordering::SeqCst),
            to_device: self.to_device.load(Ordering::SeqCst),
            executes: self.executes.load(Ordering::SeqCst),
            from_device: self.from_device.load(Ordering::SeqCst),
        }
    }

    fn op_counter(&self, op: SimOp) -> &AtomicU64 {
        match op {
            SimOp::Load => &self.loads,
            SimOp::TransferToDevice => &self.to_device,
            SimOp::Execute => &self.executes,
            SimOp::TransferFromDevice => &self.from_device,
        }
    }
}

pub struct SimBackend {
    profile: Arc<SimProfile>,
    counters: Arc<SimCounters>,
}

impl SimBackend {
    pub fn new(profile: SimProfile) -> Self {
        Self {
            profile: Arc::new(profile),
            counters: Arc::new(SimCounters::default()),
        }
    }

    pub fn from_profile_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Ok(Self::new(SimProfile::from_file(path)?))
    }

    pub fn profile(&self) -> &SimProfile {
        &self.profile
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new(SimProfile::default())
    }
}

impl Backend for SimBackend {
    type Device = SimDevice;

    fn name(&self) -> &'static str {
        "sim"
    }

    fn device_count(&self) -> Result<usize> {
        Ok(self.profile.device_count)
    }

    fn acquire(&self, device_id: u32) -> Result<Self::Device> {
        ensure!(
            (device_id as usize) < self.profile.device_count,
            "simulated device {device_id} does not exist"
        );
        self.counters.acquired.fetch_add(1, Ordering::SeqCst);
        debug!(device_id, "acquired simulated device");
        Ok(SimDevice {
            device_id,
            profile: Arc::clone(&self.profile),
            counters: Arc::clone(&self.counters),
            calls: OpCalls::default(),
        })
    }
}

/// Per-device call numbering used to trigger injected faults.
#[derive(Debug, Default)]
struct OpCalls {
    loads: AtomicU64,
    to_device: AtomicU64,
    executes: AtomicU64,
    from_device: AtomicU64,
}

impl OpCalls {
    fn next(&self, op: SimOp) -> u64 {
        let counter = match op {
            SimOp::Load => &self.loads,
            SimOp::TransferToDevice => &self.to_device,
            SimOp::Execute => &self.executes,
            SimOp::TransferFromDevice => &self.from_device,
        };
        counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}

pub struct SimDevice {
    device_id: u32,
    profile: Arc<SimProfile>,
    counters: Arc<SimCounters>,
    calls: OpCalls,
}

impl SimDevice {
    /// Count the call, sleep for the op's delay, and fail if a fault is
    /// scheduled for this call.
    fn call(&self, op: SimOp) -> Result<()> {
        let call = self.calls.next(op);
        self.counters.op_counter(op).fetch_add(1, Ordering::SeqCst);

        let delay_us = self.profile.delay_us(op);
        if delay_us > 0 {
            thread::sleep(Duration::from_micros(delay_us));
        }

        match self.profile.fault_at(self.device_id, op, call) {
            None => Ok(()),
            Some(FaultKind::Error) => bail!(
                "injected {} fault on simulated device {} (call {call})",
                op.as_str(),
                self.device_id
            ),
            Some(FaultKind::Panic) => panic!(
                "injected {} panic on simulated device {} (call {call})",
                op.as_str(),
                self.device_id
            ),
        }
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        self.counters.released.fetch_add(1, Ordering::SeqCst);
        debug!(device_id = self.device_id, "released simulated device");
    }
}

pub struct SimComputation {
    name: String,
    stages: Vec<StageSpec>,
}

impl Computation for SimComputation {
    fn name(&self) -> &str {
        &self.name
    }

    fn stages(&self) -> &[StageSpec] {
        &self.stages
    }
}

pub struct SimTensor {
    data: Mutex<Vec<u8>>,
    counters: Arc<SimCounters>,
}

impl SimTensor {
    pub fn read(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl Drop for SimTensor {
    fn drop(&mut self) {
        self.counters.freed.fetch_add(1, Ordering::SeqCst);
    }
}

impl DeviceRuntime for SimDevice {
    type Computation = SimComputation;
    type Tensor = SimTensor;

    fn device_id(&self) -> u32 {
        self.device_id
    }

    fn hardware_class(&self) -> Result<String> {
        Ok(self.profile.hardware_class_of(self.device_id).to_string())
    }

    fn load(&self, artifact: &ModelArtifact) -> Result<Self::Computation> {
        self.call(SimOp::Load)?;
        match artifact {
            ModelArtifact::Builtin(name) => Ok(SimComputation {
                name: name.clone(),
                stages: self.profile.stages_of(self.device_id).to_vec(),
            }),
            ModelArtifact::SimProfilePath(path) => {
                let model = SimModel::from_file(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                Ok(SimComputation {
                    name: model.name,
                    stages: model.stages,
                })
            }
            ModelArtifact::OnnxPath(path) => {
                bail!("simulated backend cannot load ONNX model {}", path.display())
            }
        }
    }

    fn alloc(&self, desc: &TensorDesc) -> Result<Self::Tensor> {
        self.counters.allocated.fetch_add(1, Ordering::SeqCst);
        Ok(SimTensor {
            data: Mutex::new(vec![0u8; desc.byte_len()]),
            counters: Arc::clone(&self.counters),
        })
    }

    fn transfer_to_device(&self, dst: &Self::Tensor, src: &[u8]) -> Result<()> {
        self.call(SimOp::TransferToDevice)?;
        let mut data = dst.data.lock();
        ensure!(
            src.len() == data.len(),
            "host buffer is {} bytes, device tensor is {}",
            src.len(),
            data.len()
        );
        data.copy_from_slice(src);
        Ok(())
    }

    fn transfer_from_device(&self, dst: &mut [u8], src: &Self::Tensor) -> Result<()> {
        self.call(SimOp::TransferFromDevice)?;
        let data = src.data.lock();
        ensure!(
            dst.len() == data.len(),
            "host buffer is {} bytes, device tensor is {}",
            dst.len(),
            data.len()
        );
        dst.copy_from_slice(&data);
        Ok(())
    }

    /// Identity computation: every output receives the first input's bytes,
    /// truncated or zero padded to fit.
    fn execute(
        &self,
        computation: &Self::Computation,
        inputs: &[Self::Tensor],
        outputs: &[Self::Tensor],
    ) -> Result<()> {
        self.call(SimOp::Execute)?;
        debug!(device_id = self.device_id, computation = %computation.name, "simulated launch");

        let source = inputs.first().map(SimTensor::read).unwrap_or_default();
        for output in outputs {
            let mut data = output.data.lock();
            let n = source.len().min(data.len());
            data[..n].copy_from_slice(&source[..n]);
            data[n..].fill(0);
        }
        Ok(())
    }
}
