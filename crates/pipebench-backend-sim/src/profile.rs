use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use pipebench_core::{DType, StageSpec, TensorSpec};
use serde::{Deserialize, Serialize};

pub const DEFAULT_HARDWARE_CLASS: &str = "sim-accel";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimOp {
    Load,
    TransferToDevice,
    Execute,
    TransferFromDevice,
}

impl SimOp {
    pub fn as_str(self) -> &'static str {
        match self {
            SimOp::Load => "load",
            SimOp::TransferToDevice => "transfer_to_device",
            SimOp::Execute => "execute",
            SimOp::TransferFromDevice => "transfer_from_device",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// The call returns an error.
    #[default]
    Error,
    /// The call panics on the calling thread.
    Panic,
}

/// Make the `at_call`-th call (1-based) of `op` on `device_id` fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub device_id: u32,
    pub op: SimOp,
    pub at_call: u64,
    #[serde(default)]
    pub kind: FaultKind,
}

impl Fault {
    pub fn error(device_id: u32, op: SimOp, at_call: u64) -> Self {
        Self {
            device_id,
            op,
            at_call,
            kind: FaultKind::Error,
        }
    }

    pub fn panic(device_id: u32, op: SimOp, at_call: u64) -> Self {
        Self {
            kind: FaultKind::Panic,
            ..Self::error(device_id, op, at_call)
        }
    }
}

/// Behaviour of a simulated device pool.
///
/// Loaded from JSON; every field is optional:
///
/// ```json
/// {
///   "device_count": 2,
///   "execute_us": 800,
///   "hardware_overrides": { "1": "sim-accel-v2" },
///   "faults": [{ "device_id": 0, "op": "execute", "at_call": 40 }]
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimProfile {
    pub device_count: usize,
    pub hardware_class: String,
    /// Per-device hardware class replacing `hardware_class`.
    pub hardware_overrides: BTreeMap<u32, String>,
    /// Stages served for [`ModelArtifact::Builtin`](pipebench_core::ModelArtifact::Builtin).
    pub stages: Vec<StageSpec>,
    /// Per-device stages replacing `stages`.
    pub stage_overrides: BTreeMap<u32, Vec<StageSpec>>,
    pub to_device_us: u64,
    pub execute_us: u64,
    pub from_device_us: u64,
    pub faults: Vec<Fault>,
}

impl Default for SimProfile {
    fn default() -> Self {
        Self {
            device_count: 1,
            hardware_class: DEFAULT_HARDWARE_CLASS.to_string(),
            hardware_overrides: BTreeMap::new(),
            stages: vec![StageSpec {
                inputs: vec![TensorSpec::new("x", DType::F32, &[1, 16])],
                outputs: vec![TensorSpec::new("y", DType::F32, &[1, 16])],
            }],
            stage_overrides: BTreeMap::new(),
            to_device_us: 0,
            execute_us: 0,
            from_device_us: 0,
            faults: Vec::new(),
        }
    }
}

impl SimProfile {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read sim profile {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid sim profile {}", path.display()))
    }

    pub fn with_devices(mut self, device_count: usize) -> Self {
        self.device_count = device_count;
        self
    }

    pub fn with_stages(mut self, stages: Vec<StageSpec>) -> Self {
        self.stages = stages;
        self
    }

    pub fn with_delays_us(mut self, to_device: u64, execute: u64, from_device: u64) -> Self {
        self.to_device_us = to_device;
        self.execute_us = execute;
        self.from_device_us = from_device;
        self
    }

    pub fn with_hardware_override(mut self, device_id: u32, class: &str) -> Self {
        self.hardware_overrides.insert(device_id, class.to_string());
        self
    }

    pub fn with_stage_override(mut self, device_id: u32, stages: Vec<StageSpec>) -> Self {
        self.stage_overrides.insert(device_id, stages);
        self
    }

    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.faults.push(fault);
        self
    }

    pub fn hardware_class_of(&self, device_id: u32) -> &str {
        self.hardware_overrides
            .get(&device_id)
            .unwrap_or(&self.hardware_class)
    }

    pub fn delay_us(&self, op: SimOp) -> u64 {
        match op {
            SimOp::Load => 0,
            SimOp::TransferToDevice => self.to_device_us,
            SimOp::Execute => self.execute_us,
            SimOp::TransferFromDevice => self.from_device_us,
        }
    }

    pub fn fault_at(&self, device_id: u32, op: SimOp, call: u64) -> Option<FaultKind> {
        self.faults
            .iter()
            .find(|f| f.device_id == device_id && f.op == op && f.at_call == call)
            .map(|f| f.kind)
    }

    /// Stages `device_id` serves for builtin computations.
    pub fn stages_of(&self, device_id: u32) -> &[StageSpec] {
        self.stage_overrides
            .get(&device_id)
            .unwrap_or(&self.stages)
    }
}

/// Computation description read from a `.json` artifact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimModel {
    pub name: String,
    pub stages: Vec<StageSpec>,
}

impl SimModel {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&raw)?)
    }
}
