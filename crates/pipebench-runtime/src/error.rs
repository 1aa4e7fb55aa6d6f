use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

pub type BenchResult<T> = Result<T, BenchError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Load,
    Execute,
    Store,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Load => "load",
            Stage::Execute => "execute",
            Stage::Store => "store",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First failure seen by one pipeline stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageFailure {
    pub device_id: u32,
    pub stage: Stage,
    /// Zero-based iteration that failed, as counted by the failing stage.
    pub iteration: u64,
    pub message: String,
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} stage failed on device {} at iteration {}: {}",
            self.stage, self.device_id, self.iteration, self.message
        )
    }
}

#[derive(Debug, Error)]
pub enum BenchError {
    #[error("no devices available")]
    NoDevices,

    #[error("device {device_id} does not exist ({available} devices available)")]
    UnknownDevice { device_id: u32, available: usize },

    #[error("device {0} is listed more than once")]
    DuplicateDevice(u32),

    #[error(
        "inconsistent hardware: device {first_device} is {expected}, device {device_id} is {found}"
    )]
    InconsistentHardware {
        first_device: u32,
        expected: String,
        device_id: u32,
        found: String,
    },

    #[error("computation exposes no stages")]
    NoStages,

    #[error("stage {stage} is inconsistent: {reason}")]
    StageMismatch { stage: usize, reason: String },

    #[error("batch {batch} not found in stages (available: {available:?})")]
    BatchNotFound { batch: usize, available: Vec<usize> },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    StageFailed(StageFailure),

    #[error("device {device_id} completed {completed} of {expected} iterations")]
    IncompleteRun {
        device_id: u32,
        completed: u64,
        expected: u64,
    },

    #[error(transparent)]
    Runtime(#[from] anyhow::Error),
}

/// Per-run failure flag shared by every stage of every worker.
///
/// Set at most once per failure, never cleared; the first recorded failure
/// is kept for reporting.
#[derive(Debug, Default)]
pub struct ErrorCell {
    failed: AtomicBool,
    first: Mutex<Option<StageFailure>>,
}

impl ErrorCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, failure: StageFailure) {
        let mut first = self.first.lock();
        if first.is_none() {
            *first = Some(failure);
        }
        self.failed.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn first(&self) -> Option<StageFailure> {
        self.first.lock().clone()
    }
}
