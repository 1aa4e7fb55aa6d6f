//! Per-device three-stage pipeline: load -> execute -> store.
//!
//! Each stage runs on its own thread. Stages hand timing tokens (elapsed
//! microseconds for one iteration so far) to each other through two
//! [`BoundedQueue`]s, so the host transfer of iteration `i + 1` overlaps the
//! launch of iteration `i` and the readback of iteration `i - 1`.

use std::cell::Cell;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use anyhow::{Context, Result};
use bytes::Bytes;
use pipebench_core::{DeviceRuntime, StageSpec};
use tracing::{debug, error, info};

use crate::{BoundedQueue, DrainOnDrop, ErrorCell, LatencyAccumulator, Stage, StageFailure};

#[derive(Clone, Copy, Debug)]
pub struct WorkerConfig {
    pub iterations: u64,
    pub copy_elision: bool,
    pub queue_depth: usize,
}

/// Device-side state one worker's stages share.
///
/// Field order is drop order: tensors are freed before the device is
/// released.
pub struct PipelineResources<D: DeviceRuntime> {
    inputs: Vec<D::Tensor>,
    input_lens: Vec<usize>,
    outputs: Vec<D::Tensor>,
    output_lens: Vec<usize>,
    computation: D::Computation,
    device: D,
}

impl<D: DeviceRuntime> PipelineResources<D> {
    /// Allocate device tensors for every input and output of `stage`.
    pub fn allocate(device: D, computation: D::Computation, stage: &StageSpec) -> Result<Self> {
        let device_id = device.device_id();
        let mut inputs = Vec::with_capacity(stage.inputs.len());
        let mut input_lens = Vec::with_capacity(stage.inputs.len());
        for spec in &stage.inputs {
            let tensor = device.alloc(&spec.desc()).with_context(|| {
                format!("failed to allocate input {} on device {device_id}", spec.name.0)
            })?;
            inputs.push(tensor);
            input_lens.push(spec.byte_len());
        }

        let mut outputs = Vec::with_capacity(stage.outputs.len());
        let mut output_lens = Vec::with_capacity(stage.outputs.len());
        for spec in &stage.outputs {
            let tensor = device.alloc(&spec.desc()).with_context(|| {
                format!("failed to allocate output {} on device {device_id}", spec.name.0)
            })?;
            outputs.push(tensor);
            output_lens.push(spec.byte_len());
        }

        Ok(Self {
            inputs,
            input_lens,
            outputs,
            output_lens,
            computation,
            device,
        })
    }

    pub fn device_id(&self) -> u32 {
        self.device.device_id()
    }
}

struct StageHandles {
    load: JoinHandle<()>,
    execute: JoinHandle<()>,
    store: JoinHandle<LatencyAccumulator>,
}

pub struct Worker<D: DeviceRuntime> {
    device_id: u32,
    resources: Arc<PipelineResources<D>>,
    config: WorkerConfig,
    /// Read-only input template shared with every other worker.
    input_staging: Bytes,
    output_staging_len: usize,
    errors: Arc<ErrorCell>,
    handles: Option<StageHandles>,
    latency: LatencyAccumulator,
}

impl<D: DeviceRuntime> Worker<D> {
    pub fn new(
        resources: PipelineResources<D>,
        config: WorkerConfig,
        input_staging: Bytes,
        output_staging_len: usize,
        errors: Arc<ErrorCell>,
    ) -> Result<Self> {
        let needed_in = resources.input_lens.iter().copied().max().unwrap_or(0);
        let needed_out = resources.output_lens.iter().copied().max().unwrap_or(0);
        anyhow::ensure!(
            input_staging.len() >= needed_in,
            "input staging holds {} bytes, largest input needs {needed_in}",
            input_staging.len()
        );
        anyhow::ensure!(
            output_staging_len >= needed_out,
            "output staging holds {output_staging_len} bytes, largest output needs {needed_out}"
        );

        Ok(Self {
            device_id: resources.device_id(),
            resources: Arc::new(resources),
            config,
            input_staging,
            output_staging_len,
            errors,
            handles: None,
            latency: LatencyAccumulator::new(),
        })
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    /// Spawn the load, execute and store threads.
    ///
    /// Consumers are spawned before their producers; if a later spawn fails
    /// the already running stages are drained and joined before returning.
    pub fn start(&mut self) -> Result<()> {
        anyhow::ensure!(
            self.handles.is_none(),
            "worker for device {} already started",
            self.device_id
        );

        let load_q = Arc::new(BoundedQueue::new(self.config.queue_depth));
        let store_q = Arc::new(BoundedQueue::new(self.config.queue_depth));

        let store = {
            let ctx = self.stage_context(Stage::Store);
            let store_q = Arc::clone(&store_q);
            let output_staging = vec![0u8; self.output_staging_len];
            spawn_stage(Stage::Store, self.device_id, move || {
                run_storer(&ctx, output_staging, &store_q)
            })?
        };

        let execute = {
            let ctx = self.stage_context(Stage::Execute);
            let (load_q, store_q) = (Arc::clone(&load_q), Arc::clone(&store_q));
            spawn_stage(Stage::Execute, self.device_id, move || {
                run_executor(&ctx, &load_q, &store_q)
            })
        };
        let execute = match execute {
            Ok(handle) => handle,
            Err(err) => {
                store_q.drain();
                let _ = store.join();
                return Err(err);
            }
        };

        let load = {
            let ctx = self.stage_context(Stage::Load);
            let staging = self.input_staging.clone();
            let load_q = Arc::clone(&load_q);
            spawn_stage(Stage::Load, self.device_id, move || {
                run_loader(&ctx, &staging, &load_q)
            })
        };
        let load = match load {
            Ok(handle) => handle,
            Err(err) => {
                load_q.drain();
                let _ = execute.join();
                let _ = store.join();
                return Err(err);
            }
        };

        info!(
            device_id = self.device_id,
            iterations = self.config.iterations,
            copy_elision = self.config.copy_elision,
            "worker started"
        );
        self.handles = Some(StageHandles {
            load,
            execute,
            store,
        });
        Ok(())
    }

    /// Wait for all three stages. Safe to call repeatedly or before `start`.
    pub fn join(&mut self) {
        let Some(handles) = self.handles.take() else {
            return;
        };

        for (stage, handle) in [(Stage::Load, handles.load), (Stage::Execute, handles.execute)] {
            if handle.join().is_err() {
                error!(device_id = self.device_id, %stage, "stage thread panicked");
            }
        }
        match handles.store.join() {
            Ok(latency) => self.latency = latency,
            Err(_) => {
                error!(device_id = self.device_id, stage = %Stage::Store, "stage thread panicked");
            }
        }

        info!(
            device_id = self.device_id,
            completed = self.latency.samples(),
            "worker finished"
        );
    }

    /// Total latency over completed iterations, in milliseconds.
    ///
    /// Only meaningful after [`join`](Self::join).
    pub fn get_latency(&mut self) -> f64 {
        self.latency.total_ms()
    }

    /// Iterations that made it through all three stages.
    pub fn completed_iterations(&self) -> u64 {
        self.latency.samples()
    }

    fn stage_context(&self, stage: Stage) -> StageContext<D> {
        StageContext {
            stage,
            resources: Arc::clone(&self.resources),
            config: self.config,
            errors: Arc::clone(&self.errors),
            iteration: Cell::new(0),
        }
    }
}

impl<D: DeviceRuntime> Drop for Worker<D> {
    fn drop(&mut self) {
        self.join();
    }
}

struct StageContext<D: DeviceRuntime> {
    stage: Stage,
    resources: Arc<PipelineResources<D>>,
    config: WorkerConfig,
    errors: Arc<ErrorCell>,
    /// Iteration the stage is working on.
    iteration: Cell<u64>,
}

impl<D: DeviceRuntime> StageContext<D> {
    fn device(&self) -> &D {
        &self.resources.device
    }

    fn begin(&self, iteration: u64) {
        self.iteration.set(iteration);
    }

    fn fail(&self, err: anyhow::Error) {
        let iteration = self.iteration.get();
        let failure = StageFailure {
            device_id: self.resources.device_id(),
            stage: self.stage,
            iteration,
            message: format!("{err:#}"),
        };
        error!(
            device_id = failure.device_id,
            stage = %failure.stage,
            iteration,
            error = %failure.message,
            "pipeline stage failed"
        );
        self.errors.record(failure);
    }
}

/// Closes a stage's queues however the stage exits.
///
/// The downstream queue is drained so the next stage can finish. Whatever is
/// left upstream is consumed so the previous stage never blocks on a full
/// queue nobody reads. A panicking stage is recorded as a failure.
struct StageExit<'a, D: DeviceRuntime> {
    ctx: &'a StageContext<D>,
    upstream: Option<&'a BoundedQueue<u64>>,
    downstream: Option<DrainOnDrop<'a, u64>>,
}

impl<D: DeviceRuntime> Drop for StageExit<'_, D> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.ctx.errors.record(StageFailure {
                device_id: self.ctx.resources.device_id(),
                stage: self.ctx.stage,
                iteration: self.ctx.iteration.get(),
                message: "stage thread panicked".to_string(),
            });
        }
        drop(self.downstream.take());
        if let Some(queue) = self.upstream {
            let mut discarded = 0u64;
            while queue.pop().is_some() {
                discarded += 1;
            }
            if discarded > 0 {
                debug!(
                    device_id = self.ctx.resources.device_id(),
                    stage = %self.ctx.stage,
                    discarded,
                    "discarded queued iterations"
                );
            }
        }
    }
}

fn spawn_stage<T, F>(stage: Stage, device_id: u32, f: F) -> Result<JoinHandle<T>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    thread::Builder::new()
        .name(format!("{stage}-{device_id}"))
        .spawn(f)
        .with_context(|| format!("failed to spawn {stage} thread for device {device_id}"))
}

fn elapsed_us(start: Instant) -> u64 {
    start.elapsed().as_micros() as u64
}

fn run_loader<D: DeviceRuntime>(ctx: &StageContext<D>, staging: &[u8], out: &BoundedQueue<u64>) {
    let _exit = StageExit {
        ctx,
        upstream: None,
        downstream: Some(out.drain_on_drop()),
    };
    let res = &ctx.resources;

    for iteration in 0..ctx.config.iterations {
        if ctx.errors.is_set() {
            debug!(device_id = res.device_id(), iteration, "run already failed, stopping loads");
            return;
        }

        ctx.begin(iteration);
        let start = Instant::now();
        if !ctx.config.copy_elision {
            for (tensor, &len) in res.inputs.iter().zip(&res.input_lens) {
                if let Err(err) = ctx.device().transfer_to_device(tensor, &staging[..len]) {
                    ctx.fail(err);
                    return;
                }
            }
        }
        out.push(elapsed_us(start));
    }
}

fn run_executor<D: DeviceRuntime>(
    ctx: &StageContext<D>,
    input: &BoundedQueue<u64>,
    out: &BoundedQueue<u64>,
) {
    let _exit = StageExit {
        ctx,
        upstream: Some(input),
        downstream: Some(out.drain_on_drop()),
    };
    let res = &ctx.resources;

    let mut iteration = 0u64;
    while let Some(token) = input.pop() {
        if ctx.errors.is_set() {
            return;
        }
        ctx.begin(iteration);
        let start = Instant::now();
        if let Err(err) = ctx.device().execute(&res.computation, &res.inputs, &res.outputs) {
            ctx.fail(err);
            return;
        }
        out.push(token + elapsed_us(start));
        iteration += 1;
    }
}

fn run_storer<D: DeviceRuntime>(
    ctx: &StageContext<D>,
    mut staging: Vec<u8>,
    input: &BoundedQueue<u64>,
) -> LatencyAccumulator {
    let _exit = StageExit {
        ctx,
        upstream: Some(input),
        downstream: None,
    };
    let res = &ctx.resources;
    let mut latency = LatencyAccumulator::new();

    let mut iteration = 0u64;
    while let Some(token) = input.pop() {
        ctx.begin(iteration);
        let start = Instant::now();
        if !ctx.config.copy_elision {
            for (tensor, &len) in res.outputs.iter().zip(&res.output_lens) {
                if let Err(err) = ctx.device().transfer_from_device(&mut staging[..len], tensor) {
                    ctx.fail(err);
                    return latency;
                }
            }
        }
        latency.record(token + elapsed_us(start));
        iteration += 1;
    }
    latency
}
