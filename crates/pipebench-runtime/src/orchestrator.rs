//! Runs one worker per device and folds their timings into a report.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use bytes::Bytes;
use pipebench_core::{Backend, Computation, DeviceRuntime, StageSpec};
use tracing::{debug, info};

use crate::{
    average_latency_ms, throughput, BenchConfig, BenchError, BenchReport, BenchResult, ErrorCell,
    PipelineResources, RunPlan, Worker, WorkerConfig,
};

pub fn device_count<B: Backend>(backend: &B) -> BenchResult<usize> {
    let count = backend
        .device_count()
        .with_context(|| format!("{} backend failed to enumerate devices", backend.name()))?;
    Ok(count)
}

/// Benchmark `config.artifact` on every configured device.
///
/// Consistency problems (no devices, mixed hardware, bad stages, unknown
/// batch) are reported before any worker starts. A failure inside any
/// pipeline stage, or a device finishing fewer iterations than requested,
/// turns the whole run into an error.
pub fn run_benchmark<B: Backend>(backend: &B, config: &BenchConfig) -> BenchResult<BenchReport> {
    config.validate()?;
    let device_ids = config.resolve_devices(device_count(backend)?)?;

    let mut devices = Vec::with_capacity(device_ids.len());
    let mut first_class: Option<(u32, String)> = None;
    for &device_id in &device_ids {
        let device = backend
            .acquire(device_id)
            .with_context(|| format!("failed to acquire device {device_id}"))?;
        let class = device
            .hardware_class()
            .with_context(|| format!("failed to query hardware of device {device_id}"))?;
        match &first_class {
            Some((first_device, expected)) if *expected != class => {
                return Err(BenchError::InconsistentHardware {
                    first_device: *first_device,
                    expected: expected.clone(),
                    device_id,
                    found: class,
                });
            }
            Some(_) => {}
            None => first_class = Some((device_id, class)),
        }
        devices.push(device);
    }

    let mut computations = Vec::with_capacity(devices.len());
    for device in &devices {
        let computation = device.load(&config.artifact).with_context(|| {
            format!(
                "failed to load {} on device {}",
                config.artifact.describe(),
                device.device_id()
            )
        })?;
        computations.push(computation);
    }

    let stages = computations[0].stages();
    for (device, computation) in devices.iter().zip(&computations).skip(1) {
        check_same_stages(stages, device.device_id(), computation.stages())?;
    }
    let plan = RunPlan::new(stages, config.batch)?;
    info!(
        backend = backend.name(),
        computation = computations[0].name(),
        devices = ?device_ids,
        batch = plan.batch,
        shapes = %plan.shape_info,
        "prepared run"
    );

    let input_staging = Bytes::from(vec![0u8; plan.largest_input]);
    let errors = Arc::new(ErrorCell::new());
    let worker_config = WorkerConfig {
        iterations: config.iterations,
        copy_elision: config.copy_elision,
        queue_depth: config.queue_depth,
    };

    let mut workers = Vec::with_capacity(devices.len());
    for (device, computation) in devices.into_iter().zip(computations) {
        let resources = PipelineResources::allocate(device, computation, &plan.stage)?;
        workers.push(Worker::new(
            resources,
            worker_config,
            input_staging.clone(),
            plan.largest_output,
            Arc::clone(&errors),
        )?);
    }

    let started = Instant::now();
    let mut start_error = None;
    for worker in &mut workers {
        if let Err(err) = worker.start() {
            start_error = Some(err);
            break;
        }
    }

    let mut total_latency_ms = 0.0;
    for worker in &mut workers {
        worker.join();
        total_latency_ms += worker.get_latency();
    }
    let wall_clock_ms = started.elapsed().as_secs_f64() * 1000.0;

    if let Some(err) = start_error {
        return Err(err.into());
    }
    if let Some(failure) = errors.first() {
        return Err(BenchError::StageFailed(failure));
    }
    for worker in &workers {
        let completed = worker.completed_iterations();
        if completed != config.iterations {
            return Err(BenchError::IncompleteRun {
                device_id: worker.device_id(),
                completed,
                expected: config.iterations,
            });
        }
    }

    let report = BenchReport {
        avg_latency_ms: average_latency_ms(total_latency_ms, workers.len(), config.iterations),
        throughput: throughput(workers.len(), config.iterations, plan.batch, wall_clock_ms),
        shape_info: plan.shape_info,
        batch: plan.batch,
        devices: device_ids,
        iterations: config.iterations,
        wall_clock_ms,
        copy_elision: config.copy_elision,
    };
    debug!(total_latency_ms, wall_clock_ms, "workers joined");
    info!(
        avg_latency_ms = report.avg_latency_ms,
        throughput = report.throughput,
        "run finished"
    );
    Ok(report)
}

/// Every device must have compiled the artifact to the same stages as the
/// first device.
fn check_same_stages(
    expected: &[StageSpec],
    device_id: u32,
    found: &[StageSpec],
) -> BenchResult<()> {
    if found.len() != expected.len() {
        return Err(BenchError::StageMismatch {
            stage: expected.len().min(found.len()),
            reason: format!(
                "device {device_id} exposes {} stages, first device exposes {}",
                found.len(),
                expected.len()
            ),
        });
    }
    match expected.iter().zip(found).position(|(e, f)| e != f) {
        Some(stage) => Err(BenchError::StageMismatch {
            stage,
            reason: format!("device {device_id} differs from the first device"),
        }),
        None => Ok(()),
    }
}
