use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use pipebench_backend_sim::{Fault, SimBackend, SimDevice, SimOp, SimProfile};
use pipebench_core::{Backend, DType, DeviceRuntime, ModelArtifact, StageSpec, TensorSpec};
use pipebench_runtime::{
    device_count, run_benchmark, BenchConfig, BenchError, ErrorCell, PipelineResources, Stage,
    Worker, WorkerConfig,
};

fn builtin() -> ModelArtifact {
    ModelArtifact::Builtin("sim".to_string())
}

fn stage(batch: usize) -> StageSpec {
    StageSpec {
        inputs: vec![
            TensorSpec::new("image", DType::F32, &[batch, 3, 4, 4]),
            TensorSpec::new("scale", DType::F32, &[batch, 1]),
        ],
        outputs: vec![TensorSpec::new("logits", DType::F32, &[batch, 10])],
    }
}

fn assert_all_released(backend: &SimBackend) {
    let counters = backend.counters();
    assert_eq!(counters.live_devices(), 0, "{counters:?}");
    assert_eq!(counters.live_tensors(), 0, "{counters:?}");
}

#[test]
fn single_device_latency_is_sum_of_stage_times() -> Result<()> {
    const TO_DEVICE_US: u64 = 2_000;
    const EXECUTE_US: u64 = 3_000;
    const FROM_DEVICE_US: u64 = 1_000;

    let profile = SimProfile::default().with_delays_us(TO_DEVICE_US, EXECUTE_US, FROM_DEVICE_US);
    let backend = SimBackend::new(profile);
    let config = BenchConfig::new(builtin()).with_iterations(5);

    let report = run_benchmark(&backend, &config)?;

    let expected_ms = (TO_DEVICE_US + EXECUTE_US + FROM_DEVICE_US) as f64 / 1000.0;
    assert!(
        report.avg_latency_ms >= expected_ms && report.avg_latency_ms < expected_ms + 5.0,
        "avg latency {} ms, expected about {expected_ms} ms",
        report.avg_latency_ms
    );
    let expected_throughput = 5.0 * 1000.0 / report.wall_clock_ms;
    assert!((report.throughput - expected_throughput).abs() < 1e-6);
    assert_eq!(report.batch, 1);
    assert_eq!(report.devices, vec![0]);
    assert_eq!(report.shape_info, "1x16;");

    let counters = backend.counters();
    assert_eq!(counters.to_device, 5);
    assert_eq!(counters.executes, 5);
    assert_eq!(counters.from_device, 5);
    assert_all_released(&backend);
    Ok(())
}

#[test]
fn pipelining_overlaps_transfers_with_compute() -> Result<()> {
    // Each stage takes 4 ms; run sequentially 20 iterations would need 240 ms.
    let profile = SimProfile::default().with_delays_us(4_000, 4_000, 4_000);
    let backend = SimBackend::new(profile);
    let report = run_benchmark(&backend, &BenchConfig::new(builtin()).with_iterations(20))?;

    assert!(report.avg_latency_ms >= 12.0);
    assert!(
        report.wall_clock_ms < 200.0,
        "wall clock {} ms shows no overlap",
        report.wall_clock_ms
    );
    Ok(())
}

#[test]
fn runs_every_device_and_counts_every_slot() -> Result<()> {
    let profile = SimProfile::default()
        .with_devices(3)
        .with_stages(vec![stage(1), stage(2)]);
    let backend = SimBackend::new(profile);
    let config = BenchConfig::new(builtin()).with_iterations(20);

    let report = run_benchmark(&backend, &config)?;

    assert_eq!(report.devices, vec![0, 1, 2]);
    assert_eq!(report.batch, 2);
    assert_eq!(report.shape_info, "1x3x4x4;1x1;2x3x4x4;2x1;");
    let expected_throughput = 3.0 * 20.0 * 2.0 * 1000.0 / report.wall_clock_ms;
    assert!((report.throughput - expected_throughput).abs() < 1e-6);

    let counters = backend.counters();
    assert_eq!(counters.executes, 60);
    assert_eq!(counters.to_device, 60 * 2);
    assert_eq!(counters.from_device, 60);
    assert_eq!(counters.loads, 3);
    assert_all_released(&backend);
    Ok(())
}

#[test]
fn requested_batch_selects_stage() -> Result<()> {
    let profile = SimProfile::default().with_stages(vec![stage(1), stage(4), stage(8)]);
    let backend = SimBackend::new(profile);
    let config = BenchConfig::new(builtin())
        .with_iterations(3)
        .with_batch(Some(4));

    let report = run_benchmark(&backend, &config)?;
    assert_eq!(report.batch, 4);
    Ok(())
}

#[test]
fn copy_elision_skips_transfers() -> Result<()> {
    let backend = SimBackend::default();
    let config = BenchConfig::new(builtin())
        .with_iterations(8)
        .with_copy_elision(true);

    let report = run_benchmark(&backend, &config)?;
    assert!(report.copy_elision);

    let counters = backend.counters();
    assert_eq!(counters.to_device, 0);
    assert_eq!(counters.from_device, 0);
    assert_eq!(counters.executes, 8);
    Ok(())
}

#[test]
fn shallow_queue_still_completes() -> Result<()> {
    let backend = SimBackend::new(SimProfile::default().with_devices(2));
    let config = BenchConfig::new(builtin())
        .with_iterations(50)
        .with_queue_depth(1);

    let report = run_benchmark(&backend, &config)?;
    assert_eq!(report.iterations, 50);
    assert_eq!(backend.counters().executes, 100);
    Ok(())
}

#[test]
fn transfer_failure_fails_the_run() {
    let profile = SimProfile::default().with_fault(Fault::error(0, SimOp::TransferToDevice, 3));
    let backend = SimBackend::new(profile);
    let config = BenchConfig::new(builtin()).with_iterations(10);

    match run_benchmark(&backend, &config) {
        Err(BenchError::StageFailed(failure)) => {
            assert_eq!(failure.device_id, 0);
            assert_eq!(failure.stage, Stage::Load);
            assert_eq!(failure.iteration, 2);
            assert!(failure.message.contains("injected"));
        }
        other => panic!("expected a load failure, got {other:?}"),
    }

    // Nothing past the failing iteration was loaded.
    assert_eq!(backend.counters().to_device, 3);
    assert!(backend.counters().executes <= 2);
    assert_all_released(&backend);
}

#[test]
fn execute_failure_does_not_hang_the_pipeline() {
    let profile = SimProfile::default()
        .with_devices(2)
        .with_fault(Fault::error(1, SimOp::Execute, 4));
    let backend = SimBackend::new(profile);
    let config = BenchConfig::new(builtin()).with_iterations(200);

    match run_benchmark(&backend, &config) {
        Err(BenchError::StageFailed(failure)) => {
            assert_eq!(failure.device_id, 1);
            assert_eq!(failure.stage, Stage::Execute);
            assert_eq!(failure.iteration, 3);
        }
        other => panic!("expected an execute failure, got {other:?}"),
    }
    assert_all_released(&backend);
}

#[test]
fn store_failure_does_not_hang_the_pipeline() {
    let profile = SimProfile::default().with_fault(Fault::error(0, SimOp::TransferFromDevice, 1));
    let backend = SimBackend::new(profile);
    let config = BenchConfig::new(builtin())
        .with_iterations(100)
        .with_queue_depth(1);

    let err = run_benchmark(&backend, &config).unwrap_err();
    assert!(matches!(
        err,
        BenchError::StageFailed(ref f) if f.stage == Stage::Store && f.iteration == 0
    ));
    assert!(backend.counters().executes < 100);
    assert_all_released(&backend);
}

#[test]
fn execute_panic_reports_the_panicking_iteration() {
    let profile = SimProfile::default().with_fault(Fault::panic(0, SimOp::Execute, 3));
    let backend = SimBackend::new(profile);
    let config = BenchConfig::new(builtin())
        .with_iterations(100)
        .with_queue_depth(1);

    match run_benchmark(&backend, &config) {
        Err(BenchError::StageFailed(failure)) => {
            assert_eq!(failure.device_id, 0);
            assert_eq!(failure.stage, Stage::Execute);
            assert_eq!(failure.iteration, 2);
            assert!(failure.message.contains("panicked"));
        }
        other => panic!("expected an execute panic, got {other:?}"),
    }
    assert_eq!(backend.counters().executes, 3);
    assert_all_released(&backend);
}

#[test]
fn one_device_failing_stops_the_others_early() {
    const ITERATIONS: u64 = 10_000;
    let profile = SimProfile::default()
        .with_devices(4)
        .with_delays_us(0, 100, 0)
        .with_fault(Fault::error(2, SimOp::TransferFromDevice, 2));
    let backend = SimBackend::new(profile);
    let config = BenchConfig::new(builtin()).with_iterations(ITERATIONS);

    match run_benchmark(&backend, &config) {
        Err(BenchError::StageFailed(failure)) => {
            assert_eq!(failure.device_id, 2);
            assert_eq!(failure.stage, Stage::Store);
            assert_eq!(failure.iteration, 1);
        }
        other => panic!("expected a store failure, got {other:?}"),
    }

    let executes = backend.counters().executes;
    assert!(
        executes < 4 * ITERATIONS / 10,
        "{executes} launches after an early failure"
    );
    assert_all_released(&backend);
}

#[test]
fn devices_with_different_stages_are_rejected_before_running() {
    let profile = SimProfile::default()
        .with_devices(2)
        .with_stages(vec![stage(1)])
        .with_stage_override(1, vec![stage(2)]);
    let backend = SimBackend::new(profile);

    let err = run_benchmark(&backend, &BenchConfig::new(builtin())).unwrap_err();
    match err {
        BenchError::StageMismatch { reason, .. } => {
            assert!(reason.contains("device 1"), "{reason}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(backend.counters().executes, 0);
    assert_all_released(&backend);
}

#[test]
fn mixed_hardware_is_rejected_before_running() {
    let profile = SimProfile::default()
        .with_devices(2)
        .with_hardware_override(1, "other-chip");
    let backend = SimBackend::new(profile);

    let err = run_benchmark(&backend, &BenchConfig::new(builtin())).unwrap_err();
    match err {
        BenchError::InconsistentHardware {
            first_device,
            device_id,
            found,
            ..
        } => {
            assert_eq!(first_device, 0);
            assert_eq!(device_id, 1);
            assert_eq!(found, "other-chip");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(backend.counters().executes, 0);
    assert_all_released(&backend);
}

#[test]
fn unknown_batch_is_rejected_before_running() {
    let backend = SimBackend::new(SimProfile::default().with_stages(vec![stage(1), stage(4)]));
    let config = BenchConfig::new(builtin()).with_batch(Some(2));

    let err = run_benchmark(&backend, &config).unwrap_err();
    assert!(matches!(err, BenchError::BatchNotFound { batch: 2, .. }));
    assert_eq!(backend.counters().executes, 0);
    assert_all_released(&backend);
}

#[test]
fn inconsistent_stages_are_rejected_before_running() {
    let mut odd = stage(4);
    odd.inputs[0] = TensorSpec::new("image", DType::F32, &[4, 3, 5, 5]);
    let backend = SimBackend::new(SimProfile::default().with_stages(vec![stage(1), odd]));

    let err = run_benchmark(&backend, &BenchConfig::new(builtin())).unwrap_err();
    assert!(matches!(err, BenchError::StageMismatch { stage: 1, .. }));
    assert_all_released(&backend);
}

#[test]
fn empty_device_pool_is_an_error() {
    let backend = SimBackend::new(SimProfile::default().with_devices(0));
    assert_eq!(device_count(&backend).unwrap(), 0);

    let err = run_benchmark(&backend, &BenchConfig::new(builtin())).unwrap_err();
    assert!(matches!(err, BenchError::NoDevices));
}

#[test]
fn load_failure_is_reported_with_context() {
    let backend = SimBackend::default();
    let config = BenchConfig::new(ModelArtifact::OnnxPath("resnet.onnx".into()));

    let err = run_benchmark(&backend, &config).unwrap_err();
    assert!(matches!(err, BenchError::Runtime(_)));
    assert!(format!("{err:#}").contains("failed to load resnet.onnx on device 0"));
    assert_all_released(&backend);
}

fn worker_for(backend: &SimBackend, iterations: u64) -> Result<Worker<SimDevice>> {
    let device = backend.acquire(0)?;
    let computation = device.load(&builtin())?;
    let stage = backend.profile().stages[0].clone();
    let resources = PipelineResources::allocate(device, computation, &stage)?;
    Worker::new(
        resources,
        WorkerConfig {
            iterations,
            copy_elision: false,
            queue_depth: 3,
        },
        Bytes::from(vec![0u8; stage.largest_input()]),
        stage.largest_output(),
        Arc::new(ErrorCell::new()),
    )
}

#[test]
fn worker_latency_is_stable_after_join() -> Result<()> {
    let backend = SimBackend::new(SimProfile::default().with_delays_us(0, 500, 0));
    let mut worker = worker_for(&backend, 6)?;

    worker.start()?;
    worker.join();
    worker.join();

    assert_eq!(worker.completed_iterations(), 6);
    let first = worker.get_latency();
    let second = worker.get_latency();
    assert_eq!(first, second);
    assert!(first >= 3.0, "latency {first} ms below 6 x 0.5 ms");
    Ok(())
}

#[test]
fn worker_join_before_start_is_a_no_op() -> Result<()> {
    let backend = SimBackend::default();
    let mut worker = worker_for(&backend, 1)?;
    worker.join();
    assert_eq!(worker.completed_iterations(), 0);
    assert_eq!(worker.get_latency(), 0.0);
    Ok(())
}

#[test]
fn worker_cannot_start_twice() -> Result<()> {
    let backend = SimBackend::default();
    let mut worker = worker_for(&backend, 2)?;
    worker.start()?;
    assert!(worker.start().is_err());
    worker.join();
    assert_eq!(worker.completed_iterations(), 2);
    Ok(())
}

#[test]
fn worker_rejects_undersized_staging() -> Result<()> {
    let backend = SimBackend::default();
    let device = backend.acquire(0)?;
    let computation = device.load(&builtin())?;
    let stage = backend.profile().stages[0].clone();
    let resources = PipelineResources::allocate(device, computation, &stage)?;

    let worker = Worker::new(
        resources,
        WorkerConfig {
            iterations: 1,
            copy_elision: false,
            queue_depth: 3,
        },
        Bytes::from_static(&[0u8; 4]),
        stage.largest_output(),
        Arc::new(ErrorCell::new()),
    );
    assert!(worker.is_err());
    assert_all_released(&backend);
    Ok(())
}
