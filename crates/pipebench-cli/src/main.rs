mod cli;
mod output;

use anyhow::{bail, Result};
use clap::Parser;
use cli::{BackendArgs, BackendKind, Cli, Command, RunArgs};
use pipebench_backend_ort::OrtBackend;
use pipebench_backend_sim::{SimBackend, SimProfile};
use pipebench_core::{Backend, ModelArtifact};
use pipebench_runtime::{device_count, run_benchmark, BenchConfig};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Devices { backend } => {
            init_logging(&backend.log);
            match backend.backend {
                BackendKind::Sim => print_devices(&sim_backend(&backend)?),
                BackendKind::Onnx => print_devices(&ort_backend(&backend)?),
            }
        }
        Command::Run(args) => {
            init_logging(&args.backend.log);
            match args.backend.backend {
                BackendKind::Sim => run_with(&sim_backend(&args.backend)?, &args),
                BackendKind::Onnx => run_with(&ort_backend(&args.backend)?, &args),
            }
        }
    }
}

fn init_logging(log: &str) {
    std::env::set_var("RUST_LOG", log);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
}

fn sim_backend(args: &BackendArgs) -> Result<SimBackend> {
    match &args.profile {
        Some(path) => SimBackend::from_profile_file(path),
        None => Ok(SimBackend::new(SimProfile::default())),
    }
}

fn ort_backend(args: &BackendArgs) -> Result<OrtBackend> {
    if args.profile.is_some() {
        bail!("--profile only applies to the sim backend");
    }
    Ok(match args.cuda_devices {
        Some(count) => OrtBackend::cuda(count),
        None => OrtBackend::new(),
    })
}

fn print_devices<B: Backend>(backend: &B) -> Result<()> {
    let count = device_count(backend)?;
    println!("{count}");
    Ok(())
}

fn parse_artifact(raw: &str) -> ModelArtifact {
    match raw.strip_prefix("builtin:") {
        Some(name) => ModelArtifact::Builtin(name.to_string()),
        None => ModelArtifact::from_path(raw),
    }
}

fn run_with<B: Backend>(backend: &B, args: &RunArgs) -> Result<()> {
    let config = BenchConfig::new(parse_artifact(&args.model))
        .with_iterations(args.iterations)
        .with_copy_elision(args.copy_elision)
        .with_devices(args.devices.clone())
        .with_queue_depth(args.queue_depth)
        .with_batch(args.batch);

    tracing::info!(backend = backend.name(), model = %config.artifact.describe(), "starting benchmark");
    let report = run_benchmark(backend, &config)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", output::summary_table(&report));
    }
    Ok(())
}
