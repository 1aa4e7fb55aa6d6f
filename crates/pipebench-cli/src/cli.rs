use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "pipebench", version, about = "Pipelined multi-device inference benchmark")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print how many devices the backend exposes
    Devices {
        #[command(flatten)]
        backend: BackendArgs,
    },
    /// Benchmark a model on one or more devices
    Run(RunArgs),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// Simulated accelerator pool
    Sim,
    /// ONNX Runtime
    Onnx,
}

#[derive(Args, Debug)]
pub struct BackendArgs {
    #[arg(long, value_enum, default_value_t = BackendKind::Onnx)]
    pub backend: BackendKind,

    /// Simulated device pool description (JSON, sim backend only)
    #[arg(long)]
    pub profile: Option<PathBuf>,

    /// Run ONNX Runtime on N CUDA devices instead of the CPU
    #[arg(long)]
    pub cuda_devices: Option<usize>,

    /// Log level (RUST_LOG)
    #[arg(long, default_value = "warn")]
    pub log: String,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub backend: BackendArgs,

    /// Model file (.onnx, or .json stages for the sim backend) or builtin:NAME
    #[arg(long)]
    pub model: String,

    #[arg(long, default_value_t = pipebench_runtime::DEFAULT_ITERATIONS)]
    pub iterations: u64,

    /// Comma separated device ids; all devices when omitted
    #[arg(long, value_delimiter = ',')]
    pub devices: Vec<u32>,

    /// Keep data resident on the device and skip host transfers
    #[arg(long)]
    pub copy_elision: bool,

    #[arg(long, default_value_t = pipebench_runtime::DEFAULT_QUEUE_DEPTH)]
    pub queue_depth: usize,

    /// Batch size to run; defaults to the largest the model was compiled for
    #[arg(long)]
    pub batch: Option<usize>,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}
