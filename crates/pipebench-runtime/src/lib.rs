pub mod config;
pub mod error;
pub mod latency;
pub mod orchestrator;
pub mod plan;
pub mod queue;
pub mod report;
pub mod worker;

pub use config::*;
pub use error::*;
pub use latency::*;
pub use orchestrator::*;
pub use plan::*;
pub use queue::*;
pub use report::*;
pub use worker::*;
