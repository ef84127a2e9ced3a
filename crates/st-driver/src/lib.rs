//! # st-driver
//!
//! Trial drivers for ServeTune.
//!
//! A driver turns a parameter point into the raw text of one trial: the
//! benchmark client's report, a delimiter line, and the scheduler statistics
//! the server dumped. [`ShellDriver`] runs the engine and client through
//! shell sessions; [`ReplayDriver`] serves logs captured earlier.

pub mod config;
pub mod replay;
pub mod session;
pub mod shell;

pub use config::{
    ClientConfig, DatasetConfig, DriverConfig, ModelConfig, ReadLimits, ServerConfig,
    SessionConfig,
};
pub use replay::ReplayDriver;
pub use session::{Capture, ShellSession};
pub use shell::ShellDriver;

use async_trait::async_trait;
use st_types::{DriverResult, ParameterPoint, RunKey};

/// Produces the raw log of one trial.
#[async_trait]
pub trait ExperimentDriver: Send {
    /// Run `point` for `run` and return the trial log text.
    async fn run_trial(&mut self, run: &RunKey, point: &ParameterPoint) -> DriverResult<String>;

    /// Human-readable driver name.
    fn name(&self) -> &str;
}
