//! # st-tuner
//!
//! The ServeTune tuning loop. For every model, dataset and tuning mode it
//! seeds a [`st_optimizer::DirectionalSearch`], runs trials through an
//! [`st_driver::ExperimentDriver`], and records each trial in the trial store
//! and the results table.

pub mod config;
pub mod runner;

pub use config::{AppConfig, TuningConfig};
pub use runner::{collect, Tuner};
