//! # st-optimizer
//!
//! Closed-loop parameter search for ServeTune.
//!
//! Provides the per-axis step configuration, the SLA-gated throughput
//! evaluator, bottleneck heuristics for the two tuning modes, and the
//! directional search state machine that turns each finished trial into the
//! next point to try.

mod config;
mod evaluate;
mod heuristics;
mod search;
mod trial;

pub use config::{AxisStep, Limits, SearchConfig, StepConfig};
pub use evaluate::{Fitness, TrialEvaluator};
pub use heuristics::{
    heuristic_for, Bottleneck, ChunkedPrefillHeuristic, Direction, DirectionHeuristic,
    DisabledChunkedHeuristic, Nudge, Signals,
};
pub use search::{next_by_step, DirectionalSearch, SearchPhase, StopReason, TrialDecision};
pub use trial::{BestTrial, RunId, RunState, RunStatus, SearchState, Trial};
