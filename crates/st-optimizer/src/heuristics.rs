//! Bottleneck classification and the per-mode direction tables.
//!
//! Each trial is reduced to a handful of [`Signals`], classified into a single
//! [`Bottleneck`], and the bottleneck maps to a [`Direction`]: a nudge of at
//! most one axis. The two tuning modes share the classification vocabulary
//! but differ in which knob they reach for.

use serde::{Deserialize, Serialize};
use st_types::{
    Axis, ClientSummary, LatencyBreakdownTable, ParameterPoint, RunSampleTable, TuningMode,
};
use std::fmt;

use crate::config::Limits;

/// Factor above the TPOT limit still treated as a marginal breach.
const MARGINAL_TPOT_FACTOR: f64 = 1.2;
/// Fraction of the concurrency cap at which running requests count as near it.
const NEAR_CAP_FRACTION: f64 = 0.9;
/// Caps at or below this never count as near-saturated.
const MIN_CAP_FOR_NEAR: f64 = 8.0;
/// Prefill/decode vs chunk/batch ratio band.
const RATIO_HIGH: f64 = 1.25;
const RATIO_LOW: f64 = 0.8;

/// Signed step multiplier for one axis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Nudge {
    Shrink,
    EaseDown,
    #[default]
    Hold,
    EaseUp,
    Grow,
}

impl Nudge {
    pub fn factor(self) -> f64 {
        match self {
            Nudge::Shrink => -1.0,
            Nudge::EaseDown => -0.5,
            Nudge::Hold => 0.0,
            Nudge::EaseUp => 0.5,
            Nudge::Grow => 1.0,
        }
    }
}

/// A nudge per axis, indexed by [`Axis::index`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Direction([Nudge; 3]);

impl Direction {
    pub const HOLD: Direction = Direction([Nudge::Hold; 3]);

    /// Nudge `axis` only.
    pub fn only(axis: Axis, nudge: Nudge) -> Self {
        let mut nudges = [Nudge::Hold; 3];
        nudges[axis.index()] = nudge;
        Direction(nudges)
    }

    pub fn get(&self, axis: Axis) -> Nudge {
        self.0[axis.index()]
    }

    pub fn factor(&self, axis: Axis) -> f64 {
        self.get(axis).factor()
    }

    pub fn is_hold(&self) -> bool {
        self.0.iter().all(|n| *n == Nudge::Hold)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}, {}]",
            self.0[0].factor(),
            self.0[1].factor(),
            self.0[2].factor()
        )
    }
}

/// Everything the direction tables look at, derived from one trial.
#[derive(Debug, Clone, PartialEq)]
pub struct Signals {
    pub max_num_seqs: f64,
    pub max_num_batched_tokens: Option<f64>,
    pub request_rate: f64,
    /// Client P99 TTFT; infinite when the client did not report it.
    pub p99_ttft_ms: f64,
    /// Client P99 TPOT; infinite when the client did not report it.
    pub p99_tpot_ms: f64,
    pub total_input_tokens: Option<f64>,
    pub total_generated_tokens: Option<f64>,
    pub max_running: f64,
    pub max_batch_utils_pct: f64,
    pub max_block_utils_pct: f64,
    pub queue_ms: f64,
    pub context_ms: f64,
    pub decode_ms: f64,
}

impl Signals {
    pub fn observe(
        point: &ParameterPoint,
        summary: &ClientSummary,
        run_table: &RunSampleTable,
        latency_table: &LatencyBreakdownTable,
    ) -> Self {
        let p99 = latency_table.p99();
        Self {
            max_num_seqs: f64::from(point.max_num_seqs),
            max_num_batched_tokens: point.max_num_batched_tokens.map(f64::from),
            request_rate: point.request_rate,
            p99_ttft_ms: summary.p99_ttft_ms.unwrap_or(f64::INFINITY),
            p99_tpot_ms: summary.p99_tpot_ms.unwrap_or(f64::INFINITY),
            total_input_tokens: summary.total_input_tokens,
            total_generated_tokens: summary.total_generated_tokens,
            max_running: run_table.max_running(),
            max_batch_utils_pct: run_table.max_batch_utils_pct(),
            max_block_utils_pct: run_table.max_block_utils_pct(),
            queue_ms: p99.time_in_queue_ms(),
            context_ms: p99.context_latency_ms(),
            decode_ms: p99.per_token_latency_ms(),
        }
    }

    fn sla_violated(&self, limits: &Limits) -> bool {
        self.p99_ttft_ms > limits.ttft_p99_limit_ms || self.p99_tpot_ms > limits.tpot_p99_limit_ms
    }

    fn underutilized(&self, limits: &Limits) -> bool {
        self.max_batch_utils_pct <= limits.batch_lower_limit_pct
            || self.max_block_utils_pct <= limits.block_lower_limit_pct
    }

    fn running_at_cap(&self) -> bool {
        self.max_running == self.max_num_seqs
    }

    fn running_near_cap(&self) -> bool {
        self.max_running > NEAR_CAP_FRACTION * self.max_num_seqs
            && self.max_num_seqs > MIN_CAP_FOR_NEAR
    }

    fn decode_has_headroom(&self, limits: &Limits) -> bool {
        self.p99_tpot_ms <= limits.tpot_lower_limit_ms
    }

    /// Input/generated token ratio and chunk/batch ratio, when both are defined.
    fn workload_ratios(&self) -> Option<(f64, f64)> {
        let input = self.total_input_tokens?;
        let generated = self.total_generated_tokens.filter(|g| *g > 0.0)?;
        let tokens = self.max_num_batched_tokens?;
        if self.max_running <= 1.0 {
            return None;
        }
        let prefill_decode = input / generated;
        let chunk_batch = (tokens - self.max_running + 1.0) / (self.max_running - 1.0);
        Some((prefill_decode, chunk_batch))
    }
}

/// What is holding a trial back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bottleneck {
    /// Scheduler queue time alone exceeds the TTFT limit.
    Queueing,
    /// Prefill time alone exceeds the TTFT limit.
    ContextLatency,
    /// Per-token decode time exceeds the TPOT limit.
    DecodeLatency { marginal: bool },
    /// Queue, prefill and decode together exceed the TTFT limit.
    CombinedLatency,
    /// Client TTFT breached with no scheduler-side culprit.
    FirstTokenBreach,
    /// Client TPOT breached with no scheduler-side culprit.
    TokenPaceBreach { marginal: bool, running_near_cap: bool },
    /// SLA met but the batch or KV cache is underfed.
    Underutilized,
    /// SLA met with room to spare on decode pace.
    DecodeHeadroom { saturated: bool },
    /// Prompts dominate relative to the chunk budget.
    PrefillHeavy,
    /// Generation dominates relative to the chunk budget.
    DecodeHeavy { saturated: bool },
    /// Nothing to fix.
    Balanced,
}

/// Maps a trial's signals to a search direction.
pub trait DirectionHeuristic: Send + Sync {
    fn classify(&self, signals: &Signals, limits: &Limits) -> Bottleneck;

    fn respond(&self, bottleneck: Bottleneck) -> Direction;

    fn direction(&self, signals: &Signals, limits: &Limits) -> (Bottleneck, Direction) {
        let bottleneck = self.classify(signals, limits);
        (bottleneck, self.respond(bottleneck))
    }

    fn name(&self) -> &str;
}

pub fn heuristic_for(mode: TuningMode) -> Box<dyn DirectionHeuristic> {
    match mode {
        TuningMode::DisabledChunked => Box::new(DisabledChunkedHeuristic),
        TuningMode::EnabledChunked => Box::new(ChunkedPrefillHeuristic),
    }
}

/// Shared classification of an SLA breach. Only chunked mode can act on
/// prefill time, so the context check is opt-in.
fn classify_violation(signals: &Signals, limits: &Limits, check_context: bool) -> Bottleneck {
    let ttft_limit = limits.ttft_p99_limit_ms;
    let tpot_limit = limits.tpot_p99_limit_ms;

    if signals.queue_ms > ttft_limit {
        Bottleneck::Queueing
    } else if check_context && signals.context_ms > ttft_limit {
        Bottleneck::ContextLatency
    } else if signals.decode_ms > tpot_limit {
        Bottleneck::DecodeLatency {
            marginal: signals.decode_ms < MARGINAL_TPOT_FACTOR * tpot_limit,
        }
    } else if signals.queue_ms + signals.context_ms + signals.decode_ms > ttft_limit {
        Bottleneck::CombinedLatency
    } else if signals.p99_ttft_ms > ttft_limit {
        Bottleneck::FirstTokenBreach
    } else {
        Bottleneck::TokenPaceBreach {
            marginal: signals.p99_tpot_ms < MARGINAL_TPOT_FACTOR * tpot_limit
                && signals.request_rate > 1.0,
            running_near_cap: signals.running_near_cap(),
        }
    }
}

/// Direction table for engines without chunked prefill. The token budget is
/// never touched.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledChunkedHeuristic;

impl DirectionHeuristic for DisabledChunkedHeuristic {
    fn classify(&self, signals: &Signals, limits: &Limits) -> Bottleneck {
        if signals.sla_violated(limits) {
            return classify_violation(signals, limits, false);
        }
        if signals.decode_has_headroom(limits) && signals.running_at_cap() {
            Bottleneck::DecodeHeadroom { saturated: true }
        } else if signals.underutilized(limits) {
            Bottleneck::Underutilized
        } else {
            Bottleneck::Balanced
        }
    }

    fn respond(&self, bottleneck: Bottleneck) -> Direction {
        use Axis::{MaxNumSeqs, RequestRate};

        match bottleneck {
            Bottleneck::Queueing => Direction::only(RequestRate, Nudge::Shrink),
            Bottleneck::DecodeLatency { .. } => Direction::only(MaxNumSeqs, Nudge::Shrink),
            Bottleneck::CombinedLatency | Bottleneck::FirstTokenBreach => {
                Direction::only(RequestRate, Nudge::EaseDown)
            }
            Bottleneck::TokenPaceBreach { marginal: true, .. } => {
                Direction::only(RequestRate, Nudge::EaseDown)
            }
            Bottleneck::TokenPaceBreach { marginal: false, .. } => {
                Direction::only(MaxNumSeqs, Nudge::EaseDown)
            }
            Bottleneck::DecodeHeadroom { saturated: true } => {
                Direction::only(MaxNumSeqs, Nudge::Grow)
            }
            Bottleneck::Underutilized => Direction::only(RequestRate, Nudge::Grow),
            _ => Direction::HOLD,
        }
    }

    fn name(&self) -> &str {
        "disable_chunked"
    }
}

/// Direction table for engines with chunked prefill under a token budget.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkedPrefillHeuristic;

impl DirectionHeuristic for ChunkedPrefillHeuristic {
    fn classify(&self, signals: &Signals, limits: &Limits) -> Bottleneck {
        if signals.sla_violated(limits) {
            return classify_violation(signals, limits, true);
        }
        if signals.underutilized(limits) {
            return Bottleneck::Underutilized;
        }
        let saturated = signals.running_at_cap();
        if signals.decode_has_headroom(limits) {
            return Bottleneck::DecodeHeadroom { saturated };
        }

        match signals.workload_ratios() {
            Some((prefill_decode, chunk_batch)) if prefill_decode > RATIO_HIGH * chunk_batch => {
                Bottleneck::PrefillHeavy
            }
            Some((prefill_decode, chunk_batch)) if prefill_decode < RATIO_LOW * chunk_batch => {
                Bottleneck::DecodeHeavy { saturated }
            }
            Some(_) => Bottleneck::Balanced,
            None => {
                tracing::debug!(
                    max_running = signals.max_running,
                    "Workload ratios undefined; treating trial as balanced"
                );
                Bottleneck::Balanced
            }
        }
    }

    fn respond(&self, bottleneck: Bottleneck) -> Direction {
        use Axis::{MaxNumBatchedTokens, MaxNumSeqs, RequestRate};

        match bottleneck {
            Bottleneck::Queueing => Direction::only(RequestRate, Nudge::Shrink),
            Bottleneck::ContextLatency => Direction::only(MaxNumBatchedTokens, Nudge::Shrink),
            Bottleneck::DecodeLatency { marginal: true } => {
                Direction::only(MaxNumBatchedTokens, Nudge::EaseDown)
            }
            Bottleneck::DecodeLatency { marginal: false } => {
                Direction::only(MaxNumSeqs, Nudge::Shrink)
            }
            Bottleneck::CombinedLatency | Bottleneck::FirstTokenBreach => {
                Direction::only(RequestRate, Nudge::EaseDown)
            }
            Bottleneck::TokenPaceBreach { marginal: true, .. } => {
                Direction::only(RequestRate, Nudge::EaseDown)
            }
            Bottleneck::TokenPaceBreach {
                marginal: false,
                running_near_cap: true,
            } => Direction::only(MaxNumSeqs, Nudge::EaseDown),
            Bottleneck::TokenPaceBreach {
                marginal: false,
                running_near_cap: false,
            } => Direction::only(MaxNumBatchedTokens, Nudge::EaseDown),
            Bottleneck::Underutilized => Direction::only(RequestRate, Nudge::Grow),
            Bottleneck::DecodeHeadroom { saturated: true } => {
                Direction::only(MaxNumSeqs, Nudge::Grow)
            }
            Bottleneck::DecodeHeadroom { saturated: false } => {
                Direction::only(MaxNumBatchedTokens, Nudge::Grow)
            }
            Bottleneck::PrefillHeavy => Direction::only(MaxNumBatchedTokens, Nudge::EaseUp),
            Bottleneck::DecodeHeavy { saturated: true } => {
                Direction::only(MaxNumSeqs, Nudge::EaseUp)
            }
            Bottleneck::DecodeHeavy { saturated: false } => {
                Direction::only(MaxNumBatchedTokens, Nudge::EaseDown)
            }
            Bottleneck::Balanced => Direction::HOLD,
        }
    }

    fn name(&self) -> &str {
        "enable_chunked"
    }
}
