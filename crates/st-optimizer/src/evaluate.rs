//! Trial fitness: request throughput when the SLA holds.

use serde::{Deserialize, Serialize};
use st_types::ClientSummary;
use tracing::warn;

use crate::config::Limits;

/// Outcome of scoring one trial.
///
/// `Infeasible` orders below every feasible value, so a run's best is simply
/// the maximum fitness seen.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum Fitness {
    Infeasible,
    Feasible(f64),
}

impl Fitness {
    /// Numeric stand-in for an infeasible trial, used by the momentum walk.
    pub const INFEASIBLE_SCORE: f64 = -1.0;

    pub fn is_feasible(self) -> bool {
        matches!(self, Fitness::Feasible(_))
    }

    pub fn throughput(self) -> Option<f64> {
        match self {
            Fitness::Feasible(value) => Some(value),
            Fitness::Infeasible => None,
        }
    }

    pub fn score(self) -> f64 {
        self.throughput().unwrap_or(Self::INFEASIBLE_SCORE)
    }
}

/// Scores client summaries against the SLA ceilings.
#[derive(Debug, Clone)]
pub struct TrialEvaluator {
    ttft_limit_ms: f64,
    tpot_limit_ms: f64,
}

impl TrialEvaluator {
    pub fn new(limits: &Limits) -> Self {
        Self {
            ttft_limit_ms: limits.ttft_p99_limit_ms,
            tpot_limit_ms: limits.tpot_p99_limit_ms,
        }
    }

    /// Request throughput if both P99 latencies are within their limits.
    /// A summary missing any of the three metrics is infeasible.
    pub fn evaluate(&self, summary: &ClientSummary) -> Fitness {
        let (Some(ttft), Some(tpot), Some(throughput)) = (
            summary.p99_ttft_ms,
            summary.p99_tpot_ms,
            summary.request_throughput,
        ) else {
            warn!("Client summary lacks P99 TTFT, P99 TPOT or throughput; trial is infeasible");
            return Fitness::Infeasible;
        };

        if ttft > self.ttft_limit_ms {
            warn!(ttft_ms = ttft, limit_ms = self.ttft_limit_ms, "P99 TTFT over limit");
            return Fitness::Infeasible;
        }
        if tpot > self.tpot_limit_ms {
            warn!(tpot_ms = tpot, limit_ms = self.tpot_limit_ms, "P99 TPOT over limit");
            return Fitness::Infeasible;
        }
        if !throughput.is_finite() {
            warn!(throughput, "Request throughput is not finite");
            return Fitness::Infeasible;
        }

        Fitness::Feasible(throughput)
    }
}
