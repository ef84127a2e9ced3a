//! Search configuration: per-axis step rules and SLA limits.

use serde::{Deserialize, Serialize};
use st_types::{Axis, ParameterPoint, SearchError, TuningMode};

/// Step rule for a single axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisStep {
    /// Value tried by the seeded first trial.
    pub default: f64,
    /// Smallest meaningful change; every step is a multiple of it.
    pub granularity: f64,
    /// Base step size before direction and momentum are applied.
    pub step: f64,
    /// Inclusive `[lower, upper]` range.
    pub bounds: [f64; 2],
}

impl AxisStep {
    pub fn new(default: f64, granularity: f64, step: f64, lower: f64, upper: f64) -> Self {
        Self {
            default,
            granularity,
            step,
            bounds: [lower, upper],
        }
    }

    pub fn lower(&self) -> f64 {
        self.bounds[0]
    }

    pub fn upper(&self) -> f64 {
        self.bounds[1]
    }

    fn validate(&self, axis: Axis) -> Result<(), SearchError> {
        let invalid = |message: String| SearchError::InvalidConfig {
            message: format!("{axis}: {message}"),
        };

        if !(self.granularity > 0.0) || !self.granularity.is_finite() {
            return Err(invalid(format!("granularity must be positive, got {}", self.granularity)));
        }
        if !(self.step > 0.0) || !self.step.is_finite() {
            return Err(invalid(format!("step must be positive, got {}", self.step)));
        }
        if !(self.lower() <= self.upper()) {
            return Err(invalid(format!("empty bounds {:?}", self.bounds)));
        }
        if self.default < self.lower() || self.default > self.upper() {
            return Err(invalid(format!(
                "default {} outside bounds {:?}",
                self.default, self.bounds
            )));
        }
        if axis.is_integer() {
            let integral = [self.granularity, self.default, self.lower(), self.upper()]
                .iter()
                .all(|v| v.fract() == 0.0);
            if !integral {
                return Err(invalid(
                    "integer axis needs integral granularity, default and bounds".to_string(),
                ));
            }
            if self.lower() < 0.0 {
                return Err(invalid("integer axis cannot go below zero".to_string()));
            }
        }
        Ok(())
    }
}

/// Step rules for all three axes. The token axis is only required in
/// chunked mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    pub max_num_seqs: AxisStep,
    #[serde(default)]
    pub max_num_batched_tokens: Option<AxisStep>,
    pub request_rate: AxisStep,
}

impl StepConfig {
    pub fn axis(&self, axis: Axis) -> Option<&AxisStep> {
        match axis {
            Axis::MaxNumSeqs => Some(&self.max_num_seqs),
            Axis::MaxNumBatchedTokens => self.max_num_batched_tokens.as_ref(),
            Axis::RequestRate => Some(&self.request_rate),
        }
    }

    /// The seeded first point of a run. The token budget is only present in
    /// chunked mode, and concurrency is clamped to it.
    pub fn default_point(&self, mode: TuningMode) -> ParameterPoint {
        let tokens = if mode.is_chunked() {
            self.max_num_batched_tokens
                .as_ref()
                .map(|axis| axis.default as u32)
        } else {
            None
        };
        ParameterPoint::new(self.max_num_seqs.default as u32, tokens, self.request_rate.default)
            .clamped()
    }
}

/// SLA limits and heuristic thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Ceiling on client P99 time-to-first-token (ms).
    pub ttft_p99_limit_ms: f64,
    /// Ceiling on client P99 time-per-output-token (ms).
    pub tpot_p99_limit_ms: f64,
    /// P99 TPOT at or below which decode has headroom (ms).
    pub tpot_lower_limit_ms: f64,
    /// Max batch utilization at or below which the engine is underfed (%).
    pub batch_lower_limit_pct: f64,
    /// Max KV-block utilization at or below which the engine is underfed (%).
    pub block_lower_limit_pct: f64,
    /// Consecutive trials without a new best before the run stops.
    pub loss_limit: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            ttft_p99_limit_ms: 2000.0,
            tpot_p99_limit_ms: 100.0,
            tpot_lower_limit_ms: 50.0,
            batch_lower_limit_pct: 80.0,
            block_lower_limit_pct: 80.0,
            loss_limit: 3,
        }
    }
}

impl Limits {
    fn validate(&self) -> Result<(), SearchError> {
        let positive = [
            ("ttft_p99_limit_ms", self.ttft_p99_limit_ms),
            ("tpot_p99_limit_ms", self.tpot_p99_limit_ms),
        ];
        for (name, value) in positive {
            if !(value > 0.0) {
                return Err(SearchError::InvalidConfig {
                    message: format!("{name} must be positive, got {value}"),
                });
            }
        }
        if self.loss_limit == 0 {
            return Err(SearchError::InvalidConfig {
                message: "loss_limit must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Everything one directional search run needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    pub mode: TuningMode,
    pub steps: StepConfig,
    pub limits: Limits,
}

impl SearchConfig {
    pub fn new(mode: TuningMode, steps: StepConfig, limits: Limits) -> Self {
        Self { mode, steps, limits }
    }

    pub fn validate(&self) -> Result<(), SearchError> {
        self.steps.max_num_seqs.validate(Axis::MaxNumSeqs)?;
        self.steps.request_rate.validate(Axis::RequestRate)?;
        match (&self.steps.max_num_batched_tokens, self.mode) {
            (Some(tokens), _) => tokens.validate(Axis::MaxNumBatchedTokens)?,
            (None, TuningMode::EnabledChunked) => {
                return Err(SearchError::InvalidConfig {
                    message: "chunked mode requires a max_num_batched_tokens step rule".to_string(),
                })
            }
            (None, TuningMode::DisabledChunked) => {}
        }
        self.limits.validate()
    }
}
