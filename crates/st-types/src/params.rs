use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the three tunable knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    /// Maximum number of in-flight sequences the engine admits.
    MaxNumSeqs,
    /// Maximum tokens batched per scheduling step (chunked prefill only).
    MaxNumBatchedTokens,
    /// Offered client load in requests per second.
    RequestRate,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::MaxNumSeqs, Axis::MaxNumBatchedTokens, Axis::RequestRate];

    /// Position of this axis inside a direction vector.
    pub fn index(self) -> usize {
        match self {
            Axis::MaxNumSeqs => 0,
            Axis::MaxNumBatchedTokens => 1,
            Axis::RequestRate => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Axis::MaxNumSeqs => "max_num_seqs",
            Axis::MaxNumBatchedTokens => "max_num_batched_tokens",
            Axis::RequestRate => "request_rate",
        }
    }

    /// Integer-valued axes are rounded after every step.
    pub fn is_integer(self) -> bool {
        !matches!(self, Axis::RequestRate)
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether the engine runs with chunked prefill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TuningMode {
    /// Prefill is never chunked; the token budget is not tuned.
    DisabledChunked,
    /// Prefill is chunked under a batched-token budget.
    EnabledChunked,
}

impl TuningMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TuningMode::DisabledChunked => "disable_chunked",
            TuningMode::EnabledChunked => "enable_chunked",
        }
    }

    pub fn is_chunked(self) -> bool {
        matches!(self, TuningMode::EnabledChunked)
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "disable_chunked" => Some(TuningMode::DisabledChunked),
            "enable_chunked" => Some(TuningMode::EnabledChunked),
            _ => None,
        }
    }
}

impl fmt::Display for TuningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A concrete knob setting for one trial.
///
/// `max_num_seqs <= max_num_batched_tokens` holds whenever the token budget is
/// present; use [`ParameterPoint::clamped`] to restore it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterPoint {
    pub max_num_seqs: u32,
    pub max_num_batched_tokens: Option<u32>,
    pub request_rate: f64,
}

impl ParameterPoint {
    pub fn new(max_num_seqs: u32, max_num_batched_tokens: Option<u32>, request_rate: f64) -> Self {
        Self {
            max_num_seqs,
            max_num_batched_tokens,
            request_rate,
        }
    }

    /// Value of `axis` as a float, `None` for an absent token budget.
    pub fn get(&self, axis: Axis) -> Option<f64> {
        match axis {
            Axis::MaxNumSeqs => Some(f64::from(self.max_num_seqs)),
            Axis::MaxNumBatchedTokens => self.max_num_batched_tokens.map(f64::from),
            Axis::RequestRate => Some(self.request_rate),
        }
    }

    /// Copy of this point with `axis` set to `value`. Integer axes round.
    pub fn with(&self, axis: Axis, value: f64) -> Self {
        let mut next = self.clone();
        match axis {
            Axis::MaxNumSeqs => next.max_num_seqs = value.round().max(0.0) as u32,
            Axis::MaxNumBatchedTokens => {
                next.max_num_batched_tokens = Some(value.round().max(0.0) as u32)
            }
            Axis::RequestRate => next.request_rate = value,
        }
        next
    }

    /// True when both points agree on every axis except `axis`.
    pub fn shares_other_axes(&self, other: &Self, axis: Axis) -> bool {
        Axis::ALL
            .iter()
            .filter(|a| **a != axis)
            .all(|a| self.get(*a) == other.get(*a))
    }

    /// Lower the concurrency cap to the token budget when it exceeds it.
    pub fn clamped(mut self) -> Self {
        if let Some(tokens) = self.max_num_batched_tokens {
            if self.max_num_seqs > tokens {
                self.max_num_seqs = tokens;
            }
        }
        self
    }

    pub fn satisfies_token_bound(&self) -> bool {
        self.max_num_batched_tokens
            .map_or(true, |tokens| self.max_num_seqs <= tokens)
    }

    /// Directory-safe label `<seqs>_<tokens>_<rate>`.
    pub fn label(&self) -> String {
        self.to_string()
    }

    /// Inverse of [`ParameterPoint::label`].
    pub fn parse_label(label: &str) -> Option<Self> {
        let mut parts = label.split('_');
        let seqs = parts.next()?.parse().ok()?;
        let tokens = match parts.next()? {
            "none" => None,
            raw => Some(raw.parse().ok()?),
        };
        let rate = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(seqs, tokens, rate))
    }
}

impl fmt::Display for ParameterPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max_num_batched_tokens {
            Some(tokens) => write!(f, "{}_{}_{}", self.max_num_seqs, tokens, self.request_rate),
            None => write!(f, "{}_none_{}", self.max_num_seqs, self.request_rate),
        }
    }
}

/// Identity of one optimization run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunKey {
    pub model: String,
    pub dataset: String,
    pub num_prompts: u32,
    pub mode: TuningMode,
}

impl RunKey {
    pub fn new(
        model: impl Into<String>,
        dataset: impl Into<String>,
        num_prompts: u32,
        mode: TuningMode,
    ) -> Self {
        Self {
            model: model.into(),
            dataset: dataset.into(),
            num_prompts,
            mode,
        }
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.model, self.dataset, self.num_prompts, self.mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_respects_token_budget() {
        let point = ParameterPoint::new(512, Some(256), 4.0).clamped();
        assert_eq!(point.max_num_seqs, 256);
        assert!(point.satisfies_token_bound());

        let untouched = ParameterPoint::new(512, None, 4.0).clamped();
        assert_eq!(untouched.max_num_seqs, 512);
    }

    #[test]
    fn with_rounds_integer_axes() {
        let point = ParameterPoint::new(64, Some(2048), 2.5);
        assert_eq!(point.with(Axis::MaxNumSeqs, 95.6).max_num_seqs, 96);
        assert_eq!(point.with(Axis::RequestRate, 3.25).request_rate, 3.25);
        assert_eq!(
            point.with(Axis::MaxNumBatchedTokens, 4096.0).max_num_batched_tokens,
            Some(4096)
        );
    }

    #[test]
    fn label_parses_back() {
        let chunked = ParameterPoint::new(128, Some(4096), 7.5);
        assert_eq!(chunked.label(), "128_4096_7.5");
        assert_eq!(ParameterPoint::parse_label(&chunked.label()), Some(chunked));

        let plain = ParameterPoint::new(32, None, 2.0);
        assert_eq!(plain.label(), "32_none_2");
        assert_eq!(ParameterPoint::parse_label("32_none_2"), Some(plain));

        assert_eq!(ParameterPoint::parse_label("32_none"), None);
        assert_eq!(ParameterPoint::parse_label("a_b_c"), None);
    }

    #[test]
    fn shares_other_axes_ignores_the_named_axis() {
        let a = ParameterPoint::new(64, Some(2048), 2.0);
        let b = ParameterPoint::new(96, Some(2048), 2.0);
        assert!(a.shares_other_axes(&b, Axis::MaxNumSeqs));
        assert!(!a.shares_other_axes(&b, Axis::RequestRate));
    }

    #[test]
    fn mode_round_trips_through_str() {
        for mode in [TuningMode::DisabledChunked, TuningMode::EnabledChunked] {
            assert_eq!(TuningMode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(TuningMode::parse("chunked"), None);
    }
}
