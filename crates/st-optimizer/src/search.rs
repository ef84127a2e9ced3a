//! Directional search: one trial in, one decision out.

use serde::{Deserialize, Serialize};
use st_types::{
    Axis, ClientSummary, LatencyBreakdownTable, ParameterPoint, RunSampleTable, SearchError,
};
use std::fmt;
use tracing::{debug, info};

use crate::config::{AxisStep, SearchConfig};
use crate::evaluate::{Fitness, TrialEvaluator};
use crate::heuristics::{heuristic_for, DirectionHeuristic, Signals};
use crate::trial::{SearchState, Trial};

/// Values this close to an integer snap to it.
const INTEGER_SNAP: f64 = 0.01;

/// Why a run stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StopReason {
    /// The loss limit was reached without a new best.
    NoProgress { trials_since_best: usize },
    /// No axis could move in the chosen direction.
    Converged,
    /// The next candidate was already tried.
    DuplicatePoint(ParameterPoint),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::NoProgress { trials_since_best } => {
                write!(f, "no progress in {trials_since_best} trials")
            }
            StopReason::Converged => f.write_str("converged"),
            StopReason::DuplicatePoint(point) => write!(f, "next point {point} already tried"),
        }
    }
}

/// What the caller should do after a trial is recorded.
#[derive(Debug, Clone, PartialEq)]
pub enum TrialDecision {
    Continue(ParameterPoint),
    Stop(StopReason),
}

impl TrialDecision {
    pub fn should_continue(&self) -> bool {
        matches!(self, TrialDecision::Continue(_))
    }

    pub fn next_point(&self) -> Option<&ParameterPoint> {
        match self {
            TrialDecision::Continue(point) => Some(point),
            TrialDecision::Stop(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchPhase {
    Init,
    AwaitingTrial,
    ChoosingDirection,
    Converged,
    StoppedNoProgress,
    DeadEnd,
}

impl SearchPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SearchPhase::Converged | SearchPhase::StoppedNoProgress | SearchPhase::DeadEnd
        )
    }
}

/// Apply a raw step to `current` under `rule`.
///
/// Steps smaller than the granularity are no step. Otherwise the step is
/// truncated toward zero to a granularity multiple and the result is held
/// inside the bounds; a move that would cross a bound lands on it, or is no
/// step when already there.
pub fn next_by_step(rule: &AxisStep, current: f64, raw_step: f64) -> Option<f64> {
    if !raw_step.is_finite() || raw_step.abs() < rule.granularity {
        return None;
    }
    let step = (raw_step / rule.granularity).trunc() * rule.granularity;
    let next = current + step;

    if next <= rule.lower() {
        return (current != rule.lower()).then_some(rule.lower());
    }
    if next >= rule.upper() {
        return (current != rule.upper()).then_some(rule.upper());
    }

    let nearest = next.round();
    if (next - nearest).abs() < INTEGER_SNAP {
        Some(nearest)
    } else {
        Some(next)
    }
}

/// Step along `axis` from trial `anchor`, scaled by how the trials on the
/// same line have been trending.
///
/// Trials sharing the anchor's other two axes are walked in the direction of
/// travel. The first trial past the anchor that scores worse (or is feasible
/// where the anchor is not) pulls the step back to half the distance to it.
/// Otherwise the base step is multiplied by the length of the improving run
/// that ends at the line's leading edge.
fn momentum_step(trials: &[Trial], anchor: usize, axis: Axis, rule: &AxisStep) -> Option<f64> {
    let current = &trials[anchor];
    let value = current.point.get(axis)?;
    let factor = current.direction.factor(axis);
    let base_step = factor * rule.step;

    let mut line: Vec<(usize, f64)> = trials
        .iter()
        .enumerate()
        .filter(|(_, t)| t.point.shares_other_axes(&current.point, axis))
        .filter_map(|(i, t)| t.point.get(axis).map(|v| (i, v)))
        .collect();
    if line.len() == 1 {
        return next_by_step(rule, value, base_step);
    }
    line.sort_by(|a, b| (factor * a.1).total_cmp(&(factor * b.1)));

    let anchor_score = current.fitness.score();
    let mut passed_anchor = false;
    let mut last = 0.0;
    let mut multiplier = 1.0;

    for (index, other_value) in line {
        let score = trials[index].fitness.score();
        if passed_anchor {
            let worse = anchor_score > score;
            let recovers = anchor_score == Fitness::INFEASIBLE_SCORE && score > 0.0;
            if worse || recovers {
                return next_by_step(rule, value, (other_value - value) / 2.0);
            }
        }
        if index == anchor {
            passed_anchor = true;
        }

        if score > last && last > 0.0 {
            multiplier += 1.0;
        } else if score == Fitness::INFEASIBLE_SCORE && last == Fitness::INFEASIBLE_SCORE {
            multiplier += 1.0;
        } else {
            multiplier = 1.0;
        }
        last = score;
    }

    next_by_step(rule, value, multiplier * base_step)
}

enum Proposal {
    Candidate(ParameterPoint),
    Stuck,
}

/// Closed-loop coordinate search over one run's parameter space.
pub struct DirectionalSearch {
    config: SearchConfig,
    evaluator: TrialEvaluator,
    heuristic: Box<dyn DirectionHeuristic>,
    state: SearchState,
    phase: SearchPhase,
}

impl DirectionalSearch {
    pub fn new(config: SearchConfig) -> Result<Self, SearchError> {
        config.validate()?;
        Ok(Self {
            evaluator: TrialEvaluator::new(&config.limits),
            heuristic: heuristic_for(config.mode),
            config,
            state: SearchState::new(),
            phase: SearchPhase::Init,
        })
    }

    /// Replace the mode's direction table.
    pub fn with_heuristic(mut self, heuristic: Box<dyn DirectionHeuristic>) -> Self {
        self.heuristic = heuristic;
        self
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn state(&self) -> &SearchState {
        &self.state
    }

    pub fn phase(&self) -> SearchPhase {
        self.phase
    }

    pub fn best(&self) -> Option<&Trial> {
        self.state.best()
    }

    /// The first point to try.
    pub fn seed(&mut self) -> ParameterPoint {
        if self.phase == SearchPhase::Init {
            self.phase = SearchPhase::AwaitingTrial;
        }
        self.config.steps.default_point(self.config.mode)
    }

    /// Record the outcome of running `point` and decide where to go next.
    pub fn record_trial(
        &mut self,
        point: ParameterPoint,
        summary: ClientSummary,
        run_table: RunSampleTable,
        latency_table: LatencyBreakdownTable,
    ) -> Result<TrialDecision, SearchError> {
        if self.phase.is_terminal() {
            return Err(SearchError::Finished {
                reason: format!("{:?}", self.phase),
            });
        }
        if self.config.mode.is_chunked() && point.max_num_batched_tokens.is_none() {
            return Err(SearchError::MissingTokenBudget {
                point: point.to_string(),
            });
        }
        if self.state.contains(&point) {
            return Err(SearchError::RepeatedPoint {
                point: point.to_string(),
            });
        }
        self.phase = SearchPhase::ChoosingDirection;

        let fitness = self.evaluator.evaluate(&summary);
        let trial_number = self.state.len();

        // After a regression, retry the previous trial's direction from its
        // point; the momentum walk then halves toward the worse trial.
        let regressed_from = self.state.last().filter(|prev| prev.fitness > fitness);
        let (anchor, bottleneck, direction) = match regressed_from {
            Some(prev) => {
                debug!(
                    trial = trial_number,
                    direction = %prev.direction,
                    "Regression; reusing previous direction"
                );
                (trial_number - 1, None, prev.direction)
            }
            None => {
                let signals = Signals::observe(&point, &summary, &run_table, &latency_table);
                let (bottleneck, direction) =
                    self.heuristic.direction(&signals, &self.config.limits);
                debug!(
                    trial = trial_number,
                    heuristic = self.heuristic.name(),
                    ?bottleneck,
                    direction = %direction,
                    "Chose direction"
                );
                (trial_number, Some(bottleneck), direction)
            }
        };

        let trial = Trial::new(
            trial_number,
            point,
            summary,
            run_table,
            latency_table,
            fitness,
            bottleneck,
            direction,
        );
        info!(trial = trial_number, point = %trial.point, ?fitness, "Recorded trial");
        if self.state.push(trial) {
            info!(trial = trial_number, ?fitness, "New best");
        }

        let trials_since_best = self.state.trials_since_best();
        if trials_since_best >= self.config.limits.loss_limit {
            return Ok(self.stop(StopReason::NoProgress { trials_since_best }));
        }

        let decision = match self.propose(anchor) {
            Proposal::Stuck => self.stop(StopReason::Converged),
            Proposal::Candidate(candidate) if self.state.contains(&candidate) => {
                self.stop(StopReason::DuplicatePoint(candidate))
            }
            Proposal::Candidate(candidate) => {
                self.phase = SearchPhase::AwaitingTrial;
                debug!(next = %candidate, "Next point");
                TrialDecision::Continue(candidate)
            }
        };
        Ok(decision)
    }

    fn propose(&self, anchor: usize) -> Proposal {
        let trials = self.state.trials();
        let base = &trials[anchor].point;
        let direction = trials[anchor].direction;

        let mut candidate = base.clone();
        let mut moved = false;

        for axis in Axis::ALL {
            let factor = direction.factor(axis);
            if factor == 0.0 {
                continue;
            }
            let Some(rule) = self.config.steps.axis(axis) else {
                continue;
            };
            let next = match axis {
                Axis::MaxNumBatchedTokens => base
                    .get(axis)
                    .and_then(|value| next_by_step(rule, value, factor * rule.step)),
                Axis::MaxNumSeqs | Axis::RequestRate => momentum_step(trials, anchor, axis, rule),
            };
            match next {
                Some(value) => {
                    candidate = candidate.with(axis, value);
                    moved = true;
                }
                None => debug!(%axis, "No room to move"),
            }
        }

        if moved {
            Proposal::Candidate(candidate.clamped())
        } else {
            Proposal::Stuck
        }
    }

    fn stop(&mut self, reason: StopReason) -> TrialDecision {
        self.phase = match reason {
            StopReason::NoProgress { .. } => SearchPhase::StoppedNoProgress,
            StopReason::Converged => SearchPhase::Converged,
            StopReason::DuplicatePoint(_) => SearchPhase::DeadEnd,
        };
        info!(%reason, trials = self.state.len(), "Search stopped");
        TrialDecision::Stop(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_steps;
    use crate::config::Limits;
    use crate::heuristics::{Direction, Nudge};
    use st_types::{LatencySample, RunSample, TuningMode};

    type Observation = (ClientSummary, RunSampleTable, LatencyBreakdownTable);

    fn observation(
        ttft_ms: f64,
        tpot_ms: f64,
        throughput: f64,
        max: RunSample,
        queue_s: f64,
    ) -> Observation {
        let summary = ClientSummary {
            p99_ttft_ms: Some(ttft_ms),
            p99_tpot_ms: Some(tpot_ms),
            request_throughput: Some(throughput),
            total_input_tokens: Some(200_000.0),
            total_generated_tokens: Some(100_000.0),
            ..Default::default()
        };
        let run_table = RunSampleTable::new([max, RunSample::default(), RunSample::default()]);
        let mut latency = [LatencySample::default(); 5];
        latency[4].time_in_queue_s = queue_s;
        latency[4].context_latency_s = 0.2;
        latency[4].per_token_latency_s = 0.06;
        (summary, run_table, LatencyBreakdownTable::new(latency))
    }

    /// SLA met but the batch is mostly empty: grow the request rate.
    fn underfed(throughput: f64) -> Observation {
        let max = RunSample {
            running: 20.0,
            batch_utils: 0.3,
            block_utils: 0.3,
            ..Default::default()
        };
        observation(500.0, 70.0, throughput, max, 0.1)
    }

    /// TTFT breached by scheduler queueing: infeasible, cut the rate.
    fn queueing() -> Observation {
        let max = RunSample {
            running: 64.0,
            batch_utils: 0.95,
            block_utils: 0.95,
            ..Default::default()
        };
        observation(2500.0, 70.0, 9.0, max, 2.2)
    }

    /// SLA met with decode headroom and running pinned at the cap.
    fn saturated(cap: u32, throughput: f64) -> Observation {
        let max = RunSample {
            running: f64::from(cap),
            batch_utils: 0.9,
            block_utils: 0.9,
            ..Default::default()
        };
        observation(500.0, 40.0, throughput, max, 0.1)
    }

    fn search(mode: TuningMode, loss_limit: usize) -> DirectionalSearch {
        let limits = Limits {
            loss_limit,
            ..Limits::default()
        };
        DirectionalSearch::new(SearchConfig::new(mode, sample_steps(), limits)).unwrap()
    }

    fn record(
        search: &mut DirectionalSearch,
        point: ParameterPoint,
        obs: Observation,
    ) -> TrialDecision {
        let (summary, run_table, latency_table) = obs;
        search.record_trial(point, summary, run_table, latency_table).unwrap()
    }

    fn at_rate(rate: f64) -> ParameterPoint {
        ParameterPoint::new(64, None, rate)
    }

    fn growing(number: usize, rate: f64, score: f64) -> Trial {
        let (summary, run_table, latency_table) = underfed(score);
        Trial::new(
            number,
            at_rate(rate),
            summary,
            run_table,
            latency_table,
            Fitness::Feasible(score),
            None,
            Direction::only(Axis::RequestRate, Nudge::Grow),
        )
    }

    #[test]
    fn first_trial_on_a_line_never_extends_momentum() {
        // The walk's trailing score starts at zero, so only the second
        // improving trial lengthens the run: 5 + 2 * 1, not 5 + 3 * 1.
        let trials = [growing(0, 4.0, 3.0), growing(1, 5.0, 4.0)];
        let rule = sample_steps().request_rate;
        assert_eq!(momentum_step(&trials, 1, Axis::RequestRate, &rule), Some(7.0));

        // A lone trial takes the base step.
        assert_eq!(momentum_step(&trials[..1], 0, Axis::RequestRate, &rule), Some(5.0));
    }

    #[test]
    fn step_rule_quantizes_toward_zero() {
        let rate = sample_steps().request_rate;
        assert_eq!(next_by_step(&rate, 4.0, 0.4), None);
        assert_eq!(next_by_step(&rate, 4.0, 1.3), Some(5.0));
        assert_eq!(next_by_step(&rate, 4.0, -1.3), Some(3.0));
        assert_eq!(next_by_step(&rate, 4.0, f64::NAN), None);
    }

    #[test]
    fn step_rule_lands_on_bounds() {
        let rate = sample_steps().request_rate;
        assert_eq!(next_by_step(&rate, 15.0, 3.0), Some(16.0));
        assert_eq!(next_by_step(&rate, 16.0, 1.0), None);
        assert_eq!(next_by_step(&rate, 1.0, -1.0), Some(0.5));
        assert_eq!(next_by_step(&rate, 0.5, -1.0), None);
    }

    #[test]
    fn step_rule_snaps_near_integers() {
        let rate = sample_steps().request_rate;
        assert_eq!(next_by_step(&rate, 2.003, 1.0), Some(3.0));
        assert_eq!(next_by_step(&rate, 2.25, 1.0), Some(3.25));
    }

    #[test]
    fn step_rule_stays_in_bounds() {
        let steps = sample_steps();
        for rule in [&steps.max_num_seqs, &steps.request_rate] {
            let mut current = rule.lower();
            while current <= rule.upper() {
                for raw in [-1000.0, -17.0, -1.0, -0.5, 0.0, 0.5, 1.0, 17.0, 1000.0] {
                    if let Some(next) = next_by_step(rule, current, raw) {
                        assert!(
                            next >= rule.lower() && next <= rule.upper(),
                            "{current} + {raw} -> {next}"
                        );
                        assert_ne!(next, current);
                    }
                }
                current += rule.granularity * 7.0;
            }
        }
    }

    #[test]
    fn seed_is_clamped_default() {
        let mut search = search(TuningMode::EnabledChunked, 3);
        assert_eq!(search.phase(), SearchPhase::Init);
        assert_eq!(search.seed(), ParameterPoint::new(64, Some(2048), 4.0));
        assert_eq!(search.phase(), SearchPhase::AwaitingTrial);
    }

    #[test]
    fn queueing_in_disabled_mode_cuts_rate() {
        let mut search = search(TuningMode::DisabledChunked, 3);
        let point = search.seed();
        let decision = record(&mut search, point, queueing());

        assert_eq!(decision, TrialDecision::Continue(at_rate(3.0)));
        let trial = &search.state().trials()[0];
        assert_eq!(trial.fitness, Fitness::Infeasible);
        assert_eq!(trial.direction.factor(Axis::RequestRate), -1.0);
        assert_eq!(trial.direction.factor(Axis::MaxNumSeqs), 0.0);
    }

    #[test]
    fn momentum_grows_on_improvement_and_halves_on_regression() {
        let mut search = search(TuningMode::DisabledChunked, 5);

        assert_eq!(
            record(&mut search, at_rate(4.0), underfed(3.0)),
            TrialDecision::Continue(at_rate(5.0))
        );
        assert_eq!(
            record(&mut search, at_rate(5.0), underfed(3.5)),
            TrialDecision::Continue(at_rate(7.0))
        );
        assert_eq!(
            record(&mut search, at_rate(7.0), underfed(4.0)),
            TrialDecision::Continue(at_rate(10.0))
        );

        // Overshoot: the previous direction is retried from 7.0 and the
        // step of 3.0 is halved toward the failed point.
        let decision = record(&mut search, at_rate(10.0), queueing());
        assert_eq!(decision, TrialDecision::Continue(at_rate(8.5)));

        let last = &search.state().trials()[3];
        assert!(last.bottleneck.is_none());
        assert_eq!(last.direction.factor(Axis::RequestRate), 1.0);
        assert_eq!(search.best().map(|t| t.trial_number), Some(2));
        assert_eq!(search.state().trials_since_best(), 1);
    }

    #[test]
    fn bracketed_by_infeasible_trials_converges() {
        let mut search = search(TuningMode::DisabledChunked, 5);

        assert_eq!(
            record(&mut search, at_rate(4.0), underfed(3.0)),
            TrialDecision::Continue(at_rate(5.0))
        );
        assert_eq!(
            record(&mut search, at_rate(5.0), queueing()),
            TrialDecision::Continue(at_rate(4.5))
        );
        // Cutting the rate would need a quarter step, below the granularity.
        assert_eq!(
            record(&mut search, at_rate(4.5), queueing()),
            TrialDecision::Stop(StopReason::Converged)
        );
        assert_eq!(search.phase(), SearchPhase::Converged);
    }

    #[test]
    fn loss_limit_stops_the_run() {
        let mut search = search(TuningMode::DisabledChunked, 2);

        assert!(record(&mut search, at_rate(4.0), underfed(3.0)).should_continue());
        assert!(record(&mut search, at_rate(5.0), queueing()).should_continue());
        assert_eq!(
            record(&mut search, at_rate(4.5), queueing()),
            TrialDecision::Stop(StopReason::NoProgress { trials_since_best: 2 })
        );
        assert_eq!(search.phase(), SearchPhase::StoppedNoProgress);

        let (summary, run_table, latency_table) = underfed(9.0);
        let err = search
            .record_trial(at_rate(6.0), summary, run_table, latency_table)
            .unwrap_err();
        assert!(matches!(err, SearchError::Finished { .. }));
    }

    #[test]
    fn loss_limit_of_one_stops_on_first_miss() {
        let mut search = search(TuningMode::DisabledChunked, 1);
        assert!(record(&mut search, at_rate(4.0), underfed(3.0)).should_continue());
        assert!(matches!(
            record(&mut search, at_rate(5.0), underfed(2.0)),
            TrialDecision::Stop(StopReason::NoProgress { .. })
        ));
    }

    #[test]
    fn revisiting_a_point_is_a_dead_end() {
        let mut search = search(TuningMode::DisabledChunked, 5);

        assert!(record(&mut search, at_rate(6.0), underfed(1.0)).should_continue());
        assert_eq!(
            record(&mut search, at_rate(5.0), underfed(4.0)),
            TrialDecision::Continue(at_rate(5.5))
        );
        let point = ParameterPoint::new(48, None, 4.0);
        assert!(record(&mut search, point, queueing()).should_continue());

        // From 4.0 the walk passes the better trial at 5.0 and halves toward
        // the worse one at 6.0, landing back on 5.0.
        assert_eq!(
            record(&mut search, at_rate(4.0), underfed(3.0)),
            TrialDecision::Stop(StopReason::DuplicatePoint(at_rate(5.0)))
        );
        assert_eq!(search.phase(), SearchPhase::DeadEnd);
    }

    #[test]
    fn repeated_point_is_rejected() {
        let mut search = search(TuningMode::DisabledChunked, 5);
        record(&mut search, at_rate(4.0), underfed(3.0));

        let (summary, run_table, latency_table) = underfed(3.0);
        let err = search
            .record_trial(at_rate(4.0), summary, run_table, latency_table)
            .unwrap_err();
        assert!(matches!(err, SearchError::RepeatedPoint { .. }));
        assert_eq!(search.state().len(), 1);
    }

    #[test]
    fn chunked_mode_requires_token_budget() {
        let mut search = search(TuningMode::EnabledChunked, 5);
        let (summary, run_table, latency_table) = underfed(3.0);
        let err = search
            .record_trial(at_rate(4.0), summary, run_table, latency_table)
            .unwrap_err();
        assert!(matches!(err, SearchError::MissingTokenBudget { .. }));
    }

    #[test]
    fn concurrency_is_clamped_to_token_budget() {
        let mut search = search(TuningMode::EnabledChunked, 5);
        let point = ParameterPoint::new(200, Some(208), 4.0);
        let decision = record(&mut search, point, saturated(200, 3.0));

        let next = decision.next_point().cloned().unwrap();
        assert_eq!(next, ParameterPoint::new(208, Some(208), 4.0));
        assert!(next.satisfies_token_bound());
    }

    #[test]
    fn clamping_back_onto_a_tried_point_is_a_dead_end() {
        let mut search = search(TuningMode::EnabledChunked, 5);
        let point = ParameterPoint::new(256, Some(256), 4.0);
        assert_eq!(
            record(&mut search, point.clone(), saturated(256, 3.0)),
            TrialDecision::Stop(StopReason::DuplicatePoint(point))
        );
    }

    #[test]
    fn token_axis_uses_plain_step() {
        let mut search = search(TuningMode::EnabledChunked, 5);
        // Decode headroom without saturation grows the token budget.
        let point = ParameterPoint::new(64, Some(2048), 4.0);
        let decision = record(&mut search, point, saturated(32, 3.0));
        assert_eq!(decision, TrialDecision::Continue(ParameterPoint::new(64, Some(2560), 4.0)));
    }
}
