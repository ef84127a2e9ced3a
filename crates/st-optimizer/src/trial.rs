//! Trial tracking and optimization run management.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use st_types::{ClientSummary, LatencyBreakdownTable, ParameterPoint, RunKey, RunSampleTable};
use uuid::Uuid;

use crate::evaluate::Fitness;
use crate::heuristics::{Bottleneck, Direction};
use crate::search::StopReason;

/// Unique optimization run identifier.
pub type RunId = Uuid;

/// One evaluated point. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: Uuid,
    pub trial_number: usize,
    pub point: ParameterPoint,
    pub summary: ClientSummary,
    pub run_table: RunSampleTable,
    pub latency_table: LatencyBreakdownTable,
    pub fitness: Fitness,
    /// Classification behind `direction`; `None` when the previous trial's
    /// direction was reused after a regression.
    pub bottleneck: Option<Bottleneck>,
    pub direction: Direction,
    pub recorded_at: DateTime<Utc>,
}

impl Trial {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        trial_number: usize,
        point: ParameterPoint,
        summary: ClientSummary,
        run_table: RunSampleTable,
        latency_table: LatencyBreakdownTable,
        fitness: Fitness,
        bottleneck: Option<Bottleneck>,
        direction: Direction,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            trial_number,
            point,
            summary,
            run_table,
            latency_table,
            fitness,
            bottleneck,
            direction,
            recorded_at: Utc::now(),
        }
    }
}

/// Ordered trial history plus best-so-far bookkeeping for one run.
#[derive(Debug, Clone, Default)]
pub struct SearchState {
    trials: Vec<Trial>,
    best_index: Option<usize>,
    trials_since_best: usize,
}

impl SearchState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trials(&self) -> &[Trial] {
        &self.trials
    }

    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }

    pub fn last(&self) -> Option<&Trial> {
        self.trials.last()
    }

    pub fn best(&self) -> Option<&Trial> {
        self.best_index.map(|i| &self.trials[i])
    }

    pub fn best_fitness(&self) -> Fitness {
        self.best().map_or(Fitness::Infeasible, |t| t.fitness)
    }

    /// Trials recorded since the current best without improving on it.
    pub fn trials_since_best(&self) -> usize {
        self.trials_since_best
    }

    pub fn contains(&self, point: &ParameterPoint) -> bool {
        self.trials.iter().any(|t| &t.point == point)
    }

    /// Append `trial` and update the best. Returns true on a new best.
    pub(crate) fn push(&mut self, trial: Trial) -> bool {
        let fitness = trial.fitness;
        self.trials.push(trial);

        if fitness > self.best_fitness() {
            self.best_index = Some(self.trials.len() - 1);
            self.trials_since_best = 0;
            true
        } else {
            if self.best_index.is_some() {
                self.trials_since_best += 1;
            }
            false
        }
    }
}

/// Lifecycle state for an optimization run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Best trial of a run as reported in its summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestTrial {
    pub trial_number: usize,
    pub point: ParameterPoint,
    pub request_throughput: f64,
}

/// Aggregate status of an optimization run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub id: RunId,
    pub run: RunKey,
    pub state: RunState,
    pub trials_completed: usize,
    pub trials_failed: usize,
    pub best_trial: Option<BestTrial>,
    pub stop_reason: Option<StopReason>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl RunStatus {
    pub fn new(run: RunKey) -> Self {
        Self {
            id: Uuid::new_v4(),
            run,
            state: RunState::Pending,
            trials_completed: 0,
            trials_failed: 0,
            best_trial: None,
            stop_reason: None,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.state = RunState::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self, reason: StopReason) {
        self.state = RunState::Completed;
        self.finished_at = Some(Utc::now());
        self.stop_reason = Some(reason);
    }

    pub fn mark_failed(&mut self, error: String) {
        self.state = RunState::Failed;
        self.finished_at = Some(Utc::now());
        self.trials_failed += 1;
        self.error = Some(error);
    }

    /// Count a recorded trial and update the best if it improves on it.
    pub fn record(&mut self, trial: &Trial) {
        self.trials_completed += 1;

        let Some(throughput) = trial.fitness.throughput() else {
            return;
        };
        let improves = self
            .best_trial
            .as_ref()
            .map_or(true, |best| throughput > best.request_throughput);
        if improves {
            self.best_trial = Some(BestTrial {
                trial_number: trial.trial_number,
                point: trial.point.clone(),
                request_throughput: throughput,
            });
        }
    }
}
