//! The tuning loop: drive trials, feed the search, persist what happened.

use st_data::{
    collect_results, is_complete, ExtractorConfig, MetricExtractor, ResultRow, ResultsTable,
    TrialMetrics, TrialStore,
};
use st_driver::ExperimentDriver;
use st_optimizer::{DirectionalSearch, RunStatus, TrialDecision};
use st_types::{internal_error, ParameterPoint, RunKey, TuneError, TuneResult};
use std::path::Path;
use tracing::{info, warn};

use crate::config::AppConfig;

/// Result of trying to obtain one trial's metrics.
enum TrialOutcome {
    Extracted(TrialMetrics),
    /// The driver failed or its log could not be extracted. Nothing was stored.
    Failed(TuneError),
}

/// Runs the closed loop for every configured run.
pub struct Tuner {
    config: AppConfig,
    driver: Box<dyn ExperimentDriver>,
    store: TrialStore,
    table: ResultsTable,
    extractor: MetricExtractor,
}

impl Tuner {
    pub fn new(config: AppConfig, driver: Box<dyn ExperimentDriver>) -> TuneResult<Self> {
        config.validate()?;
        let store = TrialStore::new(&config.output_dir)?;
        let table = ResultsTable::new(&config.results_table);
        let extractor = MetricExtractor::new(&config.extractor)?;
        info!(
            driver = driver.name(),
            output_dir = %config.output_dir.display(),
            "Created tuner"
        );

        Ok(Self {
            config,
            driver,
            store,
            table,
            extractor,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &TrialStore {
        &self.store
    }

    /// Tune every run in order. A run that fails does not stop the ones
    /// after it; only storage errors abort.
    pub async fn run_all(&mut self) -> TuneResult<Vec<RunStatus>> {
        let runs = self.config.runs();
        info!(runs = runs.len(), "Starting tuning");

        let mut statuses = Vec::with_capacity(runs.len());
        for run in &runs {
            statuses.push(self.tune(run).await?);
        }
        Ok(statuses)
    }

    /// Tune a single run until the search stops or a trial fails.
    pub async fn tune(&mut self, run: &RunKey) -> TuneResult<RunStatus> {
        let mut status = RunStatus::new(run.clone());
        let mut search = DirectionalSearch::new(self.config.search_config(run.mode)?)?;
        status.mark_running();
        info!(%run, "Starting run");

        let mut point = search.seed();
        loop {
            let metrics = match self.trial_metrics(run, &point).await? {
                TrialOutcome::Extracted(metrics) => metrics,
                TrialOutcome::Failed(e) => {
                    warn!(%run, %point, "Trial failed, ending run: {}", e);
                    status.mark_failed(e.to_string());
                    break;
                }
            };

            let successful_requests = metrics.summary.successful_requests;
            let row = is_complete(&metrics.summary, run.num_prompts).then(|| {
                ResultRow::new(
                    run,
                    &point,
                    &metrics.summary,
                    &metrics.run_table,
                    &metrics.latency_table,
                )
            });
            let decision = match search.record_trial(
                point.clone(),
                metrics.summary,
                metrics.run_table,
                metrics.latency_table,
            ) {
                Ok(decision) => decision,
                Err(e) => {
                    warn!(%run, %point, "Search rejected trial: {}", e);
                    status.mark_failed(e.to_string());
                    break;
                }
            };
            let trial = search
                .state()
                .last()
                .ok_or_else(|| internal_error!("trial at {} missing from search history", point))?;
            status.record(trial);

            match row {
                Some(row) => self.table.append(&row)?,
                None => warn!(
                    %run,
                    %point,
                    ?successful_requests,
                    expected = run.num_prompts,
                    "Incomplete trial left out of the results table"
                ),
            }

            match decision {
                TrialDecision::Continue(next) => point = next,
                TrialDecision::Stop(reason) => {
                    info!(%run, trials = status.trials_completed, %reason, "Run finished");
                    status.mark_completed(reason);
                    break;
                }
            }
        }

        match &status.best_trial {
            Some(best) => info!(
                %run,
                point = %best.point,
                request_throughput = best.request_throughput,
                "Best parameters"
            ),
            None => warn!(%run, "No trial met the SLA"),
        }
        self.store.save_summary(run, &status)?;
        Ok(status)
    }

    /// Metrics for `point`, from its stored log when that still extracts,
    /// otherwise from a fresh trial. A fresh log is stored only once it has
    /// extracted cleanly. Storage errors are the outer error.
    async fn trial_metrics(
        &mut self,
        run: &RunKey,
        point: &ParameterPoint,
    ) -> TuneResult<TrialOutcome> {
        if let Some(raw) = self.store.load(run, point)? {
            match self.extractor.extract(&raw) {
                Ok(metrics) => return Ok(TrialOutcome::Extracted(metrics)),
                Err(e) => warn!(%point, "Stored trial log is unusable, running again: {}", e),
            }
        }

        let raw = match self.driver.run_trial(run, point).await {
            Ok(raw) => raw,
            Err(e) => return Ok(TrialOutcome::Failed(e.into())),
        };
        let metrics = match self.extractor.extract(&raw) {
            Ok(metrics) => metrics,
            Err(e) => return Ok(TrialOutcome::Failed(e.into())),
        };
        self.store.save(run, point, &raw)?;
        Ok(TrialOutcome::Extracted(metrics))
    }
}

/// Rebuild the results table from every log under `output_dir`. Returns the
/// number of rows written.
pub fn collect<P: AsRef<Path>, Q: AsRef<Path>>(
    output_dir: P,
    table_path: Q,
    extractor: &ExtractorConfig,
) -> TuneResult<usize> {
    let store = TrialStore::new(output_dir)?;
    let extractor = MetricExtractor::new(extractor)?;
    let rows = collect_results(&store, &extractor)?;

    let table = ResultsTable::new(table_path);
    table.write_all(&rows)?;
    info!(rows = rows.len(), table = %table.path().display(), "Collected results");
    Ok(rows.len())
}
