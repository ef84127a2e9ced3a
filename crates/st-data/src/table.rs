//! The results table: one CSV row per completed trial across all runs.

use csv::WriterBuilder;
use serde::{Deserialize, Serialize};
use st_types::{
    ClientSummary, LatencyBreakdownTable, ParameterPoint, RunKey, RunRow, RunSampleTable,
    TuneResult,
};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use crate::extract::MetricExtractor;
use crate::store::TrialStore;

/// A single results-table row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub model_name: String,
    pub dataset_name: String,
    pub mode: String,
    pub num_prompts: u32,
    pub max_num_seqs: u32,
    pub max_num_batched_tokens: Option<u32>,
    pub request_rate: f64,
    pub max_batch_utils: f64,
    pub mean_block_utils: f64,
    pub max_block_utils: f64,
    pub preempt_ratio: f64,
    pub request_throughput: Option<f64>,
    pub output_token_throughput: Option<f64>,
    pub mean_ttft: Option<f64>,
    pub p99_ttft: Option<f64>,
    pub mean_tpot: Option<f64>,
    pub p99_tpot: Option<f64>,
    /// Milliseconds, rounded.
    pub p99_time_in_queue: f64,
    pub p99_time_context: f64,
    pub p99_time_decoder: f64,
}

impl ResultRow {
    pub fn new(
        run: &RunKey,
        point: &ParameterPoint,
        summary: &ClientSummary,
        run_table: &RunSampleTable,
        latency_table: &LatencyBreakdownTable,
    ) -> Self {
        let max = run_table.row(RunRow::Max);
        let mean = run_table.row(RunRow::Mean);
        let p99 = latency_table.p99();

        Self {
            model_name: run.model.clone(),
            dataset_name: run.dataset.clone(),
            mode: run.mode.as_str().to_string(),
            num_prompts: run.num_prompts,
            max_num_seqs: point.max_num_seqs,
            max_num_batched_tokens: point.max_num_batched_tokens,
            request_rate: point.request_rate,
            max_batch_utils: max.batch_utils,
            mean_block_utils: mean.block_utils,
            max_block_utils: max.block_utils,
            preempt_ratio: max.preempt_ratio,
            request_throughput: summary.request_throughput,
            output_token_throughput: summary.output_token_throughput,
            mean_ttft: summary.mean_ttft_ms,
            p99_ttft: summary.p99_ttft_ms,
            mean_tpot: summary.mean_tpot_ms,
            p99_tpot: summary.p99_tpot_ms,
            p99_time_in_queue: p99.time_in_queue_ms().round(),
            p99_time_context: p99.context_latency_ms().round(),
            p99_time_decoder: p99.per_token_latency_ms().round(),
        }
    }
}

/// Append-only CSV results table.
#[derive(Debug, Clone)]
pub struct ResultsTable {
    path: PathBuf,
}

impl ResultsTable {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row, writing the header first if the table is new or empty.
    pub fn append(&self, row: &ResultRow) -> TuneResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let write_header = file.metadata()?.len() == 0;

        let mut writer = WriterBuilder::new()
            .has_headers(write_header)
            .from_writer(file);
        writer.serialize(row)?;
        writer.flush()?;
        Ok(())
    }

    /// Replace the table with `rows`.
    pub fn write_all(&self, rows: &[ResultRow]) -> TuneResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = WriterBuilder::new().from_path(&self.path)?;
        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn read_all(&self) -> TuneResult<Vec<ResultRow>> {
        let mut reader = csv::Reader::from_path(&self.path)?;
        let mut rows = Vec::new();
        for row in reader.deserialize() {
            rows.push(row?);
        }
        Ok(rows)
    }
}

/// Whether a trial served every prompt of its run. Only complete trials
/// belong in the results table.
pub fn is_complete(summary: &ClientSummary, num_prompts: u32) -> bool {
    summary.successful_requests == Some(f64::from(num_prompts))
}

/// Rebuild result rows from every log in `store`.
///
/// Logs that fail extraction, or whose successful-request count differs from
/// the run's prompt count, are skipped with a warning.
pub fn collect_results(
    store: &TrialStore,
    extractor: &MetricExtractor,
) -> TuneResult<Vec<ResultRow>> {
    let mut rows = Vec::new();

    for stored in store.stored_trials()? {
        let raw = fs::read_to_string(&stored.log_path)?;
        let metrics = match extractor.extract(&raw) {
            Ok(metrics) => metrics,
            Err(e) => {
                tracing::warn!("Skipping {}: {}", stored.log_path.display(), e);
                continue;
            }
        };

        if !is_complete(&metrics.summary, stored.run.num_prompts) {
            tracing::warn!(
                "Skipping {}: {:?} successful requests, expected {}",
                stored.log_path.display(),
                metrics.summary.successful_requests,
                stored.run.num_prompts
            );
            continue;
        }

        rows.push(ResultRow::new(
            &stored.run,
            &stored.point,
            &metrics.summary,
            &metrics.run_table,
            &metrics.latency_table,
        ));
    }

    tracing::info!("Collected {} result rows from {}", rows.len(), store.root().display());
    Ok(rows)
}
