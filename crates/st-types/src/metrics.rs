//! Typed trial metrics: the client benchmark summary and the two scheduler
//! tables captured from the server log.

use serde::{Deserialize, Serialize};

/// Metrics printed by the benchmark client, keyed by their report label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClientMetric {
    SuccessfulRequests,
    BenchmarkDuration,
    TotalInputTokens,
    TotalGeneratedTokens,
    MeanInputTokens,
    MedianInputTokens,
    MaxInputTokens,
    MeanGeneratedTokens,
    MedianGeneratedTokens,
    MaxGeneratedTokens,
    RequestThroughput,
    InputTokenThroughput,
    OutputTokenThroughput,
    MeanLatency,
    MedianLatency,
    P99Latency,
    MeanTtft,
    MedianTtft,
    P99Ttft,
    MeanTpot,
    MedianTpot,
    P99Tpot,
}

impl ClientMetric {
    pub const ALL: [ClientMetric; 22] = [
        ClientMetric::SuccessfulRequests,
        ClientMetric::BenchmarkDuration,
        ClientMetric::TotalInputTokens,
        ClientMetric::TotalGeneratedTokens,
        ClientMetric::MeanInputTokens,
        ClientMetric::MedianInputTokens,
        ClientMetric::MaxInputTokens,
        ClientMetric::MeanGeneratedTokens,
        ClientMetric::MedianGeneratedTokens,
        ClientMetric::MaxGeneratedTokens,
        ClientMetric::RequestThroughput,
        ClientMetric::InputTokenThroughput,
        ClientMetric::OutputTokenThroughput,
        ClientMetric::MeanLatency,
        ClientMetric::MedianLatency,
        ClientMetric::P99Latency,
        ClientMetric::MeanTtft,
        ClientMetric::MedianTtft,
        ClientMetric::P99Ttft,
        ClientMetric::MeanTpot,
        ClientMetric::MedianTpot,
        ClientMetric::P99Tpot,
    ];

    /// Label as printed by the benchmark client.
    pub fn label(self) -> &'static str {
        match self {
            ClientMetric::SuccessfulRequests => "Successful requests",
            ClientMetric::BenchmarkDuration => "Benchmark duration (s)",
            ClientMetric::TotalInputTokens => "Total input tokens",
            ClientMetric::TotalGeneratedTokens => "Total generated tokens",
            ClientMetric::MeanInputTokens => "Mean input tokens",
            ClientMetric::MedianInputTokens => "Median input tokens",
            ClientMetric::MaxInputTokens => "Max input tokens",
            ClientMetric::MeanGeneratedTokens => "Mean generated tokens",
            ClientMetric::MedianGeneratedTokens => "Median generated tokens",
            ClientMetric::MaxGeneratedTokens => "Max generated tokens",
            ClientMetric::RequestThroughput => "Request throughput (req/s)",
            ClientMetric::InputTokenThroughput => "Input token throughput (tok/s)",
            ClientMetric::OutputTokenThroughput => "Output token throughput (tok/s)",
            ClientMetric::MeanLatency => "Mean Latency (ms)",
            ClientMetric::MedianLatency => "Median Latency (ms)",
            ClientMetric::P99Latency => "P99 Latency (ms)",
            ClientMetric::MeanTtft => "Mean TTFT (ms)",
            ClientMetric::MedianTtft => "Median TTFT (ms)",
            ClientMetric::P99Ttft => "P99 TTFT (ms)",
            ClientMetric::MeanTpot => "Mean TPOT (ms)",
            ClientMetric::MedianTpot => "Median TPOT (ms)",
            ClientMetric::P99Tpot => "P99 TPOT (ms)",
        }
    }
}

/// Client-side benchmark summary. Every field is optional: the client may be
/// cut short, and callers must cope with partial summaries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientSummary {
    pub successful_requests: Option<f64>,
    pub benchmark_duration_s: Option<f64>,
    pub total_input_tokens: Option<f64>,
    pub total_generated_tokens: Option<f64>,
    pub mean_input_tokens: Option<f64>,
    pub median_input_tokens: Option<f64>,
    pub max_input_tokens: Option<f64>,
    pub mean_generated_tokens: Option<f64>,
    pub median_generated_tokens: Option<f64>,
    pub max_generated_tokens: Option<f64>,
    pub request_throughput: Option<f64>,
    pub input_token_throughput: Option<f64>,
    pub output_token_throughput: Option<f64>,
    pub mean_latency_ms: Option<f64>,
    pub median_latency_ms: Option<f64>,
    pub p99_latency_ms: Option<f64>,
    pub mean_ttft_ms: Option<f64>,
    pub median_ttft_ms: Option<f64>,
    pub p99_ttft_ms: Option<f64>,
    pub mean_tpot_ms: Option<f64>,
    pub median_tpot_ms: Option<f64>,
    pub p99_tpot_ms: Option<f64>,
}

impl ClientSummary {
    pub fn get(&self, metric: ClientMetric) -> Option<f64> {
        match metric {
            ClientMetric::SuccessfulRequests => self.successful_requests,
            ClientMetric::BenchmarkDuration => self.benchmark_duration_s,
            ClientMetric::TotalInputTokens => self.total_input_tokens,
            ClientMetric::TotalGeneratedTokens => self.total_generated_tokens,
            ClientMetric::MeanInputTokens => self.mean_input_tokens,
            ClientMetric::MedianInputTokens => self.median_input_tokens,
            ClientMetric::MaxInputTokens => self.max_input_tokens,
            ClientMetric::MeanGeneratedTokens => self.mean_generated_tokens,
            ClientMetric::MedianGeneratedTokens => self.median_generated_tokens,
            ClientMetric::MaxGeneratedTokens => self.max_generated_tokens,
            ClientMetric::RequestThroughput => self.request_throughput,
            ClientMetric::InputTokenThroughput => self.input_token_throughput,
            ClientMetric::OutputTokenThroughput => self.output_token_throughput,
            ClientMetric::MeanLatency => self.mean_latency_ms,
            ClientMetric::MedianLatency => self.median_latency_ms,
            ClientMetric::P99Latency => self.p99_latency_ms,
            ClientMetric::MeanTtft => self.mean_ttft_ms,
            ClientMetric::MedianTtft => self.median_ttft_ms,
            ClientMetric::P99Ttft => self.p99_ttft_ms,
            ClientMetric::MeanTpot => self.mean_tpot_ms,
            ClientMetric::MedianTpot => self.median_tpot_ms,
            ClientMetric::P99Tpot => self.p99_tpot_ms,
        }
    }

    pub fn set(&mut self, metric: ClientMetric, value: f64) {
        let slot = match metric {
            ClientMetric::SuccessfulRequests => &mut self.successful_requests,
            ClientMetric::BenchmarkDuration => &mut self.benchmark_duration_s,
            ClientMetric::TotalInputTokens => &mut self.total_input_tokens,
            ClientMetric::TotalGeneratedTokens => &mut self.total_generated_tokens,
            ClientMetric::MeanInputTokens => &mut self.mean_input_tokens,
            ClientMetric::MedianInputTokens => &mut self.median_input_tokens,
            ClientMetric::MaxInputTokens => &mut self.max_input_tokens,
            ClientMetric::MeanGeneratedTokens => &mut self.mean_generated_tokens,
            ClientMetric::MedianGeneratedTokens => &mut self.median_generated_tokens,
            ClientMetric::MaxGeneratedTokens => &mut self.max_generated_tokens,
            ClientMetric::RequestThroughput => &mut self.request_throughput,
            ClientMetric::InputTokenThroughput => &mut self.input_token_throughput,
            ClientMetric::OutputTokenThroughput => &mut self.output_token_throughput,
            ClientMetric::MeanLatency => &mut self.mean_latency_ms,
            ClientMetric::MedianLatency => &mut self.median_latency_ms,
            ClientMetric::P99Latency => &mut self.p99_latency_ms,
            ClientMetric::MeanTtft => &mut self.mean_ttft_ms,
            ClientMetric::MedianTtft => &mut self.median_ttft_ms,
            ClientMetric::P99Ttft => &mut self.p99_ttft_ms,
            ClientMetric::MeanTpot => &mut self.mean_tpot_ms,
            ClientMetric::MedianTpot => &mut self.median_tpot_ms,
            ClientMetric::P99Tpot => &mut self.p99_tpot_ms,
        };
        *slot = Some(value);
    }

    /// Number of metrics present.
    pub fn len(&self) -> usize {
        ClientMetric::ALL
            .iter()
            .filter(|m| self.get(**m).is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Scheduler run-state samples
// ---------------------------------------------------------------------------

/// Aggregation rows of the run-state table, in log order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunRow {
    Max,
    Mean,
    Min,
}

impl RunRow {
    pub const ALL: [RunRow; 3] = [RunRow::Max, RunRow::Mean, RunRow::Min];
}

/// One aggregated row of periodic scheduler snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSample {
    pub waiting: f64,
    pub running: f64,
    pub swapped: f64,
    pub wait_to_run_reqs: f64,
    pub run_to_wait_reqs: f64,
    pub wait_to_run_tokens: f64,
    /// Fraction of the batch in use (0 to 1).
    pub batch_utils: f64,
    /// Fraction of KV-cache blocks in use (0 to 1).
    pub block_utils: f64,
    pub preempt_ratio: f64,
}

impl RunSample {
    pub const COLUMNS: usize = 9;

    pub fn from_fields(f: [f64; Self::COLUMNS]) -> Self {
        Self {
            waiting: f[0],
            running: f[1],
            swapped: f[2],
            wait_to_run_reqs: f[3],
            run_to_wait_reqs: f[4],
            wait_to_run_tokens: f[5],
            batch_utils: f[6],
            block_utils: f[7],
            preempt_ratio: f[8],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSampleTable {
    rows: [RunSample; 3],
}

impl RunSampleTable {
    /// Build from rows in `RunRow::ALL` order.
    pub fn new(rows: [RunSample; 3]) -> Self {
        Self { rows }
    }

    pub fn row(&self, row: RunRow) -> &RunSample {
        match row {
            RunRow::Max => &self.rows[0],
            RunRow::Mean => &self.rows[1],
            RunRow::Min => &self.rows[2],
        }
    }

    pub fn max_batch_utils_pct(&self) -> f64 {
        self.row(RunRow::Max).batch_utils * 100.0
    }

    pub fn max_block_utils_pct(&self) -> f64 {
        self.row(RunRow::Max).block_utils * 100.0
    }

    pub fn max_running(&self) -> f64 {
        self.row(RunRow::Max).running
    }
}

// ---------------------------------------------------------------------------
// Scheduler latency breakdown
// ---------------------------------------------------------------------------

/// Aggregation rows of the latency breakdown table, in log order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LatencyRow {
    Sum,
    Max,
    Mean,
    Min,
    P99,
}

impl LatencyRow {
    pub const ALL: [LatencyRow; 5] = [
        LatencyRow::Sum,
        LatencyRow::Max,
        LatencyRow::Mean,
        LatencyRow::Min,
        LatencyRow::P99,
    ];
}

/// Per-request latency components in seconds, as the scheduler logs them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySample {
    pub ttft_s: f64,
    pub time_in_queue_s: f64,
    pub context_latency_s: f64,
    pub decoder_latency_s: f64,
    pub per_token_latency_s: f64,
    pub decoder_tokens: f64,
}

impl LatencySample {
    pub const COLUMNS: usize = 6;

    pub fn from_fields(f: [f64; Self::COLUMNS]) -> Self {
        Self {
            ttft_s: f[0],
            time_in_queue_s: f[1],
            context_latency_s: f[2],
            decoder_latency_s: f[3],
            per_token_latency_s: f[4],
            decoder_tokens: f[5],
        }
    }

    pub fn time_in_queue_ms(&self) -> f64 {
        self.time_in_queue_s * 1000.0
    }

    pub fn context_latency_ms(&self) -> f64 {
        self.context_latency_s * 1000.0
    }

    pub fn per_token_latency_ms(&self) -> f64 {
        self.per_token_latency_s * 1000.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyBreakdownTable {
    rows: [LatencySample; 5],
}

impl LatencyBreakdownTable {
    /// Build from rows in `LatencyRow::ALL` order.
    pub fn new(rows: [LatencySample; 5]) -> Self {
        Self { rows }
    }

    pub fn row(&self, row: LatencyRow) -> &LatencySample {
        match row {
            LatencyRow::Sum => &self.rows[0],
            LatencyRow::Max => &self.rows[1],
            LatencyRow::Mean => &self.rows[2],
            LatencyRow::Min => &self.rows[3],
            LatencyRow::P99 => &self.rows[4],
        }
    }

    pub fn p99(&self) -> &LatencySample {
        self.row(LatencyRow::P99)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_get_set_cover_every_metric() {
        let mut summary = ClientSummary::default();
        assert!(summary.is_empty());

        for (i, metric) in ClientMetric::ALL.iter().enumerate() {
            summary.set(*metric, i as f64);
        }
        assert_eq!(summary.len(), ClientMetric::ALL.len());
        for (i, metric) in ClientMetric::ALL.iter().enumerate() {
            assert_eq!(summary.get(*metric), Some(i as f64));
        }
    }

    #[test]
    fn labels_do_not_shadow_each_other() {
        // Extraction matches labels by substring, so no label may contain another.
        for a in ClientMetric::ALL {
            for b in ClientMetric::ALL {
                if a != b {
                    assert!(!a.label().contains(b.label()), "{:?} contains {:?}", a, b);
                }
            }
        }
    }

    #[test]
    fn tables_expose_rows_by_label() {
        let max = RunSample {
            running: 48.0,
            batch_utils: 0.75,
            ..Default::default()
        };
        let table = RunSampleTable::new([max, RunSample::default(), RunSample::default()]);
        assert_eq!(table.max_running(), 48.0);
        assert_eq!(table.max_batch_utils_pct(), 75.0);

        let mut rows = [LatencySample::default(); 5];
        rows[4].time_in_queue_s = 2.2;
        let latency = LatencyBreakdownTable::new(rows);
        assert!((latency.p99().time_in_queue_ms() - 2200.0).abs() < 1e-9);
        assert_eq!(latency.row(LatencyRow::Sum).time_in_queue_s, 0.0);
    }
}
