//! Trial log extraction.
//!
//! A trial log is the benchmark client's report, a [`DATA_SPLIT`] line, and
//! the scheduler statistics the server printed after a profiling save. The
//! server statistics come as two small fixed-shape tables whose rows are
//! matched positionally.

use regex::Regex;
use serde::{Deserialize, Serialize};
use st_types::{
    ClientMetric, ClientSummary, ExtractError, LatencyBreakdownTable, LatencyRow, LatencySample,
    RunRow, RunSample, RunSampleTable,
};

/// Line separating the client section from the server section.
pub const DATA_SPLIT: &str = "data split";

/// Logger prefix of the scheduler's run-state summary lines.
pub const DEFAULT_RUN_MARKER: &str = "scheduler.py:117]";

/// Logger prefix of the scheduler's latency breakdown lines.
pub const DEFAULT_LATENCY_MARKER: &str = "scheduler.py:118]";

const NUMERAL: &str = r"([\d.,]+)";

/// Source markers used to anchor the server-side patterns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    pub run_marker: String,
    pub latency_marker: String,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            run_marker: DEFAULT_RUN_MARKER.to_string(),
            latency_marker: DEFAULT_LATENCY_MARKER.to_string(),
        }
    }
}

/// Everything extracted from one trial log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialMetrics {
    pub summary: ClientSummary,
    pub run_table: RunSampleTable,
    pub latency_table: LatencyBreakdownTable,
}

/// Parses raw trial text into typed metrics.
#[derive(Debug, Clone)]
pub struct MetricExtractor {
    run_pattern: Regex,
    latency_pattern: Regex,
}

impl MetricExtractor {
    pub fn new(config: &ExtractorConfig) -> Result<Self, ExtractError> {
        let run_pattern =
            Self::row_pattern(&config.run_marker, "Max|Mean|Min", RunSample::COLUMNS)?;
        let latency_pattern = Self::row_pattern(
            &config.latency_marker,
            "Sum|Max|Mean|Min|P99",
            LatencySample::COLUMNS,
        )?;
        Ok(Self {
            run_pattern,
            latency_pattern,
        })
    }

    fn row_pattern(marker: &str, rows: &str, columns: usize) -> Result<Regex, ExtractError> {
        let fields = vec![NUMERAL; columns].join(r"\s+");
        let pattern = format!(r"{}\s(?:{})\s+{}", regex::escape(marker), rows, fields);
        Regex::new(&pattern).map_err(|e| ExtractError::Pattern {
            message: format!("{pattern}: {e}"),
        })
    }

    /// Extract client summary and scheduler tables from one trial log.
    pub fn extract(&self, raw: &str) -> Result<TrialMetrics, ExtractError> {
        let (client, server) = split_sections(raw)?;

        let summary = parse_client_section(client)?;
        if summary.is_empty() {
            return Err(ExtractError::EmptyClientSection);
        }

        let run_rows: Vec<[f64; RunSample::COLUMNS]> =
            collect_rows(&self.run_pattern, server, "run samples", RunRow::ALL.len())?;
        let latency_rows: Vec<[f64; LatencySample::COLUMNS]> = collect_rows(
            &self.latency_pattern,
            server,
            "latency breakdown",
            LatencyRow::ALL.len(),
        )?;

        let run_table = RunSampleTable::new([
            RunSample::from_fields(run_rows[0]),
            RunSample::from_fields(run_rows[1]),
            RunSample::from_fields(run_rows[2]),
        ]);
        let latency_table = LatencyBreakdownTable::new([
            LatencySample::from_fields(latency_rows[0]),
            LatencySample::from_fields(latency_rows[1]),
            LatencySample::from_fields(latency_rows[2]),
            LatencySample::from_fields(latency_rows[3]),
            LatencySample::from_fields(latency_rows[4]),
        ]);

        Ok(TrialMetrics {
            summary,
            run_table,
            latency_table,
        })
    }
}

fn split_sections(raw: &str) -> Result<(&str, &str), ExtractError> {
    let count = raw.matches(DATA_SPLIT).count();
    if count > 1 {
        return Err(ExtractError::RepeatedDelimiter {
            delimiter: DATA_SPLIT.to_string(),
            count,
        });
    }
    raw.split_once(DATA_SPLIT)
        .ok_or_else(|| ExtractError::MissingDelimiter {
            delimiter: DATA_SPLIT.to_string(),
        })
}

fn parse_client_section(client: &str) -> Result<ClientSummary, ExtractError> {
    let mut summary = ClientSummary::default();
    for line in client.lines() {
        for metric in ClientMetric::ALL {
            if !line.contains(metric.label()) {
                continue;
            }
            let raw = line.rsplit(':').next().unwrap_or(line);
            summary.set(metric, parse_number(metric.label(), raw)?);
        }
    }
    Ok(summary)
}

fn collect_rows<const N: usize>(
    pattern: &Regex,
    server: &str,
    table: &str,
    expected: usize,
) -> Result<Vec<[f64; N]>, ExtractError> {
    let mut rows = Vec::with_capacity(expected);
    for captures in pattern.captures_iter(server) {
        let mut fields = [0.0; N];
        for (i, field) in fields.iter_mut().enumerate() {
            let raw = captures.get(i + 1).map_or("", |m| m.as_str());
            *field = parse_number(table, raw)?;
        }
        rows.push(fields);
    }

    if rows.len() != expected {
        return Err(ExtractError::RowCountMismatch {
            table: table.to_string(),
            expected,
            found: rows.len(),
        });
    }
    Ok(rows)
}

/// Parse a numeral, ignoring whitespace and `,` grouping separators.
pub fn parse_number(field: &str, raw: &str) -> Result<f64, ExtractError> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',')
        .collect();
    cleaned.parse::<f64>().map_err(|_| ExtractError::InvalidNumber {
        field: field.to_string(),
        raw: raw.trim().to_string(),
    })
}
