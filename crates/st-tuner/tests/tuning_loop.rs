use async_trait::async_trait;
use st_data::{ResultsTable, TrialStore, SUMMARY_FILE};
use st_driver::ExperimentDriver;
use st_optimizer::{RunState, RunStatus, StopReason};
use st_tuner::{collect, AppConfig, Tuner};
use st_types::{DriverError, DriverResult, ParameterPoint, RunKey, TuningMode};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Rate the simulated engine sustains before its queue blows up.
const CAPACITY: f64 = 6.0;

fn config(dir: &Path) -> AppConfig {
    config_with_datasets(dir, &["toy"])
}

fn config_with_datasets(dir: &Path, datasets: &[&str]) -> AppConfig {
    let datasets: String = datasets
        .iter()
        .map(|name| format!("  {name}:\n    path: /data/{name}.json\n"))
        .collect();
    let yaml = format!(
        r#"
models:
  tiny:
    path: /models/tiny
datasets:
{datasets}num_prompts: 100
modes: [disabled_chunked]
tuning:
  disabled_chunked:
    max_num_seqs: {{ default: 64, granularity: 1, step: 16, bounds: [8, 256] }}
    request_rate: {{ default: 4, granularity: 0.5, step: 1, bounds: [0.5, 16] }}
output_dir: {out}
results_table: {table}
"#,
        out = dir.join("output").display(),
        table = dir.join("results.csv").display()
    );
    AppConfig::from_yaml_str(&yaml).unwrap()
}

/// Trial log of an engine that keeps up until the rate passes `CAPACITY`,
/// with the batch never more than a third full.
fn simulated_log(point: &ParameterPoint) -> String {
    simulated_log_with_successes(point, 100)
}

fn simulated_log_with_successes(point: &ParameterPoint, successful: u32) -> String {
    let overloaded = point.request_rate > CAPACITY;
    let throughput = point.request_rate.min(CAPACITY) * 0.98;
    let (ttft, queue_s) = if overloaded { (2600.0, 2.3) } else { (800.0, 0.2) };

    format!(
        "\
============ Serving Benchmark Result ============
Successful requests:                     {successful}
Total input tokens:                      21,500
Total generated tokens:                  18,200
Request throughput (req/s):              {throughput:.2}
Mean TTFT (ms):                          310.00
P99 TTFT (ms):                           {ttft:.2}
Mean TPOT (ms):                          41.00
P99 TPOT (ms):                           60.00
==================================================

data split
INFO 06-12 10:31:02 scheduler.py:116] vLLM scheduler profiling save...
INFO 06-12 10:31:02 scheduler.py:117] Max  4 20 0 3 0 1,024 0.30 0.25 0.00
INFO 06-12 10:31:02 scheduler.py:117] Mean 1.5 11.2 0 1.2 0 312.4 0.18 0.14 0.00
INFO 06-12 10:31:02 scheduler.py:117] Min  0 1 0 0 0 0 0.02 0.01 0.00
INFO 06-12 10:31:02 scheduler.py:118] Sum  120.5 80.2 9.1 412.8 4.1 18,200
INFO 06-12 10:31:02 scheduler.py:118] Max  {queue_max:.2} {queue_max:.2} 0.15 9.7 0.070 512
INFO 06-12 10:31:02 scheduler.py:118] Mean 0.9 0.3 0.05 4.1 0.041 182
INFO 06-12 10:31:02 scheduler.py:118] Min  0.05 0.0 0.01 0.2 0.018 1
INFO 06-12 10:31:02 scheduler.py:118] P99  {queue_s:.2} {queue_s:.2} 0.10 8.3 0.060 480
INFO:     127.0.0.1:40312 - \"POST /v1/completions HTTP/1.1\" 200 OK
",
        queue_max = queue_s + 0.2,
    )
}

struct SimulatedDriver {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ExperimentDriver for SimulatedDriver {
    async fn run_trial(&mut self, _run: &RunKey, point: &ParameterPoint) -> DriverResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(simulated_log(point))
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

/// Drops the last run-sample row, as when the engine dies mid-profile.
fn truncated(log: &str) -> String {
    log.lines()
        .filter(|line| !line.contains("scheduler.py:117] Min"))
        .map(|line| format!("{line}\n"))
        .collect()
}

type Script = Box<dyn Fn(&RunKey, &ParameterPoint, usize) -> String + Send + Sync>;

/// Returns whatever `script` makes of the run, the point and the call index.
struct ScriptedDriver {
    calls: Arc<AtomicUsize>,
    script: Script,
}

#[async_trait]
impl ExperimentDriver for ScriptedDriver {
    async fn run_trial(&mut self, run: &RunKey, point: &ParameterPoint) -> DriverResult<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok((self.script)(run, point, call))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

struct BrokenDriver;

#[async_trait]
impl ExperimentDriver for BrokenDriver {
    async fn run_trial(&mut self, _run: &RunKey, _point: &ParameterPoint) -> DriverResult<String> {
        Err(DriverError::Timeout {
            marker: "Uvicorn running on".to_string(),
            waited_secs: 60,
        })
    }

    fn name(&self) -> &str {
        "broken"
    }
}

fn run_key() -> RunKey {
    RunKey::new("tiny", "toy", 100, TuningMode::DisabledChunked)
}

fn seed_point() -> ParameterPoint {
    ParameterPoint::new(64, None, 4.0)
}

#[tokio::test]
async fn search_climbs_to_capacity_and_converges() {
    let temp = TempDir::new().unwrap();
    let config = config(temp.path());
    let calls = Arc::new(AtomicUsize::new(0));
    let driver = SimulatedDriver {
        calls: calls.clone(),
    };

    let mut tuner = Tuner::new(config.clone(), Box::new(driver)).unwrap();
    let statuses = tuner.run_all().await.unwrap();

    assert_eq!(statuses.len(), 1);
    let status = &statuses[0];
    assert_eq!(status.state, RunState::Completed);
    assert_eq!(status.stop_reason, Some(StopReason::Converged));
    // 4 -> 5 -> 7 (overloaded) -> 6 -> 6.5 (overloaded), then the step halves
    // below the rate granularity.
    assert_eq!(status.trials_completed, 5);
    assert_eq!(calls.load(Ordering::SeqCst), 5);

    let best = status.best_trial.as_ref().unwrap();
    assert_eq!(best.point, ParameterPoint::new(64, None, 6.0));
    assert!((best.request_throughput - 5.88).abs() < 1e-9);

    let rows = ResultsTable::new(&config.results_table).read_all().unwrap();
    let rates: Vec<f64> = rows.iter().map(|r| r.request_rate).collect();
    assert_eq!(rates, vec![4.0, 5.0, 7.0, 6.0, 6.5]);
    assert!(rows.iter().all(|r| r.mode == "disable_chunked"));

    let summary_path = tuner.store().run_dir(&run_key()).join(SUMMARY_FILE);
    let saved: RunStatus =
        serde_json::from_str(&std::fs::read_to_string(summary_path).unwrap()).unwrap();
    assert_eq!(&saved, status);
}

#[tokio::test]
async fn stored_logs_are_reused() {
    let temp = TempDir::new().unwrap();
    let config = config(temp.path());

    let first_calls = Arc::new(AtomicUsize::new(0));
    let mut first = Tuner::new(
        config.clone(),
        Box::new(SimulatedDriver {
            calls: first_calls.clone(),
        }),
    )
    .unwrap();
    let first_status = first.run_all().await.unwrap().remove(0);

    let second_calls = Arc::new(AtomicUsize::new(0));
    let mut second = Tuner::new(
        config,
        Box::new(SimulatedDriver {
            calls: second_calls.clone(),
        }),
    )
    .unwrap();
    let second_status = second.run_all().await.unwrap().remove(0);

    assert_eq!(first_calls.load(Ordering::SeqCst), 5);
    assert_eq!(second_calls.load(Ordering::SeqCst), 0);
    assert_eq!(second_status.best_trial, first_status.best_trial);
    assert_eq!(second_status.stop_reason, first_status.stop_reason);
}

#[tokio::test]
async fn failed_trial_ends_the_run() {
    let temp = TempDir::new().unwrap();
    let config = config(temp.path());

    let mut tuner = Tuner::new(config.clone(), Box::new(BrokenDriver)).unwrap();
    let status = tokio::time::timeout(Duration::from_secs(5), tuner.run_all())
        .await
        .unwrap()
        .unwrap()
        .remove(0);

    assert_eq!(status.state, RunState::Failed);
    assert_eq!(status.trials_completed, 0);
    assert_eq!(status.trials_failed, 1);
    assert!(status.error.as_deref().unwrap().contains("Uvicorn running on"));
    assert!(status.best_trial.is_none());
    assert!(tuner.store().run_dir(&run_key()).join(SUMMARY_FILE).exists());
    assert!(!config.results_table.exists());
}

#[tokio::test]
async fn unusable_log_is_not_stored() {
    let temp = TempDir::new().unwrap();
    let config = config(temp.path());

    let first_calls = Arc::new(AtomicUsize::new(0));
    let driver = ScriptedDriver {
        calls: first_calls.clone(),
        script: Box::new(|_, point, call| {
            let log = simulated_log(point);
            if call == 0 {
                truncated(&log)
            } else {
                log
            }
        }),
    };
    let mut first = Tuner::new(config.clone(), Box::new(driver)).unwrap();
    let status = first.run_all().await.unwrap().remove(0);

    assert_eq!(status.state, RunState::Failed);
    assert_eq!(status.trials_completed, 0);
    assert_eq!(status.trials_failed, 1);
    assert_eq!(first_calls.load(Ordering::SeqCst), 1);
    assert!(first.store().load(&run_key(), &seed_point()).unwrap().is_none());
    assert!(!config.results_table.exists());

    // Nothing bad was kept, so the next invocation starts from a real trial.
    let second_calls = Arc::new(AtomicUsize::new(0));
    let driver = SimulatedDriver {
        calls: second_calls.clone(),
    };
    let mut second = Tuner::new(config, Box::new(driver)).unwrap();
    let status = second.run_all().await.unwrap().remove(0);

    assert_eq!(status.state, RunState::Completed);
    assert_eq!(status.trials_completed, 5);
    assert_eq!(second_calls.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn unusable_stored_log_is_run_again() {
    let temp = TempDir::new().unwrap();
    let config = config(temp.path());
    let store = TrialStore::new(&config.output_dir).unwrap();
    store
        .save(&run_key(), &seed_point(), &truncated(&simulated_log(&seed_point())))
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let driver = SimulatedDriver {
        calls: calls.clone(),
    };
    let mut tuner = Tuner::new(config, Box::new(driver)).unwrap();
    let status = tuner.run_all().await.unwrap().remove(0);

    assert_eq!(status.state, RunState::Completed);
    assert_eq!(status.trials_completed, 5);
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(
        store.load(&run_key(), &seed_point()).unwrap().as_deref(),
        Some(simulated_log(&seed_point()).as_str())
    );
}

#[tokio::test]
async fn extraction_failure_ends_only_its_run() {
    let temp = TempDir::new().unwrap();
    let config = config_with_datasets(temp.path(), &["alpha", "beta"]);

    let driver = ScriptedDriver {
        calls: Arc::new(AtomicUsize::new(0)),
        script: Box::new(|run, point, _| {
            let log = simulated_log(point);
            if run.dataset == "alpha" {
                truncated(&log)
            } else {
                log
            }
        }),
    };
    let mut tuner = Tuner::new(config.clone(), Box::new(driver)).unwrap();
    let statuses = tuner.run_all().await.unwrap();

    assert_eq!(statuses.len(), 2);
    let alpha = &statuses[0];
    assert_eq!(alpha.run.dataset, "alpha");
    assert_eq!(alpha.state, RunState::Failed);
    assert_eq!(alpha.trials_completed, 0);
    assert_eq!(alpha.trials_failed, 1);
    let error = alpha.error.as_deref().unwrap();
    assert!(error.contains("expected 3 'run samples' rows, found 2"), "{error}");
    assert!(alpha.best_trial.is_none());

    let beta = &statuses[1];
    assert_eq!(beta.run.dataset, "beta");
    assert_eq!(beta.state, RunState::Completed);
    assert_eq!(beta.trials_completed, 5);

    let rows = ResultsTable::new(&config.results_table).read_all().unwrap();
    assert_eq!(rows.len(), 5);
    assert!(rows.iter().all(|r| r.dataset_name == "beta"));
}

#[tokio::test]
async fn incomplete_trials_stay_out_of_the_table() {
    let temp = TempDir::new().unwrap();
    let config = config(temp.path());

    let driver = ScriptedDriver {
        calls: Arc::new(AtomicUsize::new(0)),
        script: Box::new(|_, point, _| {
            let successful = if point.request_rate > 5.0 { 90 } else { 100 };
            simulated_log_with_successes(point, successful)
        }),
    };
    let mut tuner = Tuner::new(config.clone(), Box::new(driver)).unwrap();
    let status = tuner.run_all().await.unwrap().remove(0);

    // The search still sees every trial.
    assert_eq!(status.state, RunState::Completed);
    assert_eq!(status.trials_completed, 5);

    let by_rate = |mut rows: Vec<st_data::ResultRow>| {
        rows.sort_by(|a, b| a.request_rate.total_cmp(&b.request_rate));
        rows
    };
    let tuned = by_rate(ResultsTable::new(&config.results_table).read_all().unwrap());
    let rates: Vec<f64> = tuned.iter().map(|r| r.request_rate).collect();
    assert_eq!(rates, vec![4.0, 5.0]);

    let collected_path = temp.path().join("collected.csv");
    let written = collect(&config.output_dir, &collected_path, &config.extractor).unwrap();
    assert_eq!(written, 2);
    let collected = by_rate(ResultsTable::new(&collected_path).read_all().unwrap());
    assert_eq!(collected, tuned);
}
