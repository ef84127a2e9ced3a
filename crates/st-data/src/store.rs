use serde::Serialize;
use st_types::{ParameterPoint, RunKey, TuneResult, TuningMode};
use std::fs;
use std::path::{Path, PathBuf};

/// File name of a trial's raw log inside its trial directory.
pub const LOG_FILE: &str = "log.txt";

/// File name of a run's summary inside its run directory.
pub const SUMMARY_FILE: &str = "summary.json";

/// On-disk layout for raw trial logs:
/// `<root>/<model>/<dataset>/<num_prompts>/<mode>/<seqs>_<tokens>_<rate>/log.txt`.
#[derive(Debug, Clone)]
pub struct TrialStore {
    root: PathBuf,
}

/// A trial log found on disk together with the identity parsed from its path.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredTrial {
    pub run: RunKey,
    pub point: ParameterPoint,
    pub log_path: PathBuf,
}

impl TrialStore {
    pub fn new<P: AsRef<Path>>(root: P) -> TuneResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run: &RunKey) -> PathBuf {
        self.root
            .join(&run.model)
            .join(&run.dataset)
            .join(run.num_prompts.to_string())
            .join(run.mode.as_str())
    }

    pub fn trial_dir(&self, run: &RunKey, point: &ParameterPoint) -> PathBuf {
        self.run_dir(run).join(point.label())
    }

    pub fn log_path(&self, run: &RunKey, point: &ParameterPoint) -> PathBuf {
        self.trial_dir(run, point).join(LOG_FILE)
    }

    /// Previously captured log for this trial, if one exists.
    pub fn load(&self, run: &RunKey, point: &ParameterPoint) -> TuneResult<Option<String>> {
        let path = self.log_path(run, point);
        if !path.exists() {
            return Ok(None);
        }
        tracing::debug!("Reusing stored trial log: {}", path.display());
        Ok(Some(fs::read_to_string(path)?))
    }

    pub fn save(&self, run: &RunKey, point: &ParameterPoint, text: &str) -> TuneResult<PathBuf> {
        let dir = self.trial_dir(run, point);
        fs::create_dir_all(&dir)?;
        let path = dir.join(LOG_FILE);
        fs::write(&path, text)?;
        tracing::info!("Saved trial log to {}", path.display());
        Ok(path)
    }

    pub fn save_summary<T: Serialize>(&self, run: &RunKey, summary: &T) -> TuneResult<PathBuf> {
        let dir = self.run_dir(run);
        fs::create_dir_all(&dir)?;
        let path = dir.join(SUMMARY_FILE);
        fs::write(&path, serde_json::to_string_pretty(summary)?)?;
        Ok(path)
    }

    /// Every trial log under the root whose path follows the store layout,
    /// in lexicographic path order.
    pub fn stored_trials(&self) -> TuneResult<Vec<StoredTrial>> {
        let mut logs = Vec::new();
        collect_logs(&self.root, &mut logs)?;
        logs.sort();

        let mut trials = Vec::with_capacity(logs.len());
        for log_path in logs {
            match self.parse_log_path(&log_path) {
                Some((run, point)) => trials.push(StoredTrial { run, point, log_path }),
                None => tracing::warn!(
                    "Ignoring log outside the store layout: {}",
                    log_path.display()
                ),
            }
        }
        Ok(trials)
    }

    fn parse_log_path(&self, path: &Path) -> Option<(RunKey, ParameterPoint)> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<&str> = relative.iter().map(|c| c.to_str()).collect::<Option<_>>()?;
        let [model, dataset, num_prompts, mode, label, file] = parts.as_slice() else {
            return None;
        };
        if *file != LOG_FILE {
            return None;
        }
        let mode = TuningMode::parse(mode)?;
        let run = RunKey::new(*model, *dataset, num_prompts.parse().ok()?, mode);
        let point = ParameterPoint::parse_label(label)?;
        Some((run, point))
    }
}

fn collect_logs(dir: &Path, out: &mut Vec<PathBuf>) -> TuneResult<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_logs(&path, out)?;
        } else if path.file_name().and_then(|n| n.to_str()) == Some(LOG_FILE) {
            out.push(path);
        }
    }
    Ok(())
}
