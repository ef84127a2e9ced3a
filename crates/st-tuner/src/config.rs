//! Top-level tuning configuration, loaded from YAML.

use serde::{Deserialize, Serialize};
use st_data::ExtractorConfig;
use st_driver::DriverConfig;
use st_optimizer::{Limits, SearchConfig, StepConfig};
use st_types::{config_error, validation_error, RunKey, TuneResult, TuningMode};
use std::path::{Path, PathBuf};

/// Step rules for each tuning mode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TuningConfig {
    #[serde(default)]
    pub disabled_chunked: Option<StepConfig>,
    #[serde(default)]
    pub enabled_chunked: Option<StepConfig>,
}

impl TuningConfig {
    pub fn steps(&self, mode: TuningMode) -> Option<&StepConfig> {
        match mode {
            TuningMode::DisabledChunked => self.disabled_chunked.as_ref(),
            TuningMode::EnabledChunked => self.enabled_chunked.as_ref(),
        }
    }
}

/// Everything `servetune tune` needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Engine, client, session and target settings.
    #[serde(flatten)]
    pub driver: DriverConfig,
    /// Prompts sent by every trial.
    pub num_prompts: u32,
    /// Modes to tune, in order.
    #[serde(default = "default_modes")]
    pub modes: Vec<TuningMode>,
    pub tuning: TuningConfig,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub extractor: ExtractorConfig,
    /// Root of the trial store.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_results_table")]
    pub results_table: PathBuf,
}

fn default_modes() -> Vec<TuningMode> {
    vec![TuningMode::EnabledChunked, TuningMode::DisabledChunked]
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_results_table() -> PathBuf {
    PathBuf::from("results.csv")
}

impl AppConfig {
    pub fn from_yaml_str(yaml: &str) -> TuneResult<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> TuneResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| config_error!("cannot read {}: {}", path.display(), e))?;
        Self::from_yaml_str(&text)
    }

    /// Search configuration for one mode, if that mode has step rules.
    pub fn search_config(&self, mode: TuningMode) -> TuneResult<SearchConfig> {
        let steps = self
            .tuning
            .steps(mode)
            .ok_or_else(|| validation_error!("no step rules under tuning.{}", mode.as_str()))?;
        Ok(SearchConfig::new(mode, steps.clone(), self.limits.clone()))
    }

    /// Every run, in execution order: models, then datasets, then modes.
    pub fn runs(&self) -> Vec<RunKey> {
        let mut runs = Vec::new();
        for model in self.driver.models.keys() {
            for dataset in self.driver.datasets.keys() {
                for mode in &self.modes {
                    runs.push(RunKey::new(model.clone(), dataset.clone(), self.num_prompts, *mode));
                }
            }
        }
        runs
    }

    pub fn validate(&self) -> TuneResult<()> {
        if self.num_prompts == 0 {
            return Err(validation_error!("num_prompts must be positive"));
        }
        if self.driver.models.is_empty() {
            return Err(validation_error!("at least one model is required"));
        }
        if self.driver.datasets.is_empty() {
            return Err(validation_error!("at least one dataset is required"));
        }
        if self.modes.is_empty() {
            return Err(validation_error!("at least one tuning mode is required"));
        }
        for (i, mode) in self.modes.iter().enumerate() {
            if self.modes[..i].contains(mode) {
                return Err(validation_error!("tuning mode {} listed twice", mode.as_str()));
            }
            self.search_config(*mode)?.validate()?;
        }
        Ok(())
    }
}
