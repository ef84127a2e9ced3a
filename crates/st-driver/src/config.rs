//! Driver configuration: where the engine runs and how to launch it.

use serde::{Deserialize, Serialize};
use st_types::{DriverError, DriverResult, ParameterPoint, RunKey};
use std::collections::BTreeMap;
use std::time::Duration;

/// Timeouts for one interactive shell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell program each session runs.
    pub shell: String,
    /// Longest wait for any single chunk of output.
    pub read_timeout_secs: u64,
    /// Longest wait for a marker overall.
    pub max_duration_secs: u64,
    /// Overall limit for setup/teardown commands and short tail reads.
    pub command_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            read_timeout_secs: 60,
            max_duration_secs: 3600,
            command_timeout_secs: 3,
        }
    }
}

impl SessionConfig {
    pub fn read_limits(&self) -> ReadLimits {
        ReadLimits::new(
            Duration::from_secs(self.read_timeout_secs),
            Duration::from_secs(self.max_duration_secs),
        )
    }

    pub fn command_limits(&self) -> ReadLimits {
        let max = Duration::from_secs(self.command_timeout_secs);
        ReadLimits::new(max, max)
    }
}

/// Per-read and overall limits for waiting on session output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadLimits {
    pub per_read: Duration,
    pub overall: Duration,
}

impl ReadLimits {
    /// The per-read wait never exceeds the overall limit.
    pub fn new(per_read: Duration, overall: Duration) -> Self {
        Self {
            per_read: per_read.min(overall),
            overall,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Command prefix that starts the OpenAI-compatible server.
    pub entrypoint: String,
    /// Printed once the server accepts requests.
    pub ready_marker: String,
    /// Printed when the scheduler profile has been written to the log.
    pub profiling_marker: String,
    /// Access-log line that closes the profile dump.
    pub request_log_marker: String,
    pub pre_cmds: Vec<String>,
    pub post_cmds: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            entrypoint: "python -m vllm.entrypoints.openai.api_server".to_string(),
            ready_marker: "Uvicorn running on".to_string(),
            profiling_marker: "vLLM scheduler profiling save...".to_string(),
            request_log_marker: "/v1/completions HTTP/".to_string(),
            pre_cmds: Vec::new(),
            post_cmds: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Command prefix of the benchmark client.
    pub benchmark: String,
    pub backend: String,
    /// Command prefix of the helper that asks the server to dump its profile.
    pub utils: String,
    pub pre_cmds: Vec<String>,
    pub post_cmds: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            benchmark: "python benchmark_serving2.py".to_string(),
            backend: "vllm".to_string(),
            utils: "python3 utils.py".to_string(),
            pre_cmds: Vec::new(),
            post_cmds: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub path: String,
    #[serde(default = "default_tensor_parallel")]
    pub tensor_parallel: u32,
}

fn default_tensor_parallel() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub path: String,
}

/// Everything [`crate::ShellDriver`] needs to run a trial.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub models: BTreeMap<String, ModelConfig>,
    #[serde(default)]
    pub datasets: BTreeMap<String, DatasetConfig>,
}

impl DriverConfig {
    pub fn model(&self, name: &str) -> DriverResult<&ModelConfig> {
        self.models.get(name).ok_or_else(|| DriverError::UnknownTarget {
            kind: "model".to_string(),
            name: name.to_string(),
        })
    }

    pub fn dataset(&self, name: &str) -> DriverResult<&DatasetConfig> {
        self.datasets.get(name).ok_or_else(|| DriverError::UnknownTarget {
            kind: "dataset".to_string(),
            name: name.to_string(),
        })
    }

    /// Server launch command for `point`. The token budget flag only appears
    /// when the point carries one.
    pub fn server_command(&self, run: &RunKey, point: &ParameterPoint) -> DriverResult<String> {
        let model = self.model(&run.model)?;
        let mut cmd = format!(
            "{} --trust-remote-code --model {} -tp {} --host {} --port {} --max_num_seqs={}",
            self.server.entrypoint,
            model.path,
            model.tensor_parallel,
            self.server.host,
            self.server.port,
            point.max_num_seqs
        );
        if let Some(tokens) = point.max_num_batched_tokens {
            cmd.push_str(&format!(" --enable_chunked_prefill --max_num_batched_tokens={tokens}"));
        }
        Ok(cmd)
    }

    pub fn client_command(&self, run: &RunKey, point: &ParameterPoint) -> DriverResult<String> {
        let model = self.model(&run.model)?;
        let dataset = self.dataset(&run.dataset)?;
        Ok(format!(
            "{} --backend {} --trust-remote-code --model {} --dataset-name {} --dataset-path {} \
             --num-prompts={} --request-rate={} --host {} --port {}",
            self.client.benchmark,
            self.client.backend,
            model.path,
            run.dataset,
            dataset.path,
            run.num_prompts,
            point.request_rate,
            self.server.host,
            self.server.port
        ))
    }

    pub fn profile_save_command(&self) -> String {
        format!(
            "{} --host {} --port {} --action save",
            self.client.utils, self.server.host, self.server.port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use st_types::TuningMode;

    fn config() -> DriverConfig {
        let mut config = DriverConfig::default();
        config.models.insert(
            "llama-7b".into(),
            ModelConfig {
                path: "/models/llama-7b".into(),
                tensor_parallel: 2,
            },
        );
        config.datasets.insert(
            "sharegpt".into(),
            DatasetConfig {
                path: "/data/sharegpt.json".into(),
            },
        );
        config
    }

    fn run(mode: TuningMode) -> RunKey {
        RunKey::new("llama-7b", "sharegpt", 1000, mode)
    }

    #[test]
    fn server_command_adds_chunking_flags_with_token_budget() {
        let config = config();
        let point = ParameterPoint::new(64, Some(2048), 4.0);
        let chunked = config
            .server_command(&run(TuningMode::EnabledChunked), &point)
            .unwrap();
        assert_eq!(
            chunked,
            "python -m vllm.entrypoints.openai.api_server --trust-remote-code --model /models/llama-7b \
             -tp 2 --host 127.0.0.1 --port 8000 --max_num_seqs=64 --enable_chunked_prefill \
             --max_num_batched_tokens=2048"
        );

        let plain = config
            .server_command(&run(TuningMode::DisabledChunked), &ParameterPoint::new(64, None, 4.0))
            .unwrap();
        assert!(plain.ends_with("--max_num_seqs=64"));
    }

    #[test]
    fn client_command_carries_workload() {
        let point = ParameterPoint::new(64, Some(2048), 2.5);
        let cmd = config()
            .client_command(&run(TuningMode::EnabledChunked), &point)
            .unwrap();
        assert!(cmd.starts_with("python benchmark_serving2.py --backend vllm"));
        assert!(cmd.contains("--dataset-name sharegpt --dataset-path /data/sharegpt.json"));
        assert!(cmd.contains("--num-prompts=1000 --request-rate=2.5"));
    }

    #[test]
    fn unknown_model_is_reported() {
        let run = RunKey::new("mystery", "sharegpt", 10, TuningMode::DisabledChunked);
        let err = config()
            .server_command(&run, &ParameterPoint::new(8, None, 1.0))
            .unwrap_err();
        assert!(matches!(err, DriverError::UnknownTarget { ref kind, .. } if kind == "model"));
    }

    #[test]
    fn per_read_limit_never_exceeds_overall() {
        let limits = ReadLimits::new(Duration::from_secs(60), Duration::from_secs(3));
        assert_eq!(limits.per_read, Duration::from_secs(3));
        assert_eq!(SessionConfig::default().read_limits().per_read, Duration::from_secs(60));
    }
}
