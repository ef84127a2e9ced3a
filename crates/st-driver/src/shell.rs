use async_trait::async_trait;
use st_data::{normalize_terminal_output, DATA_SPLIT};
use st_types::{DriverResult, ParameterPoint, RunKey};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{DriverConfig, ReadLimits};
use crate::session::ShellSession;
use crate::ExperimentDriver;

/// Runs each trial against a freshly launched server.
///
/// A trial uses two shells: one hosts the server as a background job, the
/// other runs the benchmark client and the profiling helper. Both are torn
/// down when the trial ends, whether it succeeded or not.
#[derive(Debug, Clone)]
pub struct ShellDriver {
    config: DriverConfig,
}

impl ShellDriver {
    pub fn new(config: DriverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    async fn run_commands(session: &mut ShellSession, commands: &[String], limits: ReadLimits) {
        for command in commands {
            if let Err(e) = session.run_to_completion(command, limits).await {
                warn!(session = session.name(), command = %command, "Command failed: {}", e);
            }
        }
    }

    async fn capture_trial(
        &self,
        server: &mut ShellSession,
        client: &mut ShellSession,
        server_cmd: &str,
        client_cmd: &str,
    ) -> DriverResult<String> {
        let limits = self.config.session.read_limits();
        let short = self.config.session.command_limits();
        let markers = &self.config.server;

        Self::run_commands(server, &self.config.server.pre_cmds, short).await;
        Self::run_commands(client, &self.config.client.pre_cmds, short).await;

        server.execute_background(server_cmd).await?;
        server.read_until(&markers.ready_marker, limits).await?;
        info!("Server ready");

        // The server logs every request; keep its pipe from filling up while
        // the client runs.
        server.start_drain()?;
        let client_output = client.run_to_completion(client_cmd, limits).await;
        server.stop_drain().await?;
        let client_output = client_output?;

        let mut log = normalize_terminal_output(&client_output);
        log.push('\n');
        log.push_str(DATA_SPLIT);
        log.push('\n');

        client
            .run_to_completion(&self.config.profile_save_command(), limits)
            .await?;
        server.read_until(&markers.profiling_marker, limits).await?;

        let tail = server.capture_until(&markers.request_log_marker, short).await?;
        if !tail.marker_found {
            warn!(
                marker = %markers.request_log_marker,
                "Scheduler output did not end with a request log line; keeping what was read"
            );
        }
        log.push_str(&tail.text);
        Ok(log)
    }

    async fn teardown(&self, mut server: ShellSession, client: ShellSession) {
        let grace = Duration::from_secs(self.config.session.command_timeout_secs);

        if let Err(e) = server.stop_drain().await {
            warn!("Failed to stop server drain: {}", e);
        }
        if let Err(e) = server.terminate_background(self.config.session.read_limits()).await {
            warn!("Server did not stop cleanly: {}", e);
        }
        for session in [server, client] {
            let name = session.name().to_string();
            if let Err(e) = session.close(grace).await {
                warn!(session = %name, "Failed to close session: {}", e);
            }
        }
    }
}

#[async_trait]
impl ExperimentDriver for ShellDriver {
    async fn run_trial(&mut self, run: &RunKey, point: &ParameterPoint) -> DriverResult<String> {
        let server_cmd = self.config.server_command(run, point)?;
        let client_cmd = self.config.client_command(run, point)?;
        info!(%run, %point, "Starting trial");

        let shell = self.config.session.shell.clone();
        let mut server = ShellSession::spawn("server", &shell).await?;
        let mut client = ShellSession::spawn("client", &shell).await?;

        let result = self
            .capture_trial(&mut server, &mut client, &server_cmd, &client_cmd)
            .await;

        let short = self.config.session.command_limits();
        Self::run_commands(&mut server, &self.config.server.post_cmds, short).await;
        Self::run_commands(&mut client, &self.config.client.post_cmds, short).await;
        self.teardown(server, client).await;

        match &result {
            Ok(log) => info!(%point, bytes = log.len(), "Trial captured"),
            Err(e) => warn!(%point, "Trial failed: {}", e),
        }
        result
    }

    fn name(&self) -> &str {
        "shell"
    }
}
