use async_trait::async_trait;
use st_data::TrialStore;
use st_types::{DriverError, DriverResult, ParameterPoint, RunKey};
use std::io;

use crate::ExperimentDriver;

/// Serves trial logs from a [`TrialStore`] instead of running anything.
#[derive(Debug, Clone)]
pub struct ReplayDriver {
    store: TrialStore,
}

impl ReplayDriver {
    pub fn new(store: TrialStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ExperimentDriver for ReplayDriver {
    async fn run_trial(&mut self, run: &RunKey, point: &ParameterPoint) -> DriverResult<String> {
        let path = self.store.log_path(run, point);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(DriverError::NoStoredLog {
                trial: path.display().to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &str {
        "replay"
    }
}
