// Successor launchers
// Decision: Launch requests are fire-and-forget; the successor registers itself on boot
// Decision: Without a launch endpoint the worker falls back to a dry run

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use repocrawl_durable::{ComputeLauncher, LaunchError};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::WorkerConfig;

const LAUNCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Body sent to the launch endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub worker_id: String,
    pub config: WorkerConfig,
}

/// Launches successors by POSTing a [`LaunchRequest`] to a webhook
pub struct WebhookLauncher {
    endpoint: String,
    http: reqwest::Client,
    template: WorkerConfig,
}

impl WebhookLauncher {
    pub fn new(endpoint: impl Into<String>, template: WorkerConfig) -> Result<Self, LaunchError> {
        let http = reqwest::Client::builder()
            .timeout(LAUNCH_TIMEOUT)
            .build()
            .map_err(|e| LaunchError::Transport(e.to_string()))?;

        Ok(Self {
            endpoint: endpoint.into(),
            http,
            template,
        })
    }
}

#[async_trait]
impl ComputeLauncher for WebhookLauncher {
    async fn launch(&self, worker_id: &str) -> Result<(), LaunchError> {
        let request = LaunchRequest {
            worker_id: worker_id.to_string(),
            config: self.template.successor(worker_id),
        };

        let response = self
            .http
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| LaunchError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LaunchError::Rejected(format!("{status}: {body}")));
        }

        info!(worker_id, endpoint = %self.endpoint, "successor launch requested");
        Ok(())
    }
}

/// Logs launches without performing them
#[derive(Default)]
pub struct DryRunLauncher {
    launched: Mutex<Vec<String>>,
}

impl DryRunLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids "launched" so far
    pub fn launched(&self) -> Vec<String> {
        self.launched.lock().clone()
    }
}

#[async_trait]
impl ComputeLauncher for DryRunLauncher {
    async fn launch(&self, worker_id: &str) -> Result<(), LaunchError> {
        info!(worker_id, "dry run: successor launch skipped");
        self.launched.lock().push(worker_id.to_string());
        Ok(())
    }
}

/// Pick a launcher for this configuration
pub fn launcher_for(config: &WorkerConfig) -> Result<Arc<dyn ComputeLauncher>, LaunchError> {
    match &config.launch_endpoint {
        Some(endpoint) if !config.launch_dry_run => {
            Ok(Arc::new(WebhookLauncher::new(endpoint, config.clone())?))
        }
        _ => Ok(Arc::new(DryRunLauncher::new())),
    }
}
