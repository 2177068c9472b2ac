//! Container-rebuild worker over `docker compose`

use crate::command::CommandRunner;
use crate::error::WorkerError;
use crate::settings::WorkerSettings;
use crate::traits::ContainerRebuild;
use crate::types::{SessionArtifacts, WorkerReport};
use async_trait::async_trait;
use std::time::Duration;

const HEALTH_POLL: Duration = Duration::from_secs(2);
const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Rebuilds one compose service and waits for its health URL
#[derive(Debug, Clone)]
pub struct ComposeRebuilder {
    runner: CommandRunner,
    service: Option<String>,
    health_url: Option<String>,
    health_timeout: Duration,
    http: reqwest::Client,
}

impl ComposeRebuilder {
    /// Rebuilder for the configured compose directory
    #[must_use]
    pub fn new(settings: &WorkerSettings) -> Self {
        let dir = settings
            .compose_path
            .clone()
            .unwrap_or_else(|| settings.repo_path.clone());
        Self {
            runner: CommandRunner::new(dir, Duration::from_secs(settings.command_timeout_secs)),
            service: settings.compose_service.clone(),
            health_url: settings.health_url.clone(),
            health_timeout: Duration::from_secs(settings.health_timeout_secs),
            http: reqwest::Client::new(),
        }
    }

    async fn compose(&self, verb: &[&str]) -> Result<WorkerReport, WorkerError> {
        let mut args = vec!["compose"];
        args.extend_from_slice(verb);
        if let Some(service) = self.service.as_deref() {
            args.push(service);
        }
        let output = self.runner.run("docker", args.as_slice()).await?;
        Ok(if output.success {
            WorkerReport::ok(output.combined())
        } else {
            WorkerReport::failed(output.combined())
        })
    }

    async fn wait_healthy(&self, url: &str) -> bool {
        let deadline = tokio::time::Instant::now() + self.health_timeout;
        while tokio::time::Instant::now() < deadline {
            let probe = self.http.get(url).timeout(HEALTH_REQUEST_TIMEOUT).send().await;
            if probe.is_ok_and(|r| r.status().is_success()) {
                return true;
            }
            tokio::time::sleep(HEALTH_POLL).await;
        }
        false
    }
}

#[async_trait]
impl ContainerRebuild for ComposeRebuilder {
    async fn rebuild(&self, artifacts: &SessionArtifacts) -> Result<WorkerReport, WorkerError> {
        tracing::info!(session = %artifacts.session, service = ?self.service, "rebuilding container");
        let built = self.compose(&["build"]).await?;
        if !built.success {
            return Ok(WorkerReport::failed(format!("build failed: {}", built.output)));
        }
        let up = self.compose(&["up", "-d"]).await?;
        if !up.success {
            return Ok(WorkerReport::failed(format!("deploy failed: {}", up.output)));
        }
        if let Some(url) = self.health_url.as_deref() {
            if !self.wait_healthy(url).await {
                return Ok(WorkerReport::failed(format!(
                    "service not healthy at {url} after {}s",
                    self.health_timeout.as_secs()
                )));
            }
        }
        Ok(WorkerReport::ok("deployed"))
    }
}
