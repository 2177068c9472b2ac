//! CI-monitor worker over the `gh` CLI

use crate::ci::{parse_check_rollup, snapshot_from_logs};
use crate::command::CommandRunner;
use crate::error::WorkerError;
use crate::settings::WorkerSettings;
use crate::traits::CiMonitor;
use crate::types::{CiSnapshot, CiStatus, SessionArtifacts, WorkerReport};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// Log text kept per failed check
const LOG_LIMIT: usize = 20_000;

#[derive(Debug, Deserialize)]
struct RunSummary {
    #[serde(rename = "databaseId")]
    id: u64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    conclusion: Option<String>,
}

/// Polls pull request checks and fetches failed-run logs
#[derive(Debug, Clone)]
pub struct GhCiMonitor {
    runner: CommandRunner,
}

impl GhCiMonitor {
    /// Monitor over the configured repository
    #[must_use]
    pub fn new(settings: &WorkerSettings) -> Self {
        Self {
            runner: CommandRunner::new(
                settings.repo_path.clone(),
                Duration::from_secs(settings.command_timeout_secs),
            ),
        }
    }

    async fn failed_runs(&self, branch: &str) -> Result<Vec<RunSummary>, WorkerError> {
        let output = self
            .runner
            .run_ok(
                "gh",
                &[
                    "run",
                    "list",
                    "--branch",
                    branch,
                    "--limit",
                    "5",
                    "--json",
                    "databaseId,conclusion,name",
                ],
            )
            .await?;
        let runs: Vec<RunSummary> = serde_json::from_str(&output.stdout)
            .map_err(|e| WorkerError::Unavailable(format!("unreadable run list: {e}")))?;
        Ok(runs
            .into_iter()
            .filter(|r| r.conclusion.as_deref() == Some("failure"))
            .collect())
    }

    async fn run_log(&self, run: u64) -> Result<String, WorkerError> {
        let id = run.to_string();
        let failed_only = self
            .runner
            .run("gh", &["run", "view", id.as_str(), "--log-failed"])
            .await?;
        let text = if failed_only.success && !failed_only.stdout.trim().is_empty() {
            failed_only.stdout
        } else {
            self.runner
                .run("gh", &["run", "view", id.as_str(), "--log"])
                .await?
                .combined()
        };
        Ok(text.chars().take(LOG_LIMIT).collect())
    }
}

#[async_trait]
impl CiMonitor for GhCiMonitor {
    async fn poll(&self, artifacts: &SessionArtifacts) -> Result<CiSnapshot, WorkerError> {
        let pr = artifacts.pull_request.as_ref().ok_or_else(|| {
            WorkerError::Invocation(format!("session {} has no pull request", artifacts.session))
        })?;
        let number = pr.number.to_string();
        let output = self
            .runner
            .run(
                "gh",
                &["pr", "view", number.as_str(), "--json", "statusCheckRollup"],
            )
            .await?;
        if !output.success {
            return Err(WorkerError::Unavailable(output.combined()));
        }
        let (status, failed_checks) = parse_check_rollup(&output.stdout)
            .map_err(|e| WorkerError::Unavailable(format!("unreadable check rollup: {e}")))?;

        match status {
            CiStatus::Green => Ok(CiSnapshot::green()),
            CiStatus::Pending => Ok(CiSnapshot::pending()),
            CiStatus::Failed => {
                let mut logs = Vec::new();
                if let Some(branch) = artifacts.branch.as_deref() {
                    for run in self.failed_runs(branch).await? {
                        logs.push((run.name.clone(), self.run_log(run.id).await?));
                    }
                }
                if logs.is_empty() {
                    // No workflow logs reachable; classify by check name alone.
                    logs = failed_checks.into_iter().map(|c| (c, String::new())).collect();
                }
                Ok(snapshot_from_logs(&logs))
            }
        }
    }

    async fn rerun_failed(
        &self,
        artifacts: &SessionArtifacts,
    ) -> Result<WorkerReport, WorkerError> {
        let Some(branch) = artifacts.branch.as_deref() else {
            return Err(WorkerError::Invocation(format!(
                "session {} has no branch",
                artifacts.session
            )));
        };
        let runs = self.failed_runs(branch).await?;
        let Some(latest) = runs.first() else {
            return Ok(WorkerReport::failed("no failed run to re-run"));
        };
        let id = latest.id.to_string();
        let output = self
            .runner
            .run("gh", &["run", "rerun", id.as_str(), "--failed"])
            .await?;
        Ok(if output.success {
            WorkerReport::ok(format!("re-running {}", latest.name))
        } else {
            WorkerReport::failed(output.combined())
        })
    }
}
