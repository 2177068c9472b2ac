//! Test-run worker: the project's own test command

use crate::ci::parse_failed_tests;
use crate::command::CommandRunner;
use crate::error::WorkerError;
use crate::settings::WorkerSettings;
use crate::traits::TestRunner;
use crate::types::{Artifact, SessionArtifacts, WorkerReport};
use async_trait::async_trait;
use std::time::Duration;

/// Runs the configured test command in the checkout
#[derive(Debug, Clone)]
pub struct CommandTestRunner {
    runner: CommandRunner,
    command: Vec<String>,
}

impl CommandTestRunner {
    /// Runner over the configured repository
    #[must_use]
    pub fn new(settings: &WorkerSettings) -> Self {
        Self {
            runner: CommandRunner::new(
                settings.repo_path.clone(),
                Duration::from_secs(settings.command_timeout_secs),
            ),
            command: settings.test_command.clone(),
        }
    }
}

#[async_trait]
impl TestRunner for CommandTestRunner {
    async fn run_tests(&self, artifacts: &SessionArtifacts) -> Result<WorkerReport, WorkerError> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(WorkerError::Invocation("no test command configured".to_string()));
        };
        let output = self.runner.run(program, args).await?;
        let text = output.combined();
        tracing::info!(session = %artifacts.session, passed = output.success, "test suite finished");

        if output.success {
            return Ok(WorkerReport::ok(text));
        }
        let mut report = WorkerReport::failed(text.clone());
        for name in parse_failed_tests(&text) {
            report = report.with_artifact(Artifact::FailedTest { name });
        }
        Ok(report)
    }
}
