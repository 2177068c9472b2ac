//! Worker capability interfaces
//!
//! Five independent executors. Each is invoked with the session's current
//! artifacts plus operation parameters and is assumed safe to retry.

use crate::error::WorkerError;
use crate::types::{CiFailure, CiSnapshot, FileEdit, SessionArtifacts, WorkerReport};
use async_trait::async_trait;
use std::sync::Arc;

/// Branches, commits, pull requests
#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Create (or reuse) `branch` from the base branch and check it out
    async fn create_branch(
        &self,
        artifacts: &SessionArtifacts,
        branch: &str,
    ) -> Result<WorkerReport, WorkerError>;

    /// Commit `artifacts.files_changed` and push the session branch
    async fn commit_and_push(
        &self,
        artifacts: &SessionArtifacts,
        message: &str,
    ) -> Result<WorkerReport, WorkerError>;

    /// Open a pull request for the session branch
    async fn open_pull_request(
        &self,
        artifacts: &SessionArtifacts,
        title: &str,
        body: &str,
    ) -> Result<WorkerReport, WorkerError>;

    /// Merge the session's pull request
    async fn merge(&self, artifacts: &SessionArtifacts) -> Result<WorkerReport, WorkerError>;

    /// Discard local changes and delete the session branch
    async fn rollback(&self, artifacts: &SessionArtifacts) -> Result<WorkerReport, WorkerError>;
}

/// Reads and rewrites source files
#[async_trait]
pub trait CodeEditor: Send + Sync {
    /// Contents of `files` (as far as they exist) for a strategy prompt
    async fn gather_context(
        &self,
        artifacts: &SessionArtifacts,
        files: &[String],
    ) -> Result<WorkerReport, WorkerError>;

    /// Apply planned edits in order; stops at the first edit that cannot be placed
    async fn apply_edits(
        &self,
        artifacts: &SessionArtifacts,
        edits: &[FileEdit],
    ) -> Result<WorkerReport, WorkerError>;

    /// Mechanically repair formatter/linter findings
    async fn fix_lint(
        &self,
        artifacts: &SessionArtifacts,
        findings: &[CiFailure],
    ) -> Result<WorkerReport, WorkerError>;
}

/// Runs the project's test suite
#[async_trait]
pub trait TestRunner: Send + Sync {
    /// Full suite; `success` only when everything passes
    async fn run_tests(&self, artifacts: &SessionArtifacts) -> Result<WorkerReport, WorkerError>;
}

/// Rebuilds and redeploys the service under repair
#[async_trait]
pub trait ContainerRebuild: Send + Sync {
    /// Build, restart, and health-check
    async fn rebuild(&self, artifacts: &SessionArtifacts) -> Result<WorkerReport, WorkerError>;
}

/// Watches checks on the session's pull request
#[async_trait]
pub trait CiMonitor: Send + Sync {
    /// One status poll
    async fn poll(&self, artifacts: &SessionArtifacts) -> Result<CiSnapshot, WorkerError>;

    /// Ask CI to run failed checks again
    async fn rerun_failed(&self, artifacts: &SessionArtifacts)
        -> Result<WorkerReport, WorkerError>;
}

/// The five workers a session drives
#[derive(Clone)]
pub struct WorkerSet {
    /// Source-control worker
    pub source_control: Arc<dyn SourceControl>,
    /// Code-edit worker
    pub code: Arc<dyn CodeEditor>,
    /// Test-run worker
    pub tests: Arc<dyn TestRunner>,
    /// Container-rebuild worker
    pub containers: Arc<dyn ContainerRebuild>,
    /// CI-monitor worker
    pub ci: Arc<dyn CiMonitor>,
}

impl std::fmt::Debug for WorkerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSet").finish_non_exhaustive()
    }
}
