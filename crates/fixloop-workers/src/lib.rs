//! Fixloop worker set
//!
//! Five stateless executors a fix session drives:
//! - [`SourceControl`]: branches, commits, pull requests, merges
//! - [`CodeEditor`]: context gathering, planned edits, lint repair
//! - [`TestRunner`]: the project's test suite
//! - [`ContainerRebuild`]: redeploy after merge
//! - [`CiMonitor`]: pull request check status
//!
//! The traits are the seam; the command-backed implementations shell out to
//! `git`, `gh`, the test runner and `docker compose`.

#![warn(unreachable_pub)]

pub mod ci;
pub mod ci_monitor;
pub mod code;
pub mod command;
pub mod container;
pub mod error;
pub mod git;
pub mod settings;
pub mod test_run;
pub mod traits;
pub mod types;

use std::sync::Arc;

pub use ci_monitor::GhCiMonitor;
pub use code::{locate, EditMatch, FsCodeEditor};
pub use command::{CommandOutput, CommandRunner};
pub use container::ComposeRebuilder;
pub use error::WorkerError;
pub use git::GitWorker;
pub use settings::WorkerSettings;
pub use test_run::CommandTestRunner;
pub use traits::{CiMonitor, CodeEditor, ContainerRebuild, SourceControl, TestRunner, WorkerSet};
pub use types::{
    Artifact, CiFailure, CiFailureClass, CiSnapshot, CiStatus, FileEdit, PullRequest,
    SessionArtifacts, WorkerReport,
};

impl WorkerSet {
    /// Command-backed workers over one repository checkout
    #[must_use]
    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self {
            source_control: Arc::new(GitWorker::new(settings)),
            code: Arc::new(FsCodeEditor::new(settings)),
            tests: Arc::new(CommandTestRunner::new(settings)),
            containers: Arc::new(ComposeRebuilder::new(settings)),
            ci: Arc::new(GhCiMonitor::new(settings)),
        }
    }
}
