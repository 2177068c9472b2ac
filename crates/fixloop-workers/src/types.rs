//! Values passed across the worker boundary

use fixloop_kernel::{Issue, SessionId};
use serde::{Deserialize, Serialize};

/// One replacement in one file, as planned by the oracle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEdit {
    /// Path relative to the repository root
    pub file: String,
    /// What the edit is for
    #[serde(default)]
    pub description: String,
    /// Exact text to replace; must occur once
    pub old_code: String,
    /// Replacement text
    pub new_code: String,
}

/// An open pull request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Number on the hosting service
    pub number: u64,
    /// Web URL
    pub url: String,
}

/// What a session has produced so far; workers read it, never write it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionArtifacts {
    /// Owning session
    pub session: SessionId,
    /// Issue being fixed
    pub issue: Issue,
    /// Session branch, once created
    pub branch: Option<String>,
    /// Files edited so far
    pub files_changed: Vec<String>,
    /// Last commit pushed
    pub commit: Option<String>,
    /// Pull request, once opened
    pub pull_request: Option<PullRequest>,
}

impl SessionArtifacts {
    /// Fresh artifacts for a new session
    #[must_use]
    pub fn new(session: SessionId, issue: Issue) -> Self {
        Self {
            session,
            issue,
            branch: None,
            files_changed: Vec::new(),
            commit: None,
            pull_request: None,
        }
    }
}

/// Something a worker produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Artifact {
    /// Branch created or checked out
    Branch {
        /// Branch name
        name: String,
    },
    /// File written
    FileChanged {
        /// Path relative to the repository root
        path: String,
    },
    /// Commit pushed
    Commit {
        /// Commit hash
        sha: String,
    },
    /// Pull request opened
    PullRequest(PullRequest),
    /// Failing test identifier
    FailedTest {
        /// Test node id
        name: String,
    },
}

/// Outcome of one worker call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    /// Whether the operation achieved its goal
    pub success: bool,
    /// Tool output or diagnostic text
    pub output: String,
    /// Produced artifacts
    pub artifacts: Vec<Artifact>,
}

impl WorkerReport {
    /// Successful report
    #[must_use]
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            artifacts: Vec::new(),
        }
    }

    /// Failed report with diagnostics
    #[must_use]
    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            artifacts: Vec::new(),
        }
    }

    /// With an artifact
    #[must_use]
    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    /// Pull request artifact, if any
    #[must_use]
    pub fn pull_request(&self) -> Option<&PullRequest> {
        self.artifacts.iter().find_map(|a| match a {
            Artifact::PullRequest(pr) => Some(pr),
            _ => None,
        })
    }

    /// Commit artifact, if any
    #[must_use]
    pub fn commit(&self) -> Option<&str> {
        self.artifacts.iter().find_map(|a| match a {
            Artifact::Commit { sha } => Some(sha.as_str()),
            _ => None,
        })
    }

    /// Changed files
    #[must_use]
    pub fn files_changed(&self) -> Vec<String> {
        self.artifacts
            .iter()
            .filter_map(|a| match a {
                Artifact::FileChanged { path } => Some(path.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Aggregate CI state of a pull request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CiStatus {
    /// Checks still queued or running
    Pending,
    /// Every check passed
    Green,
    /// At least one check failed
    Failed,
}

/// Classification of a failed check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CiFailureClass {
    /// Formatter would rewrite files
    Format,
    /// Linter findings
    Lint,
    /// Test failures
    Test,
    /// Build or image failures
    Build,
    /// Anything else
    Unknown,
}

impl CiFailureClass {
    /// Classes the code worker can repair mechanically
    #[inline]
    #[must_use]
    pub fn is_auto_fixable(self) -> bool {
        matches!(self, Self::Format | Self::Lint)
    }

    /// Stable label
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Format => "format",
            Self::Lint => "lint",
            Self::Test => "test",
            Self::Build => "build",
            Self::Unknown => "unknown",
        }
    }
}

/// One failed CI check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiFailure {
    /// Check name
    pub check: String,
    /// Classification
    pub class: CiFailureClass,
    /// File the failure points at, if any
    pub file: Option<String>,
    /// Short human-readable summary
    pub message: String,
}

/// One CI poll result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiSnapshot {
    /// Aggregate state
    pub status: CiStatus,
    /// Failed checks, populated when `status` is `Failed`
    pub failures: Vec<CiFailure>,
}

impl CiSnapshot {
    /// All checks passed
    #[must_use]
    pub fn green() -> Self {
        Self {
            status: CiStatus::Green,
            failures: Vec::new(),
        }
    }

    /// Still running
    #[must_use]
    pub fn pending() -> Self {
        Self {
            status: CiStatus::Pending,
            failures: Vec::new(),
        }
    }

    /// Failed with the given checks
    #[must_use]
    pub fn failed(failures: Vec<CiFailure>) -> Self {
        Self {
            status: CiStatus::Failed,
            failures,
        }
    }

    /// Every failure is mechanically repairable (and there is at least one)
    #[must_use]
    pub fn auto_fixable(&self) -> bool {
        !self.failures.is_empty() && self.failures.iter().all(|f| f.class.is_auto_fixable())
    }

    /// Multi-line summary for prompts and notifications
    #[must_use]
    pub fn describe(&self) -> String {
        self.failures
            .iter()
            .map(|f| match &f.file {
                Some(file) => format!("[{}] {} ({file}): {}", f.class.as_str(), f.check, f.message),
                None => format!("[{}] {}: {}", f.class.as_str(), f.check, f.message),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
