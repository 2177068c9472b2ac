//! Settings for the command-backed workers

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where the repository lives and which tools to run against it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Repository checkout the workers operate on
    pub repo_path: PathBuf,
    /// Branch pull requests target
    pub base_branch: String,
    /// Git remote to push to
    pub remote: String,
    /// Test suite command (program then arguments)
    pub test_command: Vec<String>,
    /// Formatter / lint fixer command
    pub lint_fix_command: Vec<String>,
    /// Directory holding the compose file, when redeploys are wanted
    pub compose_path: Option<PathBuf>,
    /// Compose service to rebuild
    pub compose_service: Option<String>,
    /// URL that answers 200 once the service is healthy
    pub health_url: Option<String>,
    /// Per-command timeout
    pub command_timeout_secs: u64,
    /// How long a rebuilt service may take to become healthy
    pub health_timeout_secs: u64,
    /// How long to wait for CI before treating it as failed
    pub ci_timeout_secs: u64,
    /// Interval between CI polls
    pub ci_poll_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::from("."),
            base_branch: "main".to_string(),
            remote: "origin".to_string(),
            test_command: vec!["pytest".to_string(), "-q".to_string()],
            lint_fix_command: vec!["black".to_string(), ".".to_string()],
            compose_path: None,
            compose_service: None,
            health_url: None,
            command_timeout_secs: 600,
            health_timeout_secs: 90,
            ci_timeout_secs: 900,
            ci_poll_secs: 30,
        }
    }
}
