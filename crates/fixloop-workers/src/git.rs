//! Source-control worker over `git` and the `gh` CLI

use crate::command::CommandRunner;
use crate::error::WorkerError;
use crate::settings::WorkerSettings;
use crate::traits::SourceControl;
use crate::types::{Artifact, PullRequest, SessionArtifacts, WorkerReport};
use async_trait::async_trait;
use std::time::Duration;

/// Git + GitHub CLI implementation of [`SourceControl`]
#[derive(Debug, Clone)]
pub struct GitWorker {
    runner: CommandRunner,
    base_branch: String,
    remote: String,
}

impl GitWorker {
    /// Worker over the configured repository
    #[must_use]
    pub fn new(settings: &WorkerSettings) -> Self {
        Self {
            runner: CommandRunner::new(
                settings.repo_path.clone(),
                Duration::from_secs(settings.command_timeout_secs),
            ),
            base_branch: settings.base_branch.clone(),
            remote: settings.remote.clone(),
        }
    }

    fn branch<'a>(&self, artifacts: &'a SessionArtifacts) -> Result<&'a str, WorkerError> {
        artifacts
            .branch
            .as_deref()
            .ok_or_else(|| WorkerError::Invocation(format!("session {} has no branch", artifacts.session)))
    }

    fn pull_request<'a>(&self, artifacts: &'a SessionArtifacts) -> Result<&'a PullRequest, WorkerError> {
        artifacts.pull_request.as_ref().ok_or_else(|| {
            WorkerError::Invocation(format!("session {} has no pull request", artifacts.session))
        })
    }
}

#[async_trait]
impl SourceControl for GitWorker {
    async fn create_branch(
        &self,
        _artifacts: &SessionArtifacts,
        branch: &str,
    ) -> Result<WorkerReport, WorkerError> {
        self.runner.run("git", &["checkout", "--", "."]).await?;
        self.runner.run_ok("git", &["checkout", self.base_branch.as_str()]).await?;
        let pull = self.runner.run("git", &["pull", self.remote.as_str(), self.base_branch.as_str()]).await?;
        if !pull.success {
            tracing::warn!(base = %self.base_branch, output = %pull.combined(), "pull of base branch failed, branching from local state");
        }

        let created = self.runner.run("git", &["checkout", "-b", branch]).await?;
        if !created.success {
            // Branch left over from an earlier attempt at the same issue.
            let existing = self.runner.run("git", &["checkout", branch]).await?;
            if !existing.success {
                return Ok(WorkerReport::failed(existing.combined()));
            }
        }
        Ok(WorkerReport::ok(format!("on branch {branch}")).with_artifact(Artifact::Branch {
            name: branch.to_string(),
        }))
    }

    async fn commit_and_push(
        &self,
        artifacts: &SessionArtifacts,
        message: &str,
    ) -> Result<WorkerReport, WorkerError> {
        let branch = self.branch(artifacts)?;
        if artifacts.files_changed.is_empty() {
            return Ok(WorkerReport::failed("no changed files to commit"));
        }
        let mut add = vec!["add", "--"];
        add.extend(artifacts.files_changed.iter().map(String::as_str));
        let added = self.runner.run("git", add.as_slice()).await?;
        if !added.success {
            return Ok(WorkerReport::failed(added.combined()));
        }

        let committed = self.runner.run("git", &["commit", "-m", message]).await?;
        // "nothing to commit" after a no-op lint fix still lets us push what is there.
        if !committed.success && !committed.combined().contains("nothing to commit") {
            return Ok(WorkerReport::failed(committed.combined()));
        }
        let head = self.runner.run_ok("git", &["rev-parse", "HEAD"]).await?;
        let sha = head.stdout.trim().to_string();

        let pushed = self.runner.run("git", &["push", "-u", self.remote.as_str(), branch]).await?;
        if !pushed.success {
            return Ok(WorkerReport::failed(pushed.combined()));
        }
        Ok(WorkerReport::ok(format!("pushed {sha} to {branch}")).with_artifact(Artifact::Commit { sha }))
    }

    async fn open_pull_request(
        &self,
        artifacts: &SessionArtifacts,
        title: &str,
        body: &str,
    ) -> Result<WorkerReport, WorkerError> {
        let branch = self.branch(artifacts)?;
        let output = self
            .runner
            .run(
                "gh",
                &[
                    "pr", "create", "--title", title, "--body", body, "--head", branch, "--base",
                    self.base_branch.as_str(),
                ],
            )
            .await?;
        if !output.success {
            return Ok(WorkerReport::failed(output.combined()));
        }
        match parse_pr_url(&output.combined()) {
            Some(pr) => Ok(WorkerReport::ok(pr.url.clone()).with_artifact(Artifact::PullRequest(pr))),
            None => Ok(WorkerReport::failed(format!(
                "pull request created but no URL in output: {}",
                output.combined()
            ))),
        }
    }

    async fn merge(&self, artifacts: &SessionArtifacts) -> Result<WorkerReport, WorkerError> {
        let pr = self.pull_request(artifacts)?;
        let number = pr.number.to_string();
        let output = self
            .runner
            .run("gh", &["pr", "merge", number.as_str(), "--squash", "--delete-branch"])
            .await?;
        if output.success {
            Ok(WorkerReport::ok(format!("merged {}", pr.url)))
        } else {
            Ok(WorkerReport::failed(output.combined()))
        }
    }

    async fn rollback(&self, artifacts: &SessionArtifacts) -> Result<WorkerReport, WorkerError> {
        self.runner.run("git", &["checkout", "--", "."]).await?;
        self.runner.run_ok("git", &["checkout", self.base_branch.as_str()]).await?;
        if let Some(branch) = artifacts.branch.as_deref() {
            self.runner.run("git", &["branch", "-D", branch]).await?;
            if artifacts.commit.is_some() && artifacts.pull_request.is_none() {
                self.runner
                    .run("git", &["push", self.remote.as_str(), "--delete", branch])
                    .await?;
            }
        }
        Ok(WorkerReport::ok(format!("back on {}", self.base_branch)))
    }
}

/// Pull request URL and number from `gh pr create` output
#[must_use]
pub fn parse_pr_url(output: &str) -> Option<PullRequest> {
    output
        .split_whitespace()
        .filter(|w| w.starts_with("https://") && w.contains("/pull/"))
        .find_map(|url| {
            let number = url.trim_end_matches('/').rsplit('/').next()?.parse().ok()?;
            Some(PullRequest {
                number,
                url: url.to_string(),
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pr_url_is_found_in_noisy_output() {
        let out = "Creating pull request for fix/I1 into main\n\nhttps://github.com/acme/app/pull/42\n";
        let pr = parse_pr_url(out).unwrap();
        assert_eq!(pr.number, 42);
        assert_eq!(pr.url, "https://github.com/acme/app/pull/42");
    }

    #[test]
    fn no_pr_url() {
        assert!(parse_pr_url("error: not a git repository").is_none());
    }
}
