//! Session record: everything one fix attempt has done so far
//!
//! Owned by the session's own task. The coordinator only ever sees
//! [`SessionSnapshot`] copies published over a watch channel.

use crate::error::SessionFailure;
use crate::plan::Plan;
use chrono::{DateTime, Utc};
use fixloop_kernel::{slugify, Issue, IssueId, SessionId, SessionState};
use fixloop_learning::LessonId;
use fixloop_safety::Usd;
use fixloop_workers::SessionArtifacts;
use serde::{Deserialize, Serialize};

/// Longest title slug used in a branch name
const BRANCH_SLUG_CHARS: usize = 30;

/// One step a session took
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionEntry {
    /// When it finished
    pub at: DateTime<Utc>,
    /// State the session was in
    pub state: SessionState,
    /// What was done (`oracle.strategy`, `code.apply_edits`, ...)
    pub action: String,
    /// Short outcome
    pub outcome: String,
}

impl ActionEntry {
    /// `STATE action: outcome`, as stored in lessons
    #[must_use]
    pub fn summary(&self) -> String {
        format!("{} {}: {}", self.state, self.action, self.outcome)
    }
}

/// Bounded-loop counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryCounters {
    /// Strategy prompts that produced a plan
    pub strategies: u32,
    /// Test-failure repair loops entered
    pub repairs: u32,
    /// Test-suite invocations
    pub test_runs: u32,
    /// CI lint/format repairs entered
    pub ci_fixes: u32,
    /// CI re-runs requested
    pub ci_retries: u32,
}

/// Full session state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Current state
    pub state: SessionState,
    /// Issue, branch, files, commit, pull request
    pub artifacts: SessionArtifacts,
    /// Ordered action log
    pub actions: Vec<ActionEntry>,
    /// Oracle spend so far
    pub cost: Usd,
    /// Loop counters
    pub counters: RetryCounters,
    /// Current plan
    pub plan: Option<Plan>,
    /// Lessons shown to the oracle
    pub applied_lessons: Vec<LessonId>,
    /// Most recent error text
    pub last_error: Option<String>,
    /// Terminal failure, once there is one
    pub failure: Option<SessionFailure>,
    /// Lesson written on failure
    pub lesson: Option<LessonId>,
    /// Admission time
    pub created_at: DateTime<Utc>,
    /// Last change
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Fresh record in STRATEGIZING
    #[must_use]
    pub fn new(id: SessionId, issue: Issue) -> Self {
        let now = Utc::now();
        Self {
            state: SessionState::Strategizing,
            artifacts: SessionArtifacts::new(id, issue),
            actions: Vec::new(),
            cost: Usd::ZERO,
            counters: RetryCounters::default(),
            plan: None,
            applied_lessons: Vec::new(),
            last_error: None,
            failure: None,
            lesson: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Session id
    #[inline]
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.artifacts.session
    }

    /// Issue being fixed
    #[inline]
    #[must_use]
    pub fn issue(&self) -> &Issue {
        &self.artifacts.issue
    }

    /// Append to the action log
    pub fn log(&mut self, action: impl Into<String>, outcome: impl Into<String>) {
        let now = Utc::now();
        self.actions.push(ActionEntry {
            at: now,
            state: self.state,
            action: action.into(),
            outcome: outcome.into(),
        });
        self.updated_at = now;
    }

    /// Remember an error without failing
    pub fn note_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
        self.updated_at = Utc::now();
    }

    /// Record files changed by a worker
    pub fn add_files(&mut self, files: impl IntoIterator<Item = String>) {
        for file in files {
            if !self.artifacts.files_changed.contains(&file) {
                self.artifacts.files_changed.push(file);
            }
        }
    }

    /// Files worth remembering about this session: changed, planned, mentioned
    #[must_use]
    pub fn touched_files(&self) -> Vec<String> {
        let mut files = self.artifacts.files_changed.clone();
        if let Some(plan) = &self.plan {
            files.extend(plan.files());
        }
        files.extend(self.issue().file_references());
        files.sort();
        files.dedup();
        files
    }

    /// Copy for the coordinator
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session: self.id(),
            issue: self.issue().id.clone(),
            title: self.issue().title.clone(),
            state: self.state,
            cost: self.cost,
            counters: self.counters,
            branch: self.artifacts.branch.clone(),
            pull_request: self.artifacts.pull_request.as_ref().map(|pr| pr.url.clone()),
            last_error: self.last_error.clone(),
            updated_at: self.updated_at,
        }
    }
}

/// Branch for an issue: `fix/{id}-{slug}` with the slug cut to 30 characters
#[must_use]
pub fn branch_name(issue: &Issue) -> String {
    let slug: String = slugify(&issue.title).chars().take(BRANCH_SLUG_CHARS).collect();
    let slug = slug.trim_end_matches('-');
    let id = slugify(issue.id.as_str());
    if slug.is_empty() {
        format!("fix/{id}")
    } else {
        format!("fix/{id}-{slug}")
    }
}

/// What `status` reports about one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Session id
    pub session: SessionId,
    /// Issue id
    pub issue: IssueId,
    /// Issue title
    pub title: String,
    /// Current state
    pub state: SessionState,
    /// Spend so far
    pub cost: Usd,
    /// Loop counters
    pub counters: RetryCounters,
    /// Branch, once created
    pub branch: Option<String>,
    /// Pull request URL, once opened
    pub pull_request: Option<String>,
    /// Most recent error
    pub last_error: Option<String>,
    /// Last change
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn branch_names_are_slugged_and_bounded() {
        let issue = Issue::new("I42", "Search results take forever to load on mobile", "", "teen");
        let branch = branch_name(&issue);
        assert!(branch.starts_with("fix/i42-search-results"));
        assert!(branch.len() <= "fix/i42-".len() + 30);
        assert!(!branch.ends_with('-'));
    }

    #[test]
    fn touched_files_merge_sources() {
        let issue = Issue::new("I1", "Crash in views.py", "", "grandma");
        let mut record = SessionRecord::new(SessionId::new(), issue);
        record.add_files(vec!["app.py".to_string(), "app.py".to_string()]);
        assert_eq!(record.artifacts.files_changed, vec!["app.py".to_string()]);
        assert_eq!(record.touched_files(), vec!["app.py".to_string(), "views.py".to_string()]);
    }

    #[test]
    fn log_entries_carry_state() {
        let mut record = SessionRecord::new(SessionId::new(), Issue::new("I1", "t", "d", "r"));
        record.log("oracle.strategy", "plan with 1 edit");
        assert_eq!(record.actions[0].summary(), "STRATEGIZING oracle.strategy: plan with 1 edit");
        assert_eq!(record.snapshot().state, SessionState::Strategizing);
    }
}
