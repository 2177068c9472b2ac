//! Testing utilities for the Fixloop workspace
//!
//! Scripted oracle, in-process workers, a recording egress and a harness
//! that wires them into a [`Coordinator`].

#![allow(missing_docs)]

use async_trait::async_trait;
use fixloop_core::{
    Coordinator, Egress, MastermindConfig, Notification, NotificationKind, SessionConfig,
    SessionServices,
};
use fixloop_kernel::{Issue, Oracle, OracleError, OracleReply, SessionId, SessionState, TokenUsage};
use fixloop_learning::LearningStore;
use fixloop_safety::{CostTracker, RateLimit};
use fixloop_workers::{
    Artifact, CiFailure, CiFailureClass, CiMonitor, CiSnapshot, CodeEditor, ContainerRebuild,
    FileEdit, PullRequest, SessionArtifacts, SourceControl, TestRunner, WorkerError,
    WorkerReport, WorkerSet, WorkerSettings,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

// Oracle

/// Plan reply editing `file`
pub fn valid_plan_json(file: &str) -> String {
    serde_json::json!({
        "summary": format!("guard the empty case in {file}"),
        "complexity": "low",
        "files_affected": [file],
        "edits": [{
            "file": file,
            "description": "return early on empty input",
            "old_code": "def search(q):",
            "new_code": "def search(q):\n    if not q:\n        return []",
        }],
    })
    .to_string()
}

/// Oracle answering from a script, then with a fallback reply
#[derive(Debug)]
pub struct ScriptedOracle {
    script: Mutex<VecDeque<Result<String, OracleError>>>,
    fallback: String,
    usage: TokenUsage,
    usage_script: Mutex<VecDeque<TokenUsage>>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    allowances: Mutex<Vec<u32>>,
}

impl ScriptedOracle {
    /// Always answer `text`
    pub fn always(text: impl Into<String>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: text.into(),
            usage: TokenUsage::new(1_000, 500),
            usage_script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            allowances: Mutex::new(Vec::new()),
        }
    }

    /// Always answer with a valid plan for `app.py`
    pub fn planning() -> Self {
        Self::always(valid_plan_json("app.py"))
    }

    /// Answer `reply` before falling back
    pub fn then(self, reply: Result<String, OracleError>) -> Self {
        self.script.lock().push_back(reply);
        self
    }

    /// Report `usage` for every answer
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    /// Report `usages` for successive answers, then the fixed usage
    pub fn with_usages(self, usages: impl IntoIterator<Item = TokenUsage>) -> Self {
        self.usage_script.lock().extend(usages);
        self
    }

    /// `max_tokens` of every call, in order
    pub fn allowances(&self) -> Vec<u32> {
        self.allowances.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn ask(&self, prompt: &str, max_tokens: u32) -> Result<OracleReply, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(prompt.to_string());
        self.allowances.lock().push(max_tokens);
        let usage = self.usage_script.lock().pop_front().unwrap_or(self.usage);
        let next = self.script.lock().pop_front();
        let text = next.unwrap_or_else(|| Ok(self.fallback.clone()))?;
        Ok(OracleReply { text, usage })
    }
}

// Workers

/// Pause point inside `apply_edits`
#[derive(Debug, Default)]
pub struct EditGate {
    /// Signalled when an edit call arrives
    pub entered: Notify,
    /// Signal to let the edit call finish
    pub release: Notify,
}

/// All five workers in memory, with a call log
#[derive(Debug)]
pub struct StubWorkers {
    calls: Mutex<Vec<&'static str>>,
    test_script: Mutex<VecDeque<bool>>,
    tests_pass: bool,
    ci_script: Mutex<VecDeque<CiSnapshot>>,
    gate: Option<Arc<EditGate>>,
    commits: AtomicUsize,
}

impl Default for StubWorkers {
    fn default() -> Self {
        Self::passing()
    }
}

impl StubWorkers {
    /// Tests pass, CI is green
    pub fn passing() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            test_script: Mutex::new(VecDeque::new()),
            tests_pass: true,
            ci_script: Mutex::new(VecDeque::new()),
            gate: None,
            commits: AtomicUsize::new(0),
        }
    }

    /// Tests always fail
    pub fn failing_tests() -> Self {
        Self {
            tests_pass: false,
            ..Self::passing()
        }
    }

    /// Test outcomes in order, then `fallback`
    pub fn with_test_results(mut self, results: impl IntoIterator<Item = bool>, fallback: bool) -> Self {
        self.test_script = Mutex::new(results.into_iter().collect());
        self.tests_pass = fallback;
        self
    }

    /// CI polls answered in order, then green
    pub fn with_ci(self, snapshots: impl IntoIterator<Item = CiSnapshot>) -> Self {
        self.ci_script.lock().extend(snapshots);
        self
    }

    /// Hold every `apply_edits` at `gate`
    pub fn with_gate(mut self, gate: Arc<EditGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Worker set backed by this stub
    pub fn worker_set(self: &Arc<Self>) -> WorkerSet {
        WorkerSet {
            source_control: self.clone(),
            code: self.clone(),
            tests: self.clone(),
            containers: self.clone(),
            ci: self.clone(),
        }
    }

    fn record(&self, op: &'static str) {
        self.calls.lock().push(op);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls.lock().iter().filter(|c| **c == op).count()
    }
}

/// Failed lint check on `file`
pub fn lint_failure(file: &str) -> CiSnapshot {
    CiSnapshot::failed(vec![CiFailure {
        check: "ruff".to_string(),
        class: CiFailureClass::Lint,
        file: Some(file.to_string()),
        message: "E501 line too long".to_string(),
    }])
}

#[async_trait]
impl SourceControl for StubWorkers {
    async fn create_branch(
        &self,
        _artifacts: &SessionArtifacts,
        branch: &str,
    ) -> Result<WorkerReport, WorkerError> {
        self.record("create_branch");
        Ok(WorkerReport::ok("switched").with_artifact(Artifact::Branch {
            name: branch.to_string(),
        }))
    }

    async fn commit_and_push(
        &self,
        _artifacts: &SessionArtifacts,
        _message: &str,
    ) -> Result<WorkerReport, WorkerError> {
        self.record("commit_and_push");
        let n = self.commits.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(WorkerReport::ok("pushed").with_artifact(Artifact::Commit {
            sha: format!("c0ffee{n:02}"),
        }))
    }

    async fn open_pull_request(
        &self,
        _artifacts: &SessionArtifacts,
        _title: &str,
        _body: &str,
    ) -> Result<WorkerReport, WorkerError> {
        self.record("open_pull_request");
        Ok(WorkerReport::ok("opened").with_artifact(Artifact::PullRequest(PullRequest {
            number: 7,
            url: "https://git.example/pulls/7".to_string(),
        })))
    }

    async fn merge(&self, _artifacts: &SessionArtifacts) -> Result<WorkerReport, WorkerError> {
        self.record("merge");
        Ok(WorkerReport::ok("merged"))
    }

    async fn rollback(&self, _artifacts: &SessionArtifacts) -> Result<WorkerReport, WorkerError> {
        self.record("rollback");
        Ok(WorkerReport::ok("rolled back"))
    }
}

#[async_trait]
impl CodeEditor for StubWorkers {
    async fn gather_context(
        &self,
        _artifacts: &SessionArtifacts,
        files: &[String],
    ) -> Result<WorkerReport, WorkerError> {
        self.record("gather_context");
        Ok(WorkerReport::ok(
            files.iter().map(|f| format!("=== {f} ===\ndef search(q):\n    pass\n")).collect::<String>(),
        ))
    }

    async fn apply_edits(
        &self,
        _artifacts: &SessionArtifacts,
        edits: &[FileEdit],
    ) -> Result<WorkerReport, WorkerError> {
        self.record("apply_edits");
        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        Ok(edits.iter().fold(WorkerReport::ok("applied"), |report, edit| {
            report.with_artifact(Artifact::FileChanged {
                path: edit.file.clone(),
            })
        }))
    }

    async fn fix_lint(
        &self,
        _artifacts: &SessionArtifacts,
        findings: &[CiFailure],
    ) -> Result<WorkerReport, WorkerError> {
        self.record("fix_lint");
        Ok(findings
            .iter()
            .filter_map(|f| f.file.clone())
            .fold(WorkerReport::ok("formatted"), |report, path| {
                report.with_artifact(Artifact::FileChanged { path })
            }))
    }
}

#[async_trait]
impl TestRunner for StubWorkers {
    async fn run_tests(&self, _artifacts: &SessionArtifacts) -> Result<WorkerReport, WorkerError> {
        self.record("run_tests");
        let pass = self.test_script.lock().pop_front().unwrap_or(self.tests_pass);
        Ok(if pass {
            WorkerReport::ok("5 passed")
        } else {
            WorkerReport::failed("FAILED tests/test_search.py::test_empty - AssertionError")
                .with_artifact(Artifact::FailedTest {
                    name: "tests/test_search.py::test_empty".to_string(),
                })
        })
    }
}

#[async_trait]
impl ContainerRebuild for StubWorkers {
    async fn rebuild(&self, _artifacts: &SessionArtifacts) -> Result<WorkerReport, WorkerError> {
        self.record("rebuild");
        Ok(WorkerReport::ok("healthy"))
    }
}

#[async_trait]
impl CiMonitor for StubWorkers {
    async fn poll(&self, _artifacts: &SessionArtifacts) -> Result<CiSnapshot, WorkerError> {
        self.record("ci_poll");
        Ok(self.ci_script.lock().pop_front().unwrap_or_else(CiSnapshot::green))
    }

    async fn rerun_failed(&self, _artifacts: &SessionArtifacts) -> Result<WorkerReport, WorkerError> {
        self.record("ci_rerun");
        Ok(WorkerReport::ok("re-run requested"))
    }
}

// Egress

/// Keeps every notification
#[derive(Debug, Default)]
pub struct RecordingEgress {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingEgress {
    pub fn notifications(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }

    /// Terminal notifications for `session`
    pub fn terminal_for(&self, session: SessionId) -> Vec<Notification> {
        self.sent
            .lock()
            .iter()
            .filter(|n| n.is_terminal() && n.session == Some(session))
            .cloned()
            .collect()
    }

    /// Sessions in the order they were created
    pub fn created_sessions(&self) -> Vec<SessionId> {
        self.sent
            .lock()
            .iter()
            .filter(|n| n.kind == NotificationKind::SessionCreated)
            .filter_map(|n| n.session)
            .collect()
    }

    /// Transition targets for `session`, in order
    pub fn transitions_for(&self, session: SessionId) -> Vec<SessionState> {
        self.sent
            .lock()
            .iter()
            .filter(|n| n.session == Some(session))
            .filter_map(|n| match n.kind {
                NotificationKind::StateTransition { to, .. } => Some(to),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Egress for RecordingEgress {
    async fn publish(&self, notification: Notification) {
        self.sent.lock().push(notification);
    }
}

// Fixtures

/// Issue mentioning `app.py`
pub fn issue(id: &str) -> Issue {
    Issue::new(
        id,
        format!("Search returns nothing ({id})"),
        "Searching for an empty string crashes app.py instead of showing results",
        "teen",
    )
}

/// Configuration with fast retries, immediate CI polling and no rate pressure
pub fn test_config() -> MastermindConfig {
    let unlimited = RateLimit {
        limit: 100_000,
        window_secs: 60,
        per_session_cap: 100_000,
    };
    let mut config = MastermindConfig::new().with_session(SessionConfig {
        backoff_base_ms: 1,
        ..SessionConfig::default()
    });
    config.workers = WorkerSettings {
        ci_poll_secs: 0,
        ci_timeout_secs: 1,
        ..WorkerSettings::default()
    };
    config.rate.oracle = unlimited;
    config.rate.chat = unlimited;
    config.tick_interval_ms = 5;
    config.cost_summary_interval_secs = 0;
    config
}

/// Coordinator wired to in-memory collaborators
pub struct Harness {
    pub coordinator: Coordinator,
    pub oracle: Arc<ScriptedOracle>,
    pub workers: Arc<StubWorkers>,
    pub egress: Arc<RecordingEgress>,
    pub learning: Arc<LearningStore>,
    pub cost: Arc<CostTracker>,
}

impl Harness {
    pub fn new(config: MastermindConfig, oracle: ScriptedOracle, workers: StubWorkers) -> Self {
        Self::with_learning(config, oracle, workers, LearningStore::in_memory())
    }

    /// Harness over an existing lesson store
    pub fn with_learning(
        config: MastermindConfig,
        oracle: ScriptedOracle,
        workers: StubWorkers,
        learning: LearningStore,
    ) -> Self {
        let oracle = Arc::new(oracle);
        let workers = Arc::new(workers);
        let egress = Arc::new(RecordingEgress::default());
        let learning = Arc::new(learning);
        let services = SessionServices::from_config(
            &config,
            oracle.clone(),
            workers.worker_set(),
            learning.clone(),
            egress.clone(),
        );
        let cost = services.cost.clone();
        Self {
            coordinator: Coordinator::new(config, services),
            oracle,
            workers,
            egress,
            learning,
            cost,
        }
    }

    /// Passing workers, planning oracle, [`test_config`]
    pub fn happy() -> Self {
        Self::new(test_config(), ScriptedOracle::planning(), StubWorkers::passing())
    }
}

impl std::fmt::Debug for Harness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Harness").field("coordinator", &self.coordinator).finish_non_exhaustive()
    }
}
