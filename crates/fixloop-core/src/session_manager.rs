//! Session Manager: drives one fix session through the state machine
//!
//! Each session runs in its own task and advances serially: one oracle or
//! worker call in flight at a time. Oracle, worker and budget errors are
//! translated into transitions here and never reach the coordinator.
//!
//! Cancellation is cooperative. The flag is checked at every transition
//! boundary and between consecutive worker calls; an in-flight call always
//! completes first.

use crate::config::{MastermindConfig, SessionConfig};
use crate::egress::{Egress, Notification, NotificationKind, RateLimitedEgress};
use crate::error::{FailureKind, SessionFailure};
use crate::plan::{corrective_prompt, parse_plan, strategy_prompt, Feedback, StrategyInput};
use crate::session::{branch_name, ActionEntry, SessionRecord, SessionSnapshot};
use fixloop_kernel::{validate_transition, Issue, Oracle, OracleReply, SessionId, SessionState};
use fixloop_learning::{FailureSignature, LearningStore, LessonId, LessonNote, LessonQuery};
use fixloop_safety::{Caller, CommitReceipt, CostTracker, RateLimiter, Surface};
use fixloop_workers::{CiFailure, CiSnapshot, CiStatus, WorkerError, WorkerReport, WorkerSet, WorkerSettings};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::Instrument;

/// Diagnostic text kept in errors and notifications
const EXCERPT_CHARS: usize = 600;

type Step = Result<SessionState, SessionFailure>;

/// Shared handles every session uses
#[derive(Clone)]
pub struct SessionServices {
    /// Reasoning oracle
    pub oracle: Arc<dyn Oracle>,
    /// Worker set
    pub workers: WorkerSet,
    /// Spend ledger
    pub cost: Arc<CostTracker>,
    /// Rate windows
    pub rate: Arc<RateLimiter>,
    /// Lesson store
    pub learning: Arc<LearningStore>,
    /// Notifications
    pub egress: Arc<dyn Egress>,
}

impl SessionServices {
    /// Wire the shared services for `config`
    ///
    /// Egress is wrapped so every notification draws from the chat rate
    /// window of the same limiter the oracle calls use.
    #[must_use]
    pub fn from_config(
        config: &MastermindConfig,
        oracle: Arc<dyn Oracle>,
        workers: WorkerSet,
        learning: Arc<LearningStore>,
        egress: Arc<dyn Egress>,
    ) -> Self {
        let rate = Arc::new(RateLimiter::new(config.rate.oracle, config.rate.chat));
        Self {
            oracle,
            workers,
            cost: Arc::new(
                CostTracker::new(config.cost_limits(), config.pricing())
                    .with_retained_sessions(config.archive_limit),
            ),
            egress: Arc::new(RateLimitedEgress::new(egress, Arc::clone(&rate))),
            rate,
            learning,
        }
    }
}

impl std::fmt::Debug for SessionServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionServices")
            .field("cost", &self.cost)
            .field("rate", &self.rate)
            .field("learning", &self.learning)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct CancelState {
    requested: AtomicBool,
    wake: Notify,
}

/// Cooperative cancellation request
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<CancelState>);

impl CancelFlag {
    /// Request cancellation
    pub fn cancel(&self) {
        self.0.requested.store(true, Ordering::SeqCst);
        self.0.wake.notify_waiters();
    }

    /// Whether cancellation was requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.requested.load(Ordering::SeqCst)
    }

    /// Resolve once cancellation is requested
    pub async fn cancelled(&self) {
        loop {
            let woken = self.0.wake.notified();
            if self.is_cancelled() {
                return;
            }
            woken.await;
        }
    }
}

/// Final record of a finished session
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    /// Record in its terminal state
    pub record: SessionRecord,
}

impl SessionOutcome {
    /// Session id
    #[must_use]
    pub fn session(&self) -> SessionId {
        self.record.id()
    }

    /// Terminal state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.record.state
    }

    /// Failure, when not DONE
    #[must_use]
    pub fn failure(&self) -> Option<&SessionFailure> {
        self.record.failure.as_ref()
    }
}

enum CiVerdict {
    Green,
    Failed(CiSnapshot),
    TimedOut,
}

/// Runs one session to a terminal state
pub struct SessionManager {
    services: SessionServices,
    settings: SessionConfig,
    ci_timeout: Duration,
    ci_poll: Duration,
    record: SessionRecord,
    cancel: CancelFlag,
    snapshots: watch::Sender<SessionSnapshot>,
    feedback: Option<Feedback>,
    lint_findings: Option<Vec<CiFailure>>,
    needs_push: bool,
    oracle_attempts: u32,
    failed_in: Option<SessionState>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("session", &self.record.id())
            .field("state", &self.record.state)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// New session in STRATEGIZING, plus a receiver of its snapshots
    #[must_use]
    pub fn new(
        id: SessionId,
        issue: Issue,
        services: SessionServices,
        settings: SessionConfig,
        workers: &WorkerSettings,
        cancel: CancelFlag,
    ) -> (Self, watch::Receiver<SessionSnapshot>) {
        let record = SessionRecord::new(id, issue);
        let (snapshots, rx) = watch::channel(record.snapshot());
        let manager = Self {
            services,
            settings,
            ci_timeout: Duration::from_secs(workers.ci_timeout_secs),
            ci_poll: Duration::from_secs(workers.ci_poll_secs),
            record,
            cancel,
            snapshots,
            feedback: None,
            lint_findings: None,
            needs_push: false,
            oracle_attempts: 0,
            failed_in: None,
        };
        (manager, rx)
    }

    /// Override CI polling cadence
    #[must_use]
    pub fn with_ci_timing(mut self, timeout: Duration, poll: Duration) -> Self {
        self.ci_timeout = timeout;
        self.ci_poll = poll;
        self
    }

    /// Drive the session until DONE, FAILED or CANCELLED
    pub async fn run(self) -> SessionOutcome {
        let span = tracing::info_span!(
            "session",
            id = %self.record.id(),
            issue = %self.record.issue().id
        );
        self.drive().instrument(span).await
    }

    async fn drive(mut self) -> SessionOutcome {
        tracing::info!(title = %self.record.issue().title, "session started");
        while !self.record.state.is_terminal() {
            let state = self.record.state;
            let step = if self.cancel.is_cancelled() {
                Err(SessionFailure::cancelled())
            } else {
                self.step(state).await
            };
            let step = match step {
                Ok(next) if !next.is_terminal() && self.cancel.is_cancelled() => {
                    Err(SessionFailure::cancelled())
                }
                other => other,
            };
            match step {
                Ok(next) => self.transition(next).await,
                Err(failure) => self.terminate(failure),
            }
        }
        self.finish().await
    }

    async fn step(&mut self, state: SessionState) -> Step {
        match state {
            SessionState::Strategizing => self.strategize().await,
            SessionState::Editing => self.edit().await,
            SessionState::Testing => self.test().await,
            SessionState::Reviewing => self.review().await,
            SessionState::Merging => self.merge().await,
            terminal => Ok(terminal),
        }
    }

    async fn transition(&mut self, to: SessionState) {
        let from = self.record.state;
        if let Err(e) = validate_transition(from, to) {
            tracing::error!(error = %e, "state machine rejected transition");
            self.terminate(SessionFailure::new(FailureKind::Internal, e.to_string()));
            return;
        }
        self.record.state = to;
        self.record.log("transition", format!("{from} -> {to}"));
        tracing::info!(%from, %to, "session transition");
        self.publish_snapshot();
        if !to.is_terminal() {
            self.notify(
                NotificationKind::StateTransition { from, to },
                format!("{from} -> {to}"),
            )
            .await;
        }
    }

    fn terminate(&mut self, failure: SessionFailure) {
        let from = self.record.state;
        let to = if failure.kind == FailureKind::Cancelled {
            SessionState::Cancelled
        } else {
            SessionState::Failed
        };
        tracing::warn!(state = %from, kind = %failure.kind, reason = %failure.reason, "session stopping");
        self.failed_in = Some(from);
        self.record.note_error(failure.reason.clone());
        self.record.log("terminate", failure.to_string());
        self.record.failure = Some(failure);
        self.record.state = to;
        self.publish_snapshot();
    }

    fn check_cancel(&self) -> Result<(), SessionFailure> {
        if self.cancel.is_cancelled() {
            Err(SessionFailure::cancelled())
        } else {
            Ok(())
        }
    }

    fn publish_snapshot(&self) {
        self.snapshots.send_replace(self.record.snapshot());
    }

    async fn notify(&self, kind: NotificationKind, message: String) {
        let notification = Notification::new(self.record.issue().thread(), kind, message)
            .with_session(self.record.id());
        self.services.egress.publish(notification).await;
    }

    // STRATEGIZING

    async fn strategize(&mut self) -> Step {
        self.oracle_attempts = 0;
        let context = self.code_context().await?;
        let lessons = self.relevant_lessons();
        let prompt = strategy_prompt(StrategyInput {
            issue: self.record.issue(),
            context: &context,
            lessons: &lessons,
            feedback: self.feedback.as_ref(),
            previous: self.record.plan.as_ref(),
        });
        let max_tokens = self.settings.strategy_max_tokens;

        let reply = self.ask_oracle(&prompt, max_tokens).await?;
        let plan = match parse_plan(&reply.text) {
            Ok(plan) => plan,
            Err(err) => {
                tracing::warn!(error = %err, "unusable plan, sending corrective prompt");
                self.record.log("oracle.strategy", format!("rejected: {err}"));
                let retry = corrective_prompt(&prompt, &err);
                let reply = self.ask_oracle(&retry, max_tokens).await?;
                parse_plan(&reply.text).map_err(|err| {
                    SessionFailure::new(
                        FailureKind::ProtocolViolation,
                        format!("plan still unusable after correction: {err}"),
                    )
                    .with_class("unparsable_plan")
                })?
            }
        };

        self.record.counters.strategies += 1;
        self.record.log(
            "oracle.strategy",
            format!("{} edit(s): {}", plan.edits.len(), plan.summary),
        );
        tracing::info!(edits = plan.edits.len(), complexity = %plan.complexity, "plan accepted");
        self.record.plan = Some(plan);
        Ok(SessionState::Editing)
    }

    async fn code_context(&mut self) -> Result<String, SessionFailure> {
        let files = self.record.touched_files();
        if files.is_empty() {
            return Ok(String::new());
        }
        let workers = self.services.workers.clone();
        let artifacts = self.record.artifacts.clone();
        let report = with_retry(&self.settings, &self.cancel, "code.gather_context", || {
            workers.code.gather_context(&artifacts, &files)
        })
        .await?;
        if report.success {
            Ok(report.output)
        } else {
            self.record.note_error(excerpt(&report.output));
            Ok(String::new())
        }
    }

    fn relevant_lessons(&mut self) -> Vec<fixloop_learning::Lesson> {
        let mut query = LessonQuery::for_issue(
            self.record.issue().category.as_str(),
            self.record.touched_files(),
        );
        if self.feedback.is_some() {
            query = query.repairing(
                SessionState::Testing.as_str(),
                FailureKind::WorkerFailure.label(),
                Some("test_failure".to_string()),
            );
        }
        let lessons = self.services.learning.lookup(&query, self.settings.lesson_limit);
        let fresh: Vec<LessonId> = lessons
            .iter()
            .map(|l| l.id)
            .filter(|id| !self.record.applied_lessons.contains(id))
            .collect();
        if !fresh.is_empty() {
            if let Err(e) = self.services.learning.record_application(self.record.id(), &fresh) {
                tracing::warn!(error = %e, "could not record lesson application");
            }
            self.record.applied_lessons.extend(fresh);
        }
        lessons
    }

    /// Rate-limited, budget-checked oracle call with transient retries
    async fn ask_oracle(&mut self, prompt: &str, max_tokens: u32) -> Result<OracleReply, SessionFailure> {
        let id = self.record.id();
        loop {
            self.check_cancel()?;
            self.oracle_attempts += 1;
            tokio::select! {
                () = self.services.rate.wait(Surface::Oracle, Caller::Session(id)) => {}
                () = self.cancel.cancelled() => return Err(SessionFailure::cancelled()),
            }

            let min_tokens = self.settings.strategy_min_tokens;
            let reservation = match self.services.cost.reserve_call(id, prompt.len(), max_tokens, min_tokens) {
                Ok(reservation) => reservation,
                Err(denied) => {
                    tracing::warn!(error = %denied, "oracle call denied by budget");
                    return Err(denied.into());
                }
            };
            let allowance = reservation.max_output().unwrap_or(max_tokens);

            match self.services.oracle.ask(prompt, allowance).await {
                Ok(reply) => {
                    let receipt = self.services.cost.commit(reservation, reply.usage);
                    self.record.cost = receipt.session_total;
                    self.record.log(
                        "oracle.ask",
                        format!("{} tokens, {}", reply.usage.total(), receipt.charged),
                    );
                    if receipt.crossed_warning {
                        self.budget_warning(receipt).await;
                    }
                    return Ok(reply);
                }
                Err(err) => {
                    self.services.cost.release(reservation);
                    self.record.note_error(err.to_string());
                    if err.is_retryable() && self.oracle_attempts < self.settings.max_strategy_retries {
                        let delay = self.settings.backoff(self.oracle_attempts);
                        tracing::warn!(error = %err, attempt = self.oracle_attempts, delay_ms = delay.as_millis() as u64, "oracle unavailable, backing off");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(err.into());
                }
            }
        }
    }

    async fn budget_warning(&self, receipt: CommitReceipt) {
        let limits = self.services.cost.limits();
        let message = format!(
            "daily spend {} has crossed {:.0}% of the {} limit",
            receipt.daily_total,
            limits.warn_fraction * 100.0,
            limits.daily
        );
        tracing::warn!(daily = %receipt.daily_total, "daily budget warning");
        self.services
            .egress
            .publish(Notification::operator(NotificationKind::BudgetWarning, message))
            .await;
    }

    // EDITING

    async fn edit(&mut self) -> Step {
        let workers = self.services.workers.clone();

        if let Some(findings) = self.lint_findings.take() {
            let artifacts = self.record.artifacts.clone();
            let report = with_retry(&self.settings, &self.cancel, "code.fix_lint", || {
                workers.code.fix_lint(&artifacts, &findings)
            })
            .await?;
            self.record.log("code.fix_lint", outcome(&report));
            if !report.success {
                return Err(SessionFailure::worker(format!(
                    "lint repair failed: {}",
                    excerpt(&report.output)
                ))
                .with_class("lint_fix"));
            }
            self.record.add_files(report.files_changed());
            return Ok(SessionState::Testing);
        }

        if self.record.artifacts.branch.is_none() {
            let branch = branch_name(self.record.issue());
            let artifacts = self.record.artifacts.clone();
            let report = with_retry(&self.settings, &self.cancel, "git.create_branch", || {
                workers.source_control.create_branch(&artifacts, &branch)
            })
            .await?;
            self.record.log("git.create_branch", outcome(&report));
            if !report.success {
                return Err(SessionFailure::worker(format!(
                    "could not create branch {branch}: {}",
                    excerpt(&report.output)
                ))
                .with_class("branch"));
            }
            self.record.artifacts.branch = Some(branch);
            self.check_cancel()?;
        }

        let Some(plan) = self.record.plan.clone() else {
            return Err(SessionFailure::new(FailureKind::Internal, "no plan to apply"));
        };
        let artifacts = self.record.artifacts.clone();
        let report = with_retry(&self.settings, &self.cancel, "code.apply_edits", || {
            workers.code.apply_edits(&artifacts, &plan.edits)
        })
        .await?;
        self.record.log("code.apply_edits", outcome(&report));
        self.record.add_files(report.files_changed());
        if !report.success {
            return Err(SessionFailure::worker(format!(
                "edits could not be applied: {}",
                excerpt(&report.output)
            ))
            .with_class("edit_not_applied"));
        }
        Ok(SessionState::Testing)
    }

    // TESTING

    async fn test(&mut self) -> Step {
        let workers = self.services.workers.clone();
        let artifacts = self.record.artifacts.clone();
        self.record.counters.test_runs += 1;
        let report = with_retry(&self.settings, &self.cancel, "tests.run_tests", || {
            workers.tests.run_tests(&artifacts)
        })
        .await?;
        self.record.log("tests.run_tests", outcome(&report));

        if report.success {
            self.feedback = None;
            return Ok(SessionState::Reviewing);
        }

        self.record.note_error(excerpt(&report.output));
        if self.record.counters.repairs < self.settings.max_repair_attempts {
            self.record.counters.repairs += 1;
            tracing::info!(repair = self.record.counters.repairs, "tests failed, re-strategizing");
            self.feedback = Some(Feedback::TestFailure(report.output));
            return Ok(SessionState::Strategizing);
        }
        Err(SessionFailure::worker(format!(
            "tests still failing after {} repair attempt(s): {}",
            self.record.counters.repairs,
            excerpt(&report.output)
        ))
        .with_class("test_failure"))
    }

    // REVIEWING

    async fn review(&mut self) -> Step {
        let workers = self.services.workers.clone();
        let issue = self.record.issue().clone();

        if self.record.artifacts.commit.is_none() || self.needs_push {
            let message = format!("fix: {}\n\nResolves issue {}.", issue.title, issue.id);
            let artifacts = self.record.artifacts.clone();
            let report = with_retry(&self.settings, &self.cancel, "git.commit_and_push", || {
                workers.source_control.commit_and_push(&artifacts, &message)
            })
            .await?;
            self.record.log("git.commit_and_push", outcome(&report));
            if !report.success {
                return Err(SessionFailure::worker(format!("push failed: {}", excerpt(&report.output)))
                    .with_class("push"));
            }
            if let Some(sha) = report.commit() {
                self.record.artifacts.commit = Some(sha.to_string());
            }
            self.needs_push = false;
            self.check_cancel()?;
        }

        if self.record.artifacts.pull_request.is_none() {
            let title = format!("Fix: {}", issue.title);
            let body = self.pull_request_body();
            let artifacts = self.record.artifacts.clone();
            let report = with_retry(&self.settings, &self.cancel, "git.open_pull_request", || {
                workers.source_control.open_pull_request(&artifacts, &title, &body)
            })
            .await?;
            self.record.log("git.open_pull_request", outcome(&report));
            let Some(pr) = report.pull_request().filter(|_| report.success).cloned() else {
                return Err(SessionFailure::worker(format!(
                    "pull request not opened: {}",
                    excerpt(&report.output)
                ))
                .with_class("pull_request"));
            };
            tracing::info!(url = %pr.url, "pull request opened");
            self.record.artifacts.pull_request = Some(pr);
            self.publish_snapshot();
        }

        loop {
            match self.await_ci().await? {
                CiVerdict::Green => return Ok(SessionState::Merging),
                CiVerdict::Failed(snapshot) if snapshot.auto_fixable() => {
                    if self.record.counters.ci_fixes < self.settings.max_ci_fix_attempts {
                        self.record.counters.ci_fixes += 1;
                        tracing::info!(fix = self.record.counters.ci_fixes, "CI lint failure, repairing");
                        self.record.note_error(snapshot.describe());
                        self.lint_findings = Some(snapshot.failures);
                        self.needs_push = true;
                        return Ok(SessionState::Editing);
                    }
                    return Err(SessionFailure::worker(format!(
                        "CI lint failures persist after {} fix(es): {}",
                        self.record.counters.ci_fixes,
                        snapshot.describe()
                    ))
                    .with_class("lint"));
                }
                verdict => {
                    let (description, class) = match &verdict {
                        CiVerdict::Failed(snapshot) => (
                            snapshot.describe(),
                            snapshot
                                .failures
                                .iter()
                                .find(|f| !f.class.is_auto_fixable())
                                .map_or("ci_unknown".to_string(), |f| format!("ci_{}", f.class.as_str())),
                        ),
                        _ => ("CI did not finish in time".to_string(), "ci_timeout".to_string()),
                    };
                    self.record.note_error(description.clone());
                    if self.record.counters.ci_retries >= self.settings.max_ci_retries {
                        return Err(SessionFailure::worker(format!(
                            "CI still failing after {} re-run(s): {description}",
                            self.record.counters.ci_retries
                        ))
                        .with_class(class));
                    }
                    self.record.counters.ci_retries += 1;
                    let artifacts = self.record.artifacts.clone();
                    let report = with_retry(&self.settings, &self.cancel, "ci.rerun_failed", || {
                        workers.ci.rerun_failed(&artifacts)
                    })
                    .await?;
                    self.record.log("ci.rerun_failed", outcome(&report));
                    self.check_cancel()?;
                }
            }
        }
    }

    async fn await_ci(&mut self) -> Result<CiVerdict, SessionFailure> {
        let workers = self.services.workers.clone();
        let artifacts = self.record.artifacts.clone();
        let deadline = tokio::time::Instant::now() + self.ci_timeout;
        loop {
            self.check_cancel()?;
            let snapshot = with_retry(&self.settings, &self.cancel, "ci.poll", || {
                workers.ci.poll(&artifacts)
            })
            .await?;
            match snapshot.status {
                CiStatus::Green => {
                    self.record.log("ci.poll", "green");
                    return Ok(CiVerdict::Green);
                }
                CiStatus::Failed => {
                    self.record.log("ci.poll", format!("{} failed check(s)", snapshot.failures.len()));
                    return Ok(CiVerdict::Failed(snapshot));
                }
                CiStatus::Pending if tokio::time::Instant::now() >= deadline => {
                    self.record.log("ci.poll", "timed out");
                    return Ok(CiVerdict::TimedOut);
                }
                CiStatus::Pending => tokio::time::sleep(self.ci_poll).await,
            }
        }
    }

    fn pull_request_body(&self) -> String {
        let issue = self.record.issue();
        let mut body = format!(
            "Automated fix for issue {} reported by {}.\n\n**Severity:** {}\n**Category:** {}\n\n{}\n",
            issue.id,
            issue.reporter,
            issue.severity.as_str(),
            issue.category.as_str(),
            issue.description
        );
        if let Some(plan) = &self.record.plan {
            body.push_str(&format!("\n**Plan:** {}\n", plan.summary));
            for edit in &plan.edits {
                body.push_str(&format!("- `{}`: {}\n", edit.file, edit.description));
            }
        }
        body
    }

    // MERGING

    async fn merge(&mut self) -> Step {
        let workers = self.services.workers.clone();
        let artifacts = self.record.artifacts.clone();
        let report = with_retry(&self.settings, &self.cancel, "git.merge", || {
            workers.source_control.merge(&artifacts)
        })
        .await?;
        self.record.log("git.merge", outcome(&report));
        if !report.success {
            return Err(SessionFailure::worker(format!("merge failed: {}", excerpt(&report.output)))
                .with_class("merge"));
        }

        if self.settings.redeploy_after_merge {
            self.check_cancel()?;
            let report = with_retry(&self.settings, &self.cancel, "containers.rebuild", || {
                workers.containers.rebuild(&artifacts)
            })
            .await?;
            self.record.log("containers.rebuild", outcome(&report));
            if !report.success {
                return Err(SessionFailure::worker(format!(
                    "redeploy failed: {}",
                    excerpt(&report.output)
                ))
                .with_class("redeploy"));
            }
        }
        Ok(SessionState::Done)
    }

    // Terminal

    async fn finish(mut self) -> SessionOutcome {
        let state = self.record.state;
        match state {
            SessionState::Failed => {
                self.rollback().await;
                self.record_lesson();
            }
            SessionState::Cancelled => self.record_lesson(),
            _ => {}
        }
        if let Err(e) = self
            .services
            .learning
            .record_outcome(self.record.id(), state == SessionState::Done)
        {
            tracing::warn!(error = %e, "could not record lesson outcome");
        }
        self.publish_snapshot();

        let message = self.terminal_message();
        tracing::info!(%state, cost = %self.record.cost, "session finished");
        self.notify(NotificationKind::SessionTerminal { state }, message).await;
        SessionOutcome {
            record: self.record,
        }
    }

    async fn rollback(&mut self) {
        if self.record.artifacts.branch.is_none() {
            return;
        }
        let artifacts = self.record.artifacts.clone();
        match self.services.workers.source_control.rollback(&artifacts).await {
            Ok(report) => self.record.log("git.rollback", outcome(&report)),
            Err(e) => {
                tracing::warn!(error = %e, "rollback failed");
                self.record.log("git.rollback", format!("error: {e}"));
            }
        }
    }

    fn record_lesson(&mut self) {
        let failure = self.record.failure.clone().unwrap_or_else(|| {
            SessionFailure::new(FailureKind::Internal, "terminated without a recorded failure")
        });
        let stage = self.failed_in.unwrap_or(SessionState::Strategizing);
        let mut signature = FailureSignature::new(
            stage.as_str(),
            failure.kind.label(),
            self.record.issue().category.as_str(),
            self.record.touched_files(),
        );
        if let Some(class) = &failure.error_class {
            signature = signature.with_error_class(class.clone());
        }
        let note = LessonNote {
            session: self.record.id(),
            issue: self.record.issue().id.clone(),
            guidance: guidance(stage, &failure, &self.record),
            actions: self.record.actions.iter().map(ActionEntry::summary).collect(),
        };
        match self.services.learning.record(signature, note) {
            Ok(id) => self.record.lesson = Some(id),
            Err(e) => tracing::error!(error = %e, "could not persist lesson"),
        }
    }

    fn terminal_message(&self) -> String {
        let issue = self.record.issue();
        match (self.record.state, &self.record.failure) {
            (SessionState::Done, _) => {
                let pr = self
                    .record
                    .artifacts
                    .pull_request
                    .as_ref()
                    .map_or(String::new(), |pr| format!(" ({})", pr.url));
                format!("DONE: fix for {} merged{pr}, cost {}", issue.id, self.record.cost)
            }
            (state, Some(failure)) => format!(
                "{state}: {} gave up in {} ({}): {}",
                issue.id,
                self.failed_in.unwrap_or(SessionState::Strategizing),
                failure.kind,
                failure.reason
            ),
            (state, None) => format!("{state}: {}", issue.id),
        }
    }
}

/// Guidance written into a lesson
fn guidance(stage: SessionState, failure: &SessionFailure, record: &SessionRecord) -> String {
    let files = record.touched_files();
    let files = if files.is_empty() {
        "the affected files".to_string()
    } else {
        files.join(", ")
    };
    match (failure.kind, failure.error_class.as_deref()) {
        (FailureKind::Cancelled, _) => format!(
            "An operator cancelled a fix for this kind of issue during {stage}; confirm the approach matches the report before editing {files}."
        ),
        (_, Some("test_failure")) => format!(
            "Tests kept failing after {} repair attempt(s) on {files}. Read the failing assertions and the code under test before planning, and keep edits minimal.",
            record.counters.repairs
        ),
        (_, Some("edit_not_applied")) => format!(
            "Planned edits did not match {files}. Copy old_code verbatim from the current file contents and make each old_code unique."
        ),
        (_, Some("lint" | "lint_fix")) => {
            "CI formatting or lint checks kept failing. Produce code already formatted in the project's style.".to_string()
        }
        (FailureKind::ProtocolViolation, _) => {
            "Answer strategy prompts with exactly one JSON object containing at least one edit.".to_string()
        }
        (FailureKind::BudgetExceeded, _) => format!(
            "The fix ran out of budget after {} strategy attempt(s). Prefer a smaller plan that touches fewer files.",
            record.counters.strategies
        ),
        (FailureKind::PolicyRefusal, _) => {
            "The oracle refused the request. Describe the issue neutrally and leave out exploit detail.".to_string()
        }
        _ => format!("{stage} failed ({}): {}", failure.kind, excerpt(&failure.reason)),
    }
}

/// Worker call with idempotent-safe retries on `Unavailable`
async fn with_retry<T, F, Fut>(
    settings: &SessionConfig,
    cancel: &CancelFlag,
    op: &str,
    mut call: F,
) -> Result<T, SessionFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, WorkerError>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < settings.max_transient_retries => {
                attempt += 1;
                let delay = settings.backoff(attempt);
                tracing::warn!(op, attempt, error = %err, delay_ms = delay.as_millis() as u64, "worker unavailable, retrying");
                tokio::time::sleep(delay).await;
                if cancel.is_cancelled() {
                    return Err(SessionFailure::cancelled());
                }
            }
            Err(err) => {
                tracing::warn!(op, error = %err, "worker call failed");
                return Err(err.into());
            }
        }
    }
}

fn outcome(report: &WorkerReport) -> String {
    let verdict = if report.success { "ok" } else { "failed" };
    let first_line = report.output.lines().next().unwrap_or_default();
    if first_line.is_empty() {
        verdict.to_string()
    } else {
        format!("{verdict}: {}", first_line.chars().take(120).collect::<String>())
    }
}

/// Tail of a diagnostic
fn excerpt(text: &str) -> String {
    let text = text.trim();
    let count = text.chars().count();
    if count <= EXCERPT_CHARS {
        text.to_string()
    } else {
        format!("...{}", text.chars().skip(count - EXCERPT_CHARS).collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excerpt_keeps_tail() {
        let long = format!("{}END", "x".repeat(2000));
        let cut = excerpt(&long);
        assert!(cut.starts_with("..."));
        assert!(cut.ends_with("END"));
        assert_eq!(cut.chars().count(), EXCERPT_CHARS + 3);
    }

    #[test]
    fn outcome_is_first_line() {
        assert_eq!(outcome(&WorkerReport::ok("")), "ok");
        assert_eq!(outcome(&WorkerReport::failed("2 failed\nmore")), "failed: 2 failed");
    }

    #[test]
    fn cancel_flag_is_shared() {
        let flag = CancelFlag::default();
        let other = flag.clone();
        assert!(!flag.is_cancelled());
        other.cancel();
        assert!(flag.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_wakes_waiters() {
        let flag = CancelFlag::default();
        let waiter = tokio::spawn({
            let flag = flag.clone();
            async move { flag.cancelled().await }
        });
        tokio::task::yield_now().await;
        flag.cancel();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        // Already cancelled: resolves at once.
        flag.cancelled().await;
    }

    #[tokio::test(start_paused = true)]
    async fn retries_only_transient_worker_errors() {
        let settings = SessionConfig::default();
        let cancel = CancelFlag::default();

        let mut calls = 0;
        let result: Result<u32, _> = with_retry(&settings, &cancel, "op", || {
            calls += 1;
            let n = calls;
            async move {
                if n < 3 {
                    Err(WorkerError::Unavailable("flaky".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);

        let mut calls = 0;
        let result: Result<u32, _> = with_retry(&settings, &cancel, "op", || {
            calls += 1;
            async { Err(WorkerError::Invocation("missing".into())) }
        })
        .await;
        assert_eq!(result.unwrap_err().kind, FailureKind::WorkerFailure);
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_give_up_after_cap() {
        let settings = SessionConfig::default();
        let cancel = CancelFlag::default();
        let mut calls = 0;
        let result: Result<(), _> = with_retry(&settings, &cancel, "op", || {
            calls += 1;
            async { Err(WorkerError::Unavailable("down".into())) }
        })
        .await;
        assert_eq!(result.unwrap_err().kind, FailureKind::TransientExternal);
        assert_eq!(calls, settings.max_transient_retries + 1);
    }
}
