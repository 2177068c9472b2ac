//! Coordinator: admission, the FIFO queue, live-session bookkeeping
//!
//! Owned by one task. Sessions run as spawned tasks; the coordinator only
//! holds their cancel flags and snapshot receivers, and reaps them through a
//! [`JoinSet`] when they finish.

use crate::config::MastermindConfig;
use crate::egress::{Egress, Notification, NotificationKind};
use crate::error::{CoordinatorError, FailureKind, SessionFailure};
use crate::ingress::{IngressMessage, OperatorCommand};
use crate::session::SessionSnapshot;
use crate::session_manager::{CancelFlag, SessionManager, SessionOutcome, SessionServices};
use fixloop_kernel::{Issue, IssueId, SessionId, SessionState, ThreadId};
use fixloop_safety::UsageSummary;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Why an issue was not admitted immediately
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferReason {
    /// Coordinator is paused
    Paused,
    /// Live-session limit reached
    ConcurrencyLimit,
    /// Earlier issues are still waiting
    QueueAhead,
}

/// Why an issue was refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    /// A session for this issue is live or queued
    Duplicate {
        /// Live session, when there is one
        session: Option<SessionId>,
    },
    /// Daily budget exhausted
    BudgetExhausted,
    /// Issue failed validation
    Invalid {
        /// What is wrong
        detail: String,
    },
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Duplicate { session: Some(id) } => write!(f, "already being fixed by session {id}"),
            Self::Duplicate { session: None } => f.write_str("already queued"),
            Self::BudgetExhausted => f.write_str("daily budget exhausted"),
            Self::Invalid { detail } => write!(f, "invalid issue: {detail}"),
        }
    }
}

/// Result of `submit`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Session started
    Accepted(SessionId),
    /// Waiting in the FIFO queue
    Queued {
        /// Why it is waiting
        reason: DeferReason,
        /// 1-based position
        position: usize,
    },
    /// Refused
    Rejected(RejectReason),
}

impl Admission {
    /// Session id when accepted
    #[must_use]
    pub fn session(&self) -> Option<SessionId> {
        match self {
            Self::Accepted(id) => Some(*id),
            _ => None,
        }
    }
}

/// Terminal sessions kept for `status` and `retry`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedCounts {
    /// DONE
    pub done: u64,
    /// FAILED
    pub failed: u64,
    /// CANCELLED
    pub cancelled: u64,
}

/// Answer to `status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Admission paused
    pub paused: bool,
    /// Issues waiting, in admission order
    pub queued: Vec<IssueId>,
    /// Live sessions
    pub live: Vec<SessionSnapshot>,
    /// Finished sessions by outcome
    pub completed: CompletedCounts,
    /// Spend
    pub cost: UsageSummary,
}

impl StatusSnapshot {
    /// Issues waiting
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.queued.len()
    }

    /// One-line summary for chat
    #[must_use]
    pub fn headline(&self) -> String {
        format!(
            "{} live, {} queued{}; done {} / failed {} / cancelled {}; today {} of {}",
            self.live.len(),
            self.queued.len(),
            if self.paused { " (paused)" } else { "" },
            self.completed.done,
            self.completed.failed,
            self.completed.cancelled,
            self.cost.daily_spend,
            self.cost.daily_limit
        )
    }
}

struct LiveSession {
    issue: IssueId,
    cancel: CancelFlag,
    snapshot: watch::Receiver<SessionSnapshot>,
}

struct Archived {
    issue: Issue,
    state: SessionState,
    failure: Option<SessionFailure>,
}

/// Admission control and supervision of live sessions
pub struct Coordinator {
    config: MastermindConfig,
    services: SessionServices,
    paused: bool,
    queue: VecDeque<Issue>,
    live: HashMap<SessionId, LiveSession>,
    live_issues: HashMap<IssueId, SessionId>,
    tasks: JoinSet<SessionOutcome>,
    task_sessions: HashMap<tokio::task::Id, SessionId>,
    archive: HashMap<SessionId, Archived>,
    finished: VecDeque<SessionId>,
    completed: CompletedCounts,
    last_cost_summary: Instant,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("paused", &self.paused)
            .field("queued", &self.queue.len())
            .field("live", &self.live.len())
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Create coordinator; nothing runs until issues are submitted
    #[must_use]
    pub fn new(config: MastermindConfig, services: SessionServices) -> Self {
        Self {
            config,
            services,
            paused: false,
            queue: VecDeque::new(),
            live: HashMap::new(),
            live_issues: HashMap::new(),
            tasks: JoinSet::new(),
            task_sessions: HashMap::new(),
            archive: HashMap::new(),
            finished: VecDeque::new(),
            completed: CompletedCounts::default(),
            last_cost_summary: Instant::now(),
        }
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &MastermindConfig {
        &self.config
    }

    /// Whether admission is paused
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Live session count
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Issues waiting
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    /// Live session for an issue
    #[must_use]
    pub fn session_for(&self, issue: &IssueId) -> Option<SessionId> {
        self.live_issues.get(issue).copied()
    }

    /// Admit, queue or reject an issue
    pub async fn submit(&mut self, issue: Issue) -> Admission {
        let admission = self.admit_or_queue(issue.clone());
        let thread = issue.thread();
        let notification = match &admission {
            Admission::Accepted(id) => Notification::new(
                thread,
                NotificationKind::SessionCreated,
                format!("session {id} started for {}: {}", issue.id, issue.title),
            )
            .with_session(*id),
            Admission::Queued { reason, position } => Notification::new(
                thread,
                NotificationKind::Queued { position: *position },
                format!("{} queued at position {position} ({reason:?})", issue.id),
            ),
            Admission::Rejected(reason) => Notification::new(
                thread,
                NotificationKind::Rejected,
                format!("{} rejected: {reason}", issue.id),
            )
            .with_detail(reason),
        };
        self.services.egress.publish(notification).await;
        admission
    }

    fn admit_or_queue(&mut self, issue: Issue) -> Admission {
        if let Err(detail) = issue.validate() {
            return Admission::Rejected(RejectReason::Invalid { detail });
        }
        if let Some(session) = self.live_issues.get(&issue.id) {
            tracing::info!(issue = %issue.id, %session, "duplicate issue rejected");
            return Admission::Rejected(RejectReason::Duplicate {
                session: Some(*session),
            });
        }
        if self.queue.iter().any(|q| q.id == issue.id) {
            return Admission::Rejected(RejectReason::Duplicate { session: None });
        }
        if self.services.cost.daily_exhausted() {
            tracing::warn!(issue = %issue.id, "daily budget exhausted, issue rejected");
            return Admission::Rejected(RejectReason::BudgetExhausted);
        }

        let reason = if self.paused {
            Some(DeferReason::Paused)
        } else if !self.queue.is_empty() {
            Some(DeferReason::QueueAhead)
        } else if self.live.len() >= self.config.max_live_sessions {
            Some(DeferReason::ConcurrencyLimit)
        } else {
            None
        };
        match reason {
            Some(reason) => {
                tracing::info!(issue = %issue.id, ?reason, "issue queued");
                self.queue.push_back(issue);
                Admission::Queued {
                    reason,
                    position: self.queue.len(),
                }
            }
            None => Admission::Accepted(self.start(issue)),
        }
    }

    fn start(&mut self, issue: Issue) -> SessionId {
        let id = SessionId::new();
        let cancel = CancelFlag::default();
        let (manager, snapshot) = SessionManager::new(
            id,
            issue.clone(),
            self.services.clone(),
            self.config.session.clone(),
            &self.config.workers,
            cancel.clone(),
        );
        let handle = self.tasks.spawn(manager.run());
        self.task_sessions.insert(handle.id(), id);
        self.live_issues.insert(issue.id.clone(), id);
        self.live.insert(
            id,
            LiveSession {
                issue: issue.id.clone(),
                cancel,
                snapshot,
            },
        );
        self.archive.insert(
            id,
            Archived {
                issue,
                state: SessionState::Strategizing,
                failure: None,
            },
        );
        tracing::info!(session = %id, live = self.live.len(), "session admitted");
        id
    }

    /// Reap finished sessions, admit from the queue, emit due summaries.
    ///
    /// Live sessions advance on their own tasks; `tick` never blocks on them.
    pub async fn tick(&mut self) {
        while let Some(joined) = self.tasks.try_join_next_with_id() {
            self.reap(joined).await;
        }
        self.admit_from_queue().await;
        self.maybe_cost_summary().await;
    }

    async fn reap(&mut self, joined: Result<(tokio::task::Id, SessionOutcome), tokio::task::JoinError>) {
        match joined {
            Ok((task, outcome)) => {
                self.task_sessions.remove(&task);
                self.retire(outcome.session(), outcome.state(), outcome.record.failure.clone());
            }
            Err(err) => {
                let Some(session) = self.task_sessions.remove(&err.id()) else {
                    tracing::error!(error = %err, "unknown session task ended abnormally");
                    return;
                };
                tracing::error!(%session, error = %err, "session task ended abnormally");
                let failure = SessionFailure::new(FailureKind::Internal, format!("session task ended abnormally: {err}"));
                let thread = self
                    .live
                    .get(&session)
                    .map_or_else(ThreadId::operator, |l| ThreadId::for_issue(&l.issue));
                let message = format!("FAILED: session {session}: {}", failure.reason);
                self.retire(session, SessionState::Failed, Some(failure));
                self.services
                    .egress
                    .publish(
                        Notification::new(
                            thread,
                            NotificationKind::SessionTerminal {
                                state: SessionState::Failed,
                            },
                            message,
                        )
                        .with_session(session),
                    )
                    .await;
            }
        }
    }

    fn retire(&mut self, session: SessionId, state: SessionState, failure: Option<SessionFailure>) {
        if let Some(live) = self.live.remove(&session) {
            self.live_issues.remove(&live.issue);
        }
        match state {
            SessionState::Done => self.completed.done += 1,
            SessionState::Cancelled => self.completed.cancelled += 1,
            _ => self.completed.failed += 1,
        }
        if let Some(archived) = self.archive.get_mut(&session) {
            archived.state = state;
            archived.failure = failure;
        }
        self.services.cost.close_session(session);
        self.finished.push_back(session);
        while self.finished.len() > self.config.archive_limit {
            if let Some(oldest) = self.finished.pop_front() {
                self.archive.remove(&oldest);
            }
        }
        tracing::info!(%session, %state, live = self.live.len(), "session retired");
    }

    async fn admit_from_queue(&mut self) {
        while !self.paused && self.live.len() < self.config.max_live_sessions {
            if self.services.cost.daily_exhausted() {
                break;
            }
            let Some(issue) = self.queue.pop_front() else {
                break;
            };
            if self.live_issues.contains_key(&issue.id) {
                // Submitted again after a session for it started; drop the copy.
                continue;
            }
            let id = self.start(issue.clone());
            self.services
                .egress
                .publish(
                    Notification::new(
                        issue.thread(),
                        NotificationKind::SessionCreated,
                        format!("session {id} started for queued {}: {}", issue.id, issue.title),
                    )
                    .with_session(id),
                )
                .await;
        }
    }

    async fn maybe_cost_summary(&mut self) {
        let interval = self.config.cost_summary_interval_secs;
        if interval == 0 || self.last_cost_summary.elapsed() < Duration::from_secs(interval) {
            return;
        }
        self.last_cost_summary = Instant::now();
        let summary = self.cost();
        self.services
            .egress
            .publish(
                Notification::operator(
                    NotificationKind::CostSummary,
                    format!(
                        "spent {} today of {} ({} calls)",
                        summary.daily_spend, summary.daily_limit, summary.calls
                    ),
                )
                .with_detail(&summary),
            )
            .await;
    }

    /// Stop admitting new sessions; live sessions continue
    pub fn pause(&mut self) {
        self.paused = true;
        tracing::info!("admission paused");
    }

    /// Admit again, queued issues first in arrival order
    pub async fn resume(&mut self) {
        self.paused = false;
        tracing::info!(queued = self.queue.len(), "admission resumed");
        self.admit_from_queue().await;
    }

    /// Request cooperative cancellation of a live session, or drop a queued issue
    ///
    /// `id` is a session id or an issue id.
    ///
    /// # Errors
    /// [`CoordinatorError::UnknownSession`] when nothing matches.
    pub fn cancel(&mut self, id: &str) -> Result<String, CoordinatorError> {
        let session = id
            .parse::<SessionId>()
            .ok()
            .filter(|s| self.live.contains_key(s))
            .or_else(|| self.live_issues.get(&IssueId::new(id)).copied());
        if let Some(session) = session {
            if let Some(live) = self.live.get(&session) {
                live.cancel.cancel();
                tracing::info!(%session, "cancellation requested");
                return Ok(format!("cancellation requested for session {session}"));
            }
        }
        if let Some(pos) = self.queue.iter().position(|q| q.id.as_str() == id) {
            self.queue.remove(pos);
            return Ok(format!("queued issue {id} removed"));
        }
        Err(CoordinatorError::UnknownSession(id.to_string()))
    }

    /// Start a fresh session for the issue of a FAILED or CANCELLED session
    ///
    /// # Errors
    /// [`CoordinatorError::UnknownSession`] or [`CoordinatorError::NotRetryable`].
    pub async fn retry(&mut self, id: &str) -> Result<Admission, CoordinatorError> {
        let session: SessionId = id
            .parse()
            .map_err(|_| CoordinatorError::UnknownSession(id.to_string()))?;
        let archived = self
            .archive
            .get(&session)
            .ok_or_else(|| CoordinatorError::UnknownSession(id.to_string()))?;
        if !matches!(archived.state, SessionState::Failed | SessionState::Cancelled)
            || self.live.contains_key(&session)
        {
            return Err(CoordinatorError::NotRetryable {
                session: id.to_string(),
                state: archived.state,
            });
        }
        let issue = archived.issue.clone();
        tracing::info!(%session, issue = %issue.id, "retrying");
        Ok(self.submit(issue).await)
    }

    /// Queue depth, live sessions, spend
    #[must_use]
    pub fn status(&self) -> StatusSnapshot {
        let mut live: Vec<SessionSnapshot> =
            self.live.values().map(|l| l.snapshot.borrow().clone()).collect();
        live.sort_by_key(|s| s.session);
        StatusSnapshot {
            paused: self.paused,
            queued: self.queue.iter().map(|i| i.id.clone()).collect(),
            live,
            completed: self.completed.clone(),
            cost: self.cost(),
        }
    }

    /// Spend summary
    #[must_use]
    pub fn cost(&self) -> UsageSummary {
        self.services.cost.usage_summary()
    }

    /// Terminal state of a finished session
    #[must_use]
    pub fn outcome(&self, session: SessionId) -> Option<(SessionState, Option<SessionFailure>)> {
        self.archive
            .get(&session)
            .filter(|_| !self.live.contains_key(&session))
            .map(|a| (a.state, a.failure.clone()))
    }

    /// Dispatch one ingress message; errors go to egress
    pub async fn handle(&mut self, message: IngressMessage) {
        match message {
            IngressMessage::ReportIssue(report) => {
                self.submit(report.into_issue()).await;
            }
            IngressMessage::Command(command) => self.command(command).await,
        }
    }

    async fn command(&mut self, command: OperatorCommand) {
        let reply = match command {
            OperatorCommand::Status => {
                let status = self.status();
                Ok(Notification::operator(NotificationKind::CommandReply, status.headline())
                    .with_detail(&status))
            }
            OperatorCommand::Pause => {
                self.pause();
                Ok(Notification::operator(NotificationKind::CommandReply, "admission paused"))
            }
            OperatorCommand::Resume => {
                self.resume().await;
                Ok(Notification::operator(
                    NotificationKind::CommandReply,
                    format!("admission resumed, {} still queued", self.queue.len()),
                ))
            }
            OperatorCommand::Cancel { id } => self
                .cancel(&id)
                .map(|msg| Notification::operator(NotificationKind::CommandReply, msg)),
            OperatorCommand::Retry { id } => self.retry(&id).await.map(|admission| {
                Notification::operator(
                    NotificationKind::CommandReply,
                    format!("retry of {id}: {admission:?}"),
                )
            }),
            OperatorCommand::Cost => {
                let summary = self.cost();
                Ok(Notification::operator(
                    NotificationKind::CostSummary,
                    format!(
                        "spent {} today of {}, {} overall",
                        summary.daily_spend, summary.daily_limit, summary.global_spend
                    ),
                )
                .with_detail(&summary))
            }
        };
        match reply {
            Ok(notification) => self.services.egress.publish(notification).await,
            Err(err) => self.report_error(&err).await,
        }
    }

    /// Report a coordinator-level error to egress
    pub async fn report_error(&self, err: &CoordinatorError) {
        tracing::warn!(error = %err, "coordinator error");
        self.services
            .egress
            .publish(Notification::operator(NotificationKind::Error, err.to_string()))
            .await;
    }

    /// Tick until nothing is live and nothing admissible is queued
    pub async fn run_until_idle(&mut self) {
        loop {
            self.tick().await;
            let stalled = self.paused || self.services.cost.daily_exhausted();
            if self.live.is_empty() && (self.queue.is_empty() || stalled) {
                return;
            }
            match self.tasks.join_next_with_id().await {
                Some(joined) => self.reap(joined).await,
                None => tokio::time::sleep(self.config.tick_interval()).await,
            }
        }
    }

    /// Serve ingress until the channel closes, then let live sessions finish
    pub async fn run(mut self, mut ingress: mpsc::Receiver<IngressMessage>) {
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(max_live = self.config.max_live_sessions, "coordinator running");
        loop {
            tokio::select! {
                message = ingress.recv() => match message {
                    Some(message) => self.handle(message).await,
                    None => break,
                },
                Some(joined) = self.tasks.join_next_with_id(), if !self.tasks.is_empty() => {
                    self.reap(joined).await;
                    self.admit_from_queue().await;
                }
                _ = ticker.tick() => self.tick().await,
            }
        }
        tracing::info!(live = self.live.len(), queued = self.queue.len(), "ingress closed, draining sessions");
        self.run_until_idle().await;
    }
}
