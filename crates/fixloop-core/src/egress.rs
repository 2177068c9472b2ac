//! Egress: notifications to the chat transport
//!
//! Every notification carries a correlation thread so all updates about one
//! issue render together. Publishing never fails from the caller's point of
//! view; transport errors are logged and dropped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fixloop_kernel::{SessionId, SessionState, ThreadId};
use fixloop_safety::{Caller, RateLimiter, Surface};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};

/// What a notification is about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationKind {
    /// Issue admitted as a new session
    SessionCreated,
    /// Issue deferred into the admission queue
    Queued {
        /// 1-based queue position
        position: usize,
    },
    /// Issue refused
    Rejected,
    /// Session moved between live states
    StateTransition {
        /// Previous state
        from: SessionState,
        /// New state
        to: SessionState,
    },
    /// Session reached DONE, FAILED or CANCELLED
    SessionTerminal {
        /// Final state
        state: SessionState,
    },
    /// Periodic or requested spend summary
    CostSummary,
    /// Daily spend crossed the warning line
    BudgetWarning,
    /// Reply to an operator command
    CommandReply,
    /// Coordinator-level error
    Error,
}

/// One outbound message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Correlation thread
    pub thread: ThreadId,
    /// Session concerned, if any
    pub session: Option<SessionId>,
    /// Kind
    #[serde(flatten)]
    pub kind: NotificationKind,
    /// Human-readable status
    pub message: String,
    /// Structured payload (status snapshots, spend summaries)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
    /// Creation time
    pub at: DateTime<Utc>,
}

impl Notification {
    /// Create notification
    #[must_use]
    pub fn new(thread: ThreadId, kind: NotificationKind, message: impl Into<String>) -> Self {
        Self {
            thread,
            session: None,
            kind,
            message: message.into(),
            detail: None,
            at: Utc::now(),
        }
    }

    /// On the operator thread
    #[must_use]
    pub fn operator(kind: NotificationKind, message: impl Into<String>) -> Self {
        Self::new(ThreadId::operator(), kind, message)
    }

    /// With session id
    #[must_use]
    pub fn with_session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self
    }

    /// With structured payload; serialization failures drop the payload
    #[must_use]
    pub fn with_detail(mut self, detail: &impl Serialize) -> Self {
        match serde_json::to_value(detail) {
            Ok(value) => self.detail = Some(value),
            Err(e) => tracing::warn!(error = %e, "notification detail not serializable"),
        }
        self
    }

    /// Terminal notification
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, NotificationKind::SessionTerminal { .. })
    }
}

/// Outbound transport
#[async_trait]
pub trait Egress: Send + Sync {
    /// Deliver one notification
    async fn publish(&self, notification: Notification);
}

/// Forwards into an mpsc channel
#[derive(Debug, Clone)]
pub struct ChannelEgress {
    tx: mpsc::Sender<Notification>,
}

impl ChannelEgress {
    /// Create egress over a sender
    #[must_use]
    pub fn new(tx: mpsc::Sender<Notification>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl Egress for ChannelEgress {
    async fn publish(&self, notification: Notification) {
        if self.tx.send(notification).await.is_err() {
            tracing::warn!("egress channel closed, notification dropped");
        }
    }
}

/// Writes one JSON object per line
#[derive(Debug)]
pub struct JsonLinesEgress<W> {
    out: Mutex<W>,
}

impl<W> JsonLinesEgress<W> {
    /// Create egress over a writer
    #[must_use]
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }
}

#[async_trait]
impl<W> Egress for JsonLinesEgress<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn publish(&self, notification: Notification) {
        let mut line = match serde_json::to_vec(&notification) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "notification not serializable");
                return;
            }
        };
        line.push(b'\n');
        let mut out = self.out.lock().await;
        let written = match out.write_all(&line).await {
            Ok(()) => out.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            tracing::error!(error = %e, "egress write failed");
        }
    }
}

/// Draws one unit of the chat rate window per notification
pub struct RateLimitedEgress {
    inner: Arc<dyn Egress>,
    rate: Arc<RateLimiter>,
}

impl RateLimitedEgress {
    /// Wrap `inner`
    #[must_use]
    pub fn new(inner: Arc<dyn Egress>, rate: Arc<RateLimiter>) -> Self {
        Self { inner, rate }
    }
}

impl std::fmt::Debug for RateLimitedEgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitedEgress").finish_non_exhaustive()
    }
}

#[async_trait]
impl Egress for RateLimitedEgress {
    async fn publish(&self, notification: Notification) {
        let caller = notification.session.map_or(Caller::System, Caller::Session);
        self.rate.wait(Surface::Chat, caller).await;
        self.inner.publish(notification).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fixloop_safety::RateLimit;
    use std::time::Duration;

    #[tokio::test]
    async fn json_lines_are_newline_terminated() {
        let egress = JsonLinesEgress::new(Vec::<u8>::new());
        egress
            .publish(
                Notification::operator(NotificationKind::CommandReply, "paused")
                    .with_detail(&serde_json::json!({"paused": true})),
            )
            .await;
        let out = egress.out.into_inner();
        let text = String::from_utf8(out).unwrap();
        assert!(text.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(value["kind"], "command_reply");
        assert_eq!(value["thread"], "operator");
        assert_eq!(value["detail"]["paused"], true);
    }

    #[tokio::test]
    async fn transition_kind_serializes_flat() {
        let n = Notification::new(
            ThreadId("issue-I1".into()),
            NotificationKind::StateTransition {
                from: SessionState::Editing,
                to: SessionState::Testing,
            },
            "EDITING -> TESTING",
        );
        let value = serde_json::to_value(&n).unwrap();
        assert_eq!(value["kind"], "state_transition");
        assert_eq!(value["from"], "EDITING");
        assert_eq!(value["to"], "TESTING");
    }

    #[tokio::test(start_paused = true)]
    async fn chat_rate_limit_delays_publication() {
        let (tx, mut rx) = mpsc::channel(8);
        let rate = Arc::new(RateLimiter::new(
            RateLimit::oracle_default(),
            RateLimit {
                limit: 1,
                window_secs: 60,
                per_session_cap: 1,
            },
        ));
        let egress = RateLimitedEgress::new(Arc::new(ChannelEgress::new(tx)), rate);

        let start = tokio::time::Instant::now();
        egress.publish(Notification::operator(NotificationKind::CostSummary, "a")).await;
        egress.publish(Notification::operator(NotificationKind::CostSummary, "b")).await;
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert_eq!(rx.recv().await.unwrap().message, "a");
        assert_eq!(rx.recv().await.unwrap().message, "b");
    }
}
