//! Explicit enqueue step for produced issues

use async_trait::async_trait;
use fixloop_kernel::Issue;
use tokio::sync::mpsc;

/// Where produced issues go
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Receiving side has gone away
    #[error("issue sink closed")]
    Closed,
    /// Writing the issue failed
    #[error("issue sink write failed: {0}")]
    Write(String),
}

/// Destination for tester output
#[async_trait]
pub trait IssueSink: Send + Sync {
    /// Hand one issue over
    async fn enqueue(&self, issue: Issue) -> Result<(), SinkError>;
}

/// Sink backed by a tokio channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Issue>,
}

impl ChannelSink {
    /// Sink feeding `tx`
    #[must_use]
    pub fn new(tx: mpsc::Sender<Issue>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl IssueSink for ChannelSink {
    async fn enqueue(&self, issue: Issue) -> Result<(), SinkError> {
        self.tx.send(issue).await.map_err(|_| SinkError::Closed)
    }
}

/// Enqueue every issue, stopping at the first sink failure
///
/// # Errors
/// The first [`SinkError`]; issues after it are not sent.
pub async fn report_all(sink: &dyn IssueSink, issues: Vec<Issue>) -> Result<usize, SinkError> {
    let mut sent = 0;
    for issue in issues {
        tracing::info!(issue = %issue.id, title = %issue.title, reporter = %issue.reporter, "issue reported");
        sink.enqueue(issue).await?;
        sent += 1;
    }
    Ok(sent)
}
