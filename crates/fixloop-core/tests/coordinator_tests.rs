//! Coordinator admission, queueing and operator command tests

use fixloop_core::{
    Admission, CoordinatorError, DeferReason, IngressMessage, NotificationKind, OperatorCommand,
    RejectReason,
};
use fixloop_kernel::{Issue, IssueId, SessionState, ThreadId, TokenUsage};
use fixloop_safety::Usd;
use fixloop_test_utils::{issue, test_config, EditGate, Harness, ScriptedOracle, StubWorkers};
use pretty_assertions::assert_eq;
use std::collections::HashSet;
use std::sync::Arc;

fn gated() -> (Harness, Arc<EditGate>) {
    let gate = Arc::new(EditGate::default());
    let workers = StubWorkers::passing().with_gate(gate.clone());
    (Harness::new(test_config(), ScriptedOracle::planning(), workers), gate)
}

#[tokio::test]
async fn one_live_session_per_issue() {
    let (mut h, gate) = gated();
    let first = h.coordinator.submit(issue("I1")).await.session().unwrap();
    gate.entered.notified().await;

    let again = h.coordinator.submit(issue("I1")).await;
    assert_eq!(
        again,
        Admission::Rejected(RejectReason::Duplicate {
            session: Some(first)
        })
    );
    assert_eq!(h.coordinator.live_count(), 1);
    assert_eq!(h.coordinator.session_for(&IssueId::new("I1")), Some(first));

    gate.release.notify_one();
    h.coordinator.run_until_idle().await;
    assert_eq!(h.coordinator.session_for(&IssueId::new("I1")), None);

    // Once the first session is over the issue may be submitted again.
    gate.release.notify_one();
    let second = h.coordinator.submit(issue("I1")).await.session().unwrap();
    assert_ne!(first, second);
    h.coordinator.run_until_idle().await;
    assert_eq!(h.coordinator.outcome(second).unwrap().0, SessionState::Done);
}

#[tokio::test]
async fn queued_duplicates_are_rejected() {
    let mut h = Harness::happy();
    h.coordinator.pause();
    assert!(matches!(
        h.coordinator.submit(issue("I1")).await,
        Admission::Queued { .. }
    ));
    assert_eq!(
        h.coordinator.submit(issue("I1")).await,
        Admission::Rejected(RejectReason::Duplicate { session: None })
    );
    assert_eq!(h.coordinator.queue_depth(), 1);
}

#[tokio::test]
async fn invalid_issue_is_rejected() {
    let mut h = Harness::happy();
    let admission = h.coordinator.submit(Issue::new("I1", "  ", "", "teen")).await;
    assert!(matches!(
        admission,
        Admission::Rejected(RejectReason::Invalid { .. })
    ));
    let last = h.egress.notifications().pop().unwrap();
    assert_eq!(last.kind, NotificationKind::Rejected);
}

#[tokio::test]
async fn pause_queues_and_resume_admits_in_order() {
    let mut h = Harness::new(
        test_config().with_max_live_sessions(1),
        ScriptedOracle::planning(),
        StubWorkers::passing(),
    );
    h.coordinator.pause();
    for (n, id) in ["A", "B", "C"].into_iter().enumerate() {
        assert_eq!(
            h.coordinator.submit(issue(id)).await,
            Admission::Queued {
                reason: DeferReason::Paused,
                position: n + 1
            }
        );
    }
    assert_eq!(h.coordinator.live_count(), 0);

    h.coordinator.resume().await;
    assert_eq!(h.coordinator.live_count(), 1);
    assert_eq!(h.coordinator.queue_depth(), 2);

    h.coordinator.run_until_idle().await;
    assert_eq!(h.coordinator.queue_depth(), 0);
    assert_eq!(h.coordinator.status().completed.done, 3);

    let created: Vec<ThreadId> = h
        .egress
        .notifications()
        .into_iter()
        .filter(|n| n.kind == NotificationKind::SessionCreated)
        .map(|n| n.thread)
        .collect();
    let expected: Vec<ThreadId> = ["A", "B", "C"]
        .into_iter()
        .map(|id| ThreadId::for_issue(&IssueId::new(id)))
        .collect();
    assert_eq!(created, expected);
}

#[tokio::test]
async fn concurrency_limit_defers_fifo() {
    let (mut h, gate) = {
        let gate = Arc::new(EditGate::default());
        let workers = StubWorkers::passing().with_gate(gate.clone());
        let config = test_config().with_max_live_sessions(1);
        (Harness::new(config, ScriptedOracle::planning(), workers), gate)
    };
    assert!(h.coordinator.submit(issue("A")).await.session().is_some());
    assert_eq!(
        h.coordinator.submit(issue("B")).await,
        Admission::Queued {
            reason: DeferReason::ConcurrencyLimit,
            position: 1
        }
    );
    assert_eq!(
        h.coordinator.submit(issue("C")).await,
        Admission::Queued {
            reason: DeferReason::QueueAhead,
            position: 2
        }
    );
    gate.entered.notified().await;
    assert_eq!(h.coordinator.live_count(), 1);

    // Each session blocks once in EDITING; let A go, then B and C as they arrive.
    gate.release.notify_one();
    let releaser = tokio::spawn({
        let gate = gate.clone();
        async move {
            for _ in 0..2 {
                gate.entered.notified().await;
                gate.release.notify_one();
            }
        }
    });
    h.coordinator.run_until_idle().await;
    releaser.await.unwrap();
    assert_eq!(h.coordinator.status().completed.done, 3);
}

#[tokio::test]
async fn every_session_gets_exactly_one_terminal_notification() {
    let mut config = test_config().with_max_live_sessions(2);
    config.session.max_repair_attempts = 1;
    let workers = StubWorkers::passing().with_test_results([true, false, false, true], true);
    let mut h = Harness::new(config, ScriptedOracle::planning(), workers);

    let mut sessions = Vec::new();
    for id in ["T1", "T2", "T3", "T4"] {
        h.coordinator.submit(issue(id)).await;
    }
    h.coordinator.run_until_idle().await;
    for n in h.egress.notifications() {
        if n.kind == NotificationKind::SessionCreated {
            sessions.push(n.session.unwrap());
        }
    }

    assert_eq!(sessions.len(), 4);
    let unique: HashSet<_> = sessions.iter().collect();
    assert_eq!(unique.len(), 4);
    for session in sessions {
        let terminal = h.egress.terminal_for(session);
        assert_eq!(terminal.len(), 1, "session {session}");
        let (state, _) = h.coordinator.outcome(session).unwrap();
        assert_eq!(terminal[0].kind, NotificationKind::SessionTerminal { state });
    }
}

#[tokio::test]
async fn cancel_removes_queued_issue() {
    let mut h = Harness::happy();
    h.coordinator.pause();
    h.coordinator.submit(issue("Q1")).await;
    assert!(h.coordinator.cancel("Q1").is_ok());
    assert_eq!(h.coordinator.queue_depth(), 0);
    assert!(matches!(
        h.coordinator.cancel("Q1"),
        Err(CoordinatorError::UnknownSession(_))
    ));
}

#[tokio::test]
async fn retry_restarts_failed_sessions_only() {
    let config = test_config().with_max_repair_attempts(0);
    let workers = StubWorkers::passing().with_test_results([false], true);
    let mut h = Harness::new(config, ScriptedOracle::planning(), workers);

    let failed = h.coordinator.submit(issue("R1")).await.session().unwrap();
    h.coordinator.run_until_idle().await;
    assert_eq!(h.coordinator.outcome(failed).unwrap().0, SessionState::Failed);

    let admission = h.coordinator.retry(&failed.to_string()).await.unwrap();
    let retried = admission.session().unwrap();
    assert_ne!(retried, failed);
    h.coordinator.run_until_idle().await;
    assert_eq!(h.coordinator.outcome(retried).unwrap().0, SessionState::Done);

    assert!(matches!(
        h.coordinator.retry(&retried.to_string()).await,
        Err(CoordinatorError::NotRetryable { .. })
    ));
    assert!(matches!(
        h.coordinator.retry("not-a-session").await,
        Err(CoordinatorError::UnknownSession(_))
    ));
}

#[tokio::test]
async fn commands_reply_on_the_operator_thread() {
    let mut h = Harness::happy();
    h.coordinator
        .handle(IngressMessage::Command(OperatorCommand::Pause))
        .await;
    assert!(h.coordinator.is_paused());
    h.coordinator.handle(IngressMessage::report(issue("C1"))).await;
    h.coordinator
        .handle(IngressMessage::Command(OperatorCommand::Status))
        .await;

    let status = h.egress.notifications().pop().unwrap();
    assert_eq!(status.kind, NotificationKind::CommandReply);
    assert_eq!(status.thread, ThreadId::operator());
    let detail = status.detail.unwrap();
    assert_eq!(detail["paused"], true);
    assert_eq!(detail["queued"][0], "C1");

    h.coordinator
        .handle(IngressMessage::Command(OperatorCommand::Cancel {
            id: "nope".to_string(),
        }))
        .await;
    let error = h.egress.notifications().pop().unwrap();
    assert_eq!(error.kind, NotificationKind::Error);

    h.coordinator
        .handle(IngressMessage::Command(OperatorCommand::Resume))
        .await;
    h.coordinator.run_until_idle().await;
    assert_eq!(h.coordinator.status().completed.done, 1);
}

#[tokio::test]
async fn cost_command_reports_spend() {
    let mut h = Harness::happy();
    h.coordinator.submit(issue("S1")).await;
    h.coordinator.run_until_idle().await;
    h.coordinator
        .handle(IngressMessage::Command(OperatorCommand::Cost))
        .await;

    let reply = h.egress.notifications().pop().unwrap();
    assert_eq!(reply.kind, NotificationKind::CostSummary);
    assert_eq!(h.coordinator.cost().calls, 1);
    assert!(reply.detail.is_some());
}

#[tokio::test]
async fn exhausted_daily_budget_rejects_new_issues() {
    let mut config = test_config().with_session_budget(0.09).with_daily_budget(0.09);
    config.pricing.input_per_mtok = 0.0;
    // Free prompts; 6k output at $15/M is exactly $0.09.
    let oracle = ScriptedOracle::planning().with_usage(TokenUsage::new(11_000, 6_000));
    let mut h = Harness::new(config, oracle, StubWorkers::passing());
    let first = h.coordinator.submit(issue("D1")).await.session().unwrap();
    h.coordinator.run_until_idle().await;
    assert_eq!(h.coordinator.outcome(first).unwrap().0, SessionState::Done);
    assert!(h.cost.daily_exhausted());
    assert!(h
        .egress
        .notifications()
        .iter()
        .any(|n| n.kind == NotificationKind::BudgetWarning));

    assert_eq!(
        h.coordinator.submit(issue("D2")).await,
        Admission::Rejected(RejectReason::BudgetExhausted)
    );
}

#[tokio::test]
async fn archive_keeps_only_recent_finished_sessions() {
    let config = test_config().with_archive_limit(2).with_max_repair_attempts(0);
    let workers = StubWorkers::passing().with_test_results([false], true);
    let mut h = Harness::new(config, ScriptedOracle::planning(), workers);

    let mut sessions = Vec::new();
    for id in ["A1", "A2", "A3"] {
        sessions.push(h.coordinator.submit(issue(id)).await.session().unwrap());
        h.coordinator.run_until_idle().await;
    }
    let oldest = sessions[0];
    assert!(h.coordinator.outcome(oldest).is_none());
    assert!(h.coordinator.outcome(sessions[1]).is_some());
    assert!(h.coordinator.outcome(sessions[2]).is_some());
    // The failed session has aged out, so it can no longer be retried.
    assert!(matches!(
        h.coordinator.retry(&oldest.to_string()).await,
        Err(CoordinatorError::UnknownSession(_))
    ));

    let summary = h.coordinator.cost();
    assert_eq!(summary.folded_sessions, 1);
    assert_eq!(summary.calls, 3);
    assert_eq!(h.cost.session_spend(oldest), Usd::ZERO);
}
