//! Fix session lifecycle tests
//!
//! Sessions run against in-memory workers and a scripted oracle.

use fixloop_core::{Admission, FailureKind, MastermindConfig};
use fixloop_kernel::{OracleError, SessionId, SessionState, TokenUsage};
use fixloop_safety::{RateLimit, Usd};
use fixloop_test_utils::{
    issue, lint_failure, test_config, EditGate, Harness, ScriptedOracle, StubWorkers,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

async fn run_one(h: &mut Harness, id: &str) -> SessionId {
    let admission = h.coordinator.submit(issue(id)).await;
    let Admission::Accepted(session) = admission else {
        panic!("expected admission, got {admission:?}");
    };
    h.coordinator.run_until_idle().await;
    session
}

#[tokio::test]
async fn happy_path_reaches_done_without_lesson() {
    let mut h = Harness::happy();
    let session = run_one(&mut h, "I1").await;

    let (state, failure) = h.coordinator.outcome(session).unwrap();
    assert_eq!(state, SessionState::Done);
    assert!(failure.is_none());
    assert_eq!(
        h.egress.transitions_for(session),
        vec![
            SessionState::Editing,
            SessionState::Testing,
            SessionState::Reviewing,
            SessionState::Merging,
        ]
    );
    assert_eq!(h.learning.len(), 0);
    assert_eq!(h.workers.count("merge"), 1);
    assert_eq!(h.workers.count("rollback"), 0);
    assert_eq!(h.egress.terminal_for(session).len(), 1);
    assert_eq!(h.oracle.calls(), 1);
    assert!(h.cost.session_spend(session) > Usd::ZERO);
}

#[tokio::test]
async fn persistent_test_failure_records_one_lesson() {
    let config = test_config().with_max_repair_attempts(2);
    let mut h = Harness::new(config, ScriptedOracle::planning(), StubWorkers::failing_tests());
    let session = run_one(&mut h, "I2").await;

    let (state, failure) = h.coordinator.outcome(session).unwrap();
    assert_eq!(state, SessionState::Failed);
    let failure = failure.unwrap();
    assert_eq!(failure.kind, FailureKind::WorkerFailure);
    assert_eq!(failure.error_class.as_deref(), Some("test_failure"));

    // One initial run plus one per repair attempt.
    assert_eq!(h.workers.count("run_tests"), 3);
    assert_eq!(h.oracle.calls(), 3);
    assert_eq!(h.workers.count("rollback"), 1);

    let lessons = h.learning.lessons();
    assert_eq!(lessons.len(), 1);
    let signature = &lessons[0].signature;
    assert!(!signature.is_empty());
    assert_eq!(signature.stage, "TESTING");
    assert_eq!(signature.error_class.as_deref(), Some("test_failure"));
    assert!(signature.files.contains(&"app.py".to_string()));
    assert_eq!(h.egress.terminal_for(session).len(), 1);
}

#[tokio::test]
async fn repair_feedback_reaches_the_next_prompt() {
    let config = test_config().with_max_repair_attempts(1);
    let workers = StubWorkers::passing().with_test_results([false], true);
    let mut h = Harness::new(config, ScriptedOracle::planning(), workers);
    let session = run_one(&mut h, "I3").await;

    assert_eq!(h.coordinator.outcome(session).unwrap().0, SessionState::Done);
    let prompts = h.oracle.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(!prompts[0].contains("AssertionError"));
    assert!(prompts[1].contains("AssertionError"));
    // Success after a repair leaves nothing to learn.
    assert_eq!(h.learning.len(), 0);
}

#[tokio::test]
async fn session_budget_is_never_exceeded() {
    let config = test_config()
        .with_session_budget(0.25)
        .with_max_repair_attempts(10);
    // Each repair costs more than the last; the later calls report far more
    // prompt tokens than their prompts could hold.
    let oracle = ScriptedOracle::planning().with_usages([
        TokenUsage::new(500, 1_000),
        TokenUsage::new(2_000, 3_000),
        TokenUsage::new(40_000, 5_000),
        TokenUsage::new(100_000, 6_000),
        TokenUsage::new(200_000, 6_000),
    ]);
    let mut h = Harness::new(config.clone(), oracle, StubWorkers::failing_tests());
    let session = run_one(&mut h, "I4").await;

    let (state, failure) = h.coordinator.outcome(session).unwrap();
    assert_eq!(state, SessionState::Failed);
    assert_eq!(failure.unwrap().kind, FailureKind::BudgetExceeded);
    // Spend only grows, so the final total bounds every intermediate one.
    assert!(h.cost.session_spend(session) <= config.cost_limits().per_session);
    assert!(h.oracle.calls() >= 2);

    let allowances = h.oracle.allowances();
    assert_eq!(allowances[0], config.session.strategy_max_tokens);
    assert!(allowances.iter().all(|a| *a <= config.session.strategy_max_tokens));
    assert!(allowances.iter().all(|a| *a >= config.session.strategy_min_tokens));
    // The last call had its completion allowance cut to what was left.
    assert!(allowances.iter().any(|a| *a < config.session.strategy_max_tokens));
    assert_eq!(h.learning.len(), 1);
}

#[tokio::test]
async fn over_reported_usage_cannot_break_the_session_cap() {
    let config = test_config().with_session_budget(0.25);
    let oracle = ScriptedOracle::planning().with_usage(TokenUsage::new(100_000, 500));
    let mut h = Harness::new(config.clone(), oracle, StubWorkers::failing_tests());
    let session = run_one(&mut h, "I4b").await;

    assert_eq!(h.coordinator.outcome(session).unwrap().0, SessionState::Failed);
    assert!(h.cost.session_spend(session) <= config.cost_limits().per_session);
    assert!(h.cost.session_spend(session) > Usd::ZERO);
}

#[tokio::test]
async fn unusable_plan_gets_one_correction() {
    let oracle = ScriptedOracle::always("I would rather not answer in JSON.");
    let mut h = Harness::new(test_config(), oracle, StubWorkers::passing());
    let session = run_one(&mut h, "I5").await;

    let failure = h.coordinator.outcome(session).unwrap().1.unwrap();
    assert_eq!(failure.kind, FailureKind::ProtocolViolation);
    assert_eq!(failure.error_class.as_deref(), Some("unparsable_plan"));
    assert_eq!(h.oracle.calls(), 2);
    // Nothing was edited, so there is no branch to roll back.
    assert_eq!(h.workers.total_calls(), 1);
    assert_eq!(h.workers.count("gather_context"), 1);
}

#[tokio::test]
async fn corrected_plan_is_accepted() {
    let oracle = ScriptedOracle::planning().then(Ok("{\"summary\": \"no edits\", \"edits\": []}".into()));
    let mut h = Harness::new(test_config(), oracle, StubWorkers::passing());
    let session = run_one(&mut h, "I6").await;

    assert_eq!(h.coordinator.outcome(session).unwrap().0, SessionState::Done);
    assert_eq!(h.oracle.calls(), 2);
}

#[tokio::test]
async fn transient_oracle_errors_are_retried() {
    let oracle = ScriptedOracle::planning()
        .then(Err(OracleError::Unavailable("overloaded".into())))
        .then(Err(OracleError::Unavailable("overloaded".into())));
    let mut h = Harness::new(test_config(), oracle, StubWorkers::passing());
    let session = run_one(&mut h, "I7").await;

    assert_eq!(h.coordinator.outcome(session).unwrap().0, SessionState::Done);
    assert_eq!(h.oracle.calls(), 3);
}

#[tokio::test]
async fn refused_oracle_fails_without_retry() {
    let oracle = ScriptedOracle::planning().then(Err(OracleError::Refused("policy".into())));
    let mut h = Harness::new(test_config(), oracle, StubWorkers::passing());
    let session = run_one(&mut h, "I8").await;

    let failure = h.coordinator.outcome(session).unwrap().1.unwrap();
    assert_eq!(failure.kind, FailureKind::PolicyRefusal);
    assert_eq!(h.oracle.calls(), 1);
}

#[tokio::test]
async fn lint_failures_in_ci_are_repaired_mechanically() {
    let workers = StubWorkers::passing().with_ci([lint_failure("app.py")]);
    let mut h = Harness::new(test_config(), ScriptedOracle::planning(), workers);
    let session = run_one(&mut h, "I9").await;

    assert_eq!(h.coordinator.outcome(session).unwrap().0, SessionState::Done);
    assert_eq!(h.workers.count("fix_lint"), 1);
    assert_eq!(h.workers.count("commit_and_push"), 2);
    assert_eq!(h.workers.count("open_pull_request"), 1);
    // The lint repair does not consult the oracle.
    assert_eq!(h.oracle.calls(), 1);
}

#[tokio::test]
async fn persistent_lint_failures_fail_the_session() {
    let mut config = test_config();
    config.session.max_ci_fix_attempts = 1;
    let workers = StubWorkers::passing().with_ci([lint_failure("app.py"), lint_failure("app.py")]);
    let mut h = Harness::new(config, ScriptedOracle::planning(), workers);
    let session = run_one(&mut h, "I10").await;

    let failure = h.coordinator.outcome(session).unwrap().1.unwrap();
    assert_eq!(failure.error_class.as_deref(), Some("lint"));
    assert_eq!(h.workers.count("fix_lint"), 1);
    assert_eq!(h.learning.lessons()[0].signature.stage, "REVIEWING");
}

#[tokio::test]
async fn redeploy_runs_after_merge_when_enabled() {
    let mut config: MastermindConfig = test_config();
    config.session.redeploy_after_merge = true;
    let mut h = Harness::new(config, ScriptedOracle::planning(), StubWorkers::passing());
    let session = run_one(&mut h, "I11").await;

    assert_eq!(h.coordinator.outcome(session).unwrap().0, SessionState::Done);
    let calls = h.workers.calls();
    let merge = calls.iter().position(|c| *c == "merge").unwrap();
    let rebuild = calls.iter().position(|c| *c == "rebuild").unwrap();
    assert!(merge < rebuild);
}

#[tokio::test]
async fn cancel_during_editing_stops_worker_calls() {
    let gate = Arc::new(EditGate::default());
    let workers = StubWorkers::passing().with_gate(gate.clone());
    let mut h = Harness::new(test_config(), ScriptedOracle::planning(), workers);

    let session = h.coordinator.submit(issue("I12")).await.session().unwrap();
    gate.entered.notified().await;
    let calls_before = h.workers.total_calls();
    h.coordinator.cancel(&session.to_string()).unwrap();
    gate.release.notify_one();
    h.coordinator.run_until_idle().await;

    let (state, failure) = h.coordinator.outcome(session).unwrap();
    assert_eq!(state, SessionState::Cancelled);
    assert_eq!(failure.unwrap().kind, FailureKind::Cancelled);
    assert_eq!(h.workers.total_calls(), calls_before);
    assert_eq!(h.workers.count("run_tests"), 0);
    assert_eq!(h.egress.terminal_for(session).len(), 1);
}

#[tokio::test]
async fn cancel_by_issue_id_reaches_the_session() {
    let gate = Arc::new(EditGate::default());
    let workers = StubWorkers::passing().with_gate(gate.clone());
    let mut h = Harness::new(test_config(), ScriptedOracle::planning(), workers);

    let session = h.coordinator.submit(issue("I13")).await.session().unwrap();
    gate.entered.notified().await;
    h.coordinator.cancel("I13").unwrap();
    gate.release.notify_one();
    h.coordinator.run_until_idle().await;

    assert_eq!(h.coordinator.outcome(session).unwrap().0, SessionState::Cancelled);
}

#[tokio::test]
async fn cancel_interrupts_a_rate_limit_wait() {
    let mut config = test_config().with_max_repair_attempts(1);
    // One oracle call per hour: the repair call has to wait for the window.
    config.rate.oracle = RateLimit {
        limit: 1,
        window_secs: 3600,
        per_session_cap: 1,
    };
    let mut h = Harness::new(config, ScriptedOracle::planning(), StubWorkers::failing_tests());

    let session = h.coordinator.submit(issue("I14")).await.session().unwrap();
    while h.workers.count("run_tests") == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.coordinator.cancel("I14").unwrap();
    tokio::time::timeout(Duration::from_secs(5), h.coordinator.run_until_idle())
        .await
        .expect("cancelled session should not sit out the rate window");

    assert_eq!(h.coordinator.outcome(session).unwrap().0, SessionState::Cancelled);
    assert_eq!(h.oracle.calls(), 1);
}
