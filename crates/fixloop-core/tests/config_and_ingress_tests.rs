//! Configuration files, lesson persistence and ingress parsing properties

use fixloop_core::{parse_line, IngressMessage, MastermindConfig, OperatorCommand};
use fixloop_kernel::SessionState;
use fixloop_learning::LearningStore;
use fixloop_test_utils::{issue, test_config, Harness, ScriptedOracle, StubWorkers};
use proptest::prelude::*;
use std::io::Write;

#[test]
fn config_file_overrides_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
max_live_sessions = 2

[budget]
daily_usd = 25.0

[session]
max_repair_attempts = 4
"#
    )
    .unwrap();

    let config = MastermindConfig::load(file.path()).unwrap();
    assert_eq!(config.max_live_sessions, 2);
    assert!((config.budget.daily_usd - 25.0).abs() < f64::EPSILON);
    assert_eq!(config.session.max_repair_attempts, 4);
    // Untouched keys keep their defaults.
    let defaults = MastermindConfig::new();
    assert_eq!(config.session.max_ci_fix_attempts, defaults.session.max_ci_fix_attempts);
    assert_eq!(config.oracle, defaults.oracle);
    config.validate().unwrap();
}

#[test]
fn missing_config_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = MastermindConfig::load(dir.path().join("absent.toml")).unwrap_err();
    assert!(err.to_string().contains("absent.toml"));
}

#[tokio::test]
async fn lessons_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lessons.jsonl");
    let config = test_config().with_max_repair_attempts(0);

    {
        let store = LearningStore::open(&path).unwrap();
        let mut h = Harness::with_learning(
            config,
            ScriptedOracle::planning(),
            StubWorkers::failing_tests(),
            store,
        );
        let session = h.coordinator.submit(issue("P1")).await.session().unwrap();
        h.coordinator.run_until_idle().await;
        assert_eq!(h.coordinator.outcome(session).unwrap().0, SessionState::Failed);
        assert_eq!(h.learning.len(), 1);
    }

    let reopened = LearningStore::open(&path).unwrap();
    assert_eq!(reopened.len(), 1);
    assert!(reopened.verify_integrity().is_ok());
}

proptest! {
    #[test]
    fn prop_parse_line_never_panics(line in "\\PC{0,80}") {
        let _ = parse_line(&line);
    }

    #[test]
    fn prop_cancel_keeps_its_id(id in "[A-Za-z0-9_-]{1,26}", prefix in prop::sample::select(vec!["", "!", "/"])) {
        let parsed = parse_line(&format!("{prefix}cancel {id}")).unwrap();
        prop_assert_eq!(parsed, IngressMessage::Command(OperatorCommand::Cancel { id }));
    }
}
