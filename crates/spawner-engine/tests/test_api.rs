//! Scenarios for the convenience API.

use std::collections::HashMap;

use spawner_engine::{Manager, Spawner, SpawnerError};

fn spawner() -> Spawner {
    let _ = env_logger::builder().is_test(true).try_init();
    let manager = Manager::new();
    manager.start().unwrap();
    Spawner::new(manager)
}

#[test]
fn check_output_collects_stdout() {
    let spawner = spawner();
    assert_eq!(
        spawner.check_output("echo test", None, None).unwrap(),
        b"test\n"
    );
    spawner.manager().stop();
}

#[test]
fn check_output_fails_on_nonzero_exit() {
    let spawner = spawner();
    let err = spawner
        .check_output(r#"sh -c "exit 1""#, None, None)
        .unwrap_err();
    match err {
        SpawnerError::ProcessFailed { exit_status, .. } => assert_eq!(exit_status, Some(1)),
        other => panic!("expected ProcessFailed, got {other}"),
    }
    spawner.manager().stop();
}

#[test]
fn check_output_fails_on_missing_executable() {
    let spawner = spawner();
    let err = spawner
        .check_output("/nonexistent/program/12345", None, None)
        .unwrap_err();
    assert!(matches!(err, SpawnerError::SpawnFailed { .. }));
    spawner.manager().stop();
}

#[test]
fn check_output_passes_environment() {
    let spawner = spawner();
    let env = HashMap::from([("SPAWNER_API_TEST_VAR".to_string(), "42".to_string())]);
    let output = spawner.check_output("env", Some(env), None).unwrap();
    let output = String::from_utf8(output).unwrap();
    assert!(output.lines().any(|line| line == "SPAWNER_API_TEST_VAR=42"));
    spawner.manager().stop();
}

#[test]
fn check_call_returns_zero_on_success() {
    let spawner = spawner();
    assert_eq!(
        spawner.check_call(r#"sh -c "exit 0""#, None, None).unwrap(),
        0
    );
    spawner.manager().stop();
}

#[test]
fn check_call_fails_on_nonzero_exit() {
    let spawner = spawner();
    let err = spawner
        .check_call(r#"sh -c "exit 1""#, None, None)
        .unwrap_err();
    assert!(matches!(err, SpawnerError::ProcessFailed { .. }));
    spawner.manager().stop();
}

#[test]
fn spawn_guard_waits_for_natural_exit() {
    let spawner = spawner();
    let guard = spawner.spawn("echo scoped", None, None).unwrap();
    assert_eq!(guard.result(None).unwrap(), b"scoped\n");
    // Stopping after the exit returns the same resolved output.
    assert_eq!(guard.stop().unwrap(), b"scoped\n");
    spawner.manager().stop();
}

#[test]
fn spawn_guard_stop_reaps_long_running_process() {
    let spawner = spawner();
    let guard = spawner.spawn("sleep 60", None, None).unwrap();
    // SIGTERM ends the child; a signalled exit resolves with the output
    // collected so far.
    assert_eq!(guard.stop().unwrap(), b"");
    spawner.manager().stop();
}

#[test]
fn spawn_guard_drop_is_best_effort_teardown() {
    let spawner = spawner();
    {
        let _guard = spawner.spawn("sleep 60", None, None).unwrap();
    }
    // The config was unloaded on drop, so the name space is clean and the
    // manager still works.
    assert_eq!(spawner.check_call("true", None, None).unwrap(), 0);
    spawner.manager().stop();
}
