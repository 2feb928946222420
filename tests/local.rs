//! Integration tests for the local adapter, driven entirely through the
//! public `Engine`/`sh!` surface rather than any internal type.

use anyhost::{sh, Engine};
use std::time::Duration;

#[tokio::test]
async fn echoes_stdout_and_trims_trailing_newline() {
    let engine = Engine::default();
    let outcome = sh!(engine, "echo {}", "hello").await.unwrap();
    assert_eq!(outcome.text(), "hello");
    assert!(outcome.ok());
}

#[tokio::test]
async fn nonzero_exit_raises_by_default() {
    let engine = Engine::default();
    let err = sh!(engine, "exit {}", 7i64).await.unwrap_err();
    match err {
        anyhost::Error::CommandFailed { exit_code, .. } => assert_eq!(exit_code, 7),
        other => panic!("expected CommandFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn nothrow_reports_failure_in_the_outcome_instead() {
    let engine = Engine::default().nothrow();
    let outcome = sh!(engine, "exit {}", 7i64).await.unwrap();
    assert!(!outcome.ok());
    assert_eq!(outcome.cause(), Some("exitCode: 7".to_owned()));
}

#[tokio::test]
async fn timeout_synthesizes_exit_code_124() {
    let engine = Engine::default().nothrow();
    let outcome = sh!(engine, "sleep {}", 5i64).timeout(50).await.unwrap();
    assert_eq!(outcome.exit_code, 124);
    assert_eq!(outcome.cause(), Some("exitCode: 124 (timeout)".to_owned()));
}

#[tokio::test]
async fn kill_cancels_a_running_command() {
    let engine = Engine::default().nothrow();
    let handle = sh!(engine, "sleep {}", 5i64);
    let token = handle.cancel_token();
    let join = tokio::spawn(handle);
    tokio::time::sleep(Duration::from_millis(30)).await;
    token.cancel();
    let outcome = join.await.unwrap().unwrap();
    assert_eq!(outcome.exit_code, 130);
}

#[tokio::test]
async fn stdin_bytes_are_delivered_to_the_child() {
    let engine = Engine::default();
    let outcome = sh!(engine, "cat")
        .stdin_bytes(b"through the pipe".to_vec())
        .await
        .unwrap();
    assert_eq!(outcome.text(), "through the pipe");
}

#[tokio::test]
async fn cd_changes_the_working_directory() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::default().cd(dir.path());
    let outcome = sh!(engine, "pwd").await.unwrap();
    assert_eq!(outcome.text(), dir.path().canonicalize().unwrap().to_string_lossy());
}

#[tokio::test]
async fn env_vars_are_visible_to_the_child() {
    let engine = Engine::default().env([("ANYHOST_TEST_VAR".to_owned(), "present".to_owned())]);
    let outcome = sh!(engine, "printenv {}", "ANYHOST_TEST_VAR").await.unwrap();
    assert_eq!(outcome.text(), "present");
}

#[tokio::test]
async fn pipe_feeds_the_first_commands_stdout_into_the_second() {
    let engine = Engine::default();
    let first = sh!(engine, "echo {}", "piped-value");
    let second = anyhost::Command {
        program: anyhost::Program::Argv {
            program: "cat".to_owned(),
            args: vec![],
        },
        ..Default::default()
    };
    let outcome = first.pipe(second).await.unwrap();
    assert_eq!(outcome.text(), "piped-value");
}

#[tokio::test]
async fn sensitive_output_is_masked_in_the_outcome() {
    let engine = Engine::default();
    let outcome = sh!(engine, "echo {}", "Authorization: Bearer sk-abc123").await.unwrap();
    assert_eq!(outcome.text(), "Authorization: Bearer [REDACTED]");
}
