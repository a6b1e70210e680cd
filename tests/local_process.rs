//! Local process integration tests.

#![cfg(unix)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use shell_exec::error::ExecError;
use shell_exec::execution::{self, Command, CommandExecutor, Process};
use shell_exec::output::Redirect;
use shell_exec::supervisor::{FailureRecord, WorkerBuilder};

#[test]
fn test_environment_and_working_dir() {
    let dir = tempfile::TempDir::new().unwrap();
    let command = Command::new("echo \"$STAGE\"; pwd")
        .env("STAGE", "deploy")
        .working_dir(dir.path());
    let out = execution::check_output(&command).unwrap();
    let text = String::from_utf8(out).unwrap();

    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("deploy"));
    let pwd = std::fs::canonicalize(lines.next().unwrap()).unwrap();
    assert_eq!(pwd, std::fs::canonicalize(dir.path()).unwrap());
}

#[test]
fn test_argv_is_not_shell_expanded() {
    let out = execution::check_output(&Command::argv(["echo", "$HOME", "*"])).unwrap();
    assert_eq!(out, b"$HOME *\n");
}

#[test]
fn test_null_output_is_discarded() {
    let mut process = Process::spawn(
        &Command::new("echo gone; echo kept >&2")
            .stdout(Redirect::Null)
            .stderr(Redirect::Capture),
    )
    .unwrap();
    let (stdout, stderr) = process.communicate(None, None).unwrap();
    assert!(stdout.is_empty());
    assert_eq!(stderr, b"kept\n");
    assert!(process.stdout().is_none());
}

#[test]
fn test_poll_then_wait() {
    let mut process = Process::spawn(&Command::new("sleep 0.3; exit 5")).unwrap();
    assert_eq!(process.poll().unwrap(), None);
    assert_eq!(process.wait(None).unwrap(), 5);
    assert_eq!(process.exit_code(), Some(5));
    assert_eq!(process.poll().unwrap(), Some(5));
}

#[test]
fn test_check_wait_reports_nonzero_exit() {
    let mut process = Process::spawn(&Command::new("exit 9")).unwrap();
    match process.check_wait(None) {
        Err(ExecError::NonZeroExit { code, pid, .. }) => {
            assert_eq!(code, 9);
            assert_eq!(pid, Some(process.pid()));
        }
        other => panic!("expected NonZeroExit, got {other:?}"),
    }
}

#[test]
fn test_update_timeout_shortens_deadline() {
    let mut process = Process::spawn(&Command::new("sleep 30").timeout(None)).unwrap();
    process.update_timeout(Some(Duration::from_millis(200)));
    let start = Instant::now();

    let err = process.wait(None).unwrap_err();
    assert!(matches!(err, ExecError::Timeout { .. }));
    assert!(start.elapsed() < Duration::from_secs(10));
}

#[test]
fn test_write_stdin_incrementally() {
    let mut process =
        Process::spawn(&Command::new("cat").stdin(Redirect::Capture).capture()).unwrap();
    process.write_stdin(b"first ").unwrap();
    process.write_stdin(b"second").unwrap();
    process.close_stdin();

    assert_eq!(process.wait(Some(Duration::from_secs(10))).unwrap(), 0);
    let (stdout, _) = process.communicate(None, None).unwrap();
    assert_eq!(stdout, b"first second");
}

#[test]
fn test_timed_out_workers_are_recorded_in_order() {
    let record = Arc::new(FailureRecord::new());
    let spawn = |name: &str, limit: u64| {
        WorkerBuilder::new()
            .name(name)
            .record(Arc::clone(&record))
            .spawn(move |_| {
                let command = Command::new("sleep 30").timeout(Some(Duration::from_millis(limit)));
                execution::call(&command)
            })
            .unwrap()
    };

    let late = spawn("late", 800);
    thread::sleep(Duration::from_millis(50));
    let early = spawn("early", 100);

    assert!(late.join().is_err());
    assert!(early.join().is_err());
    let first = record.first().unwrap();
    assert_eq!(first.name, "early");
    assert!(matches!(first.failure, ExecError::Timeout { .. }));
}

#[tokio::test]
async fn test_local_executor_async() {
    let executor = CommandExecutor::local();
    let result = executor
        .execute_async(Command::new("echo out; echo err >&2; exit 1"), None)
        .await
        .unwrap();

    assert!(result.failed());
    assert_eq!(result.exit_code, Some(1));
    assert_eq!(result.output_trimmed(), "out");
    assert_eq!(result.error_text().trim(), "err");
}
