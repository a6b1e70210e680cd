//! Supervised worker integration tests.

use std::sync::Arc;
use std::time::Duration;

use shell_exec::error::ExecError;
use shell_exec::supervisor::{FailureRecord, WorkerBuilder};

fn named(record: &Arc<FailureRecord>, name: &str) -> WorkerBuilder {
    WorkerBuilder::new().name(name).record(Arc::clone(record))
}

#[test]
fn test_first_failure_wins_across_workers() {
    let record = Arc::new(FailureRecord::new());

    let slow = named(&record, "slow")
        .spawn::<(), _>(|token| {
            token.sleep(Duration::from_millis(300))?;
            Err(ExecError::ProtocolError("slow failure".into()))
        })
        .unwrap();
    let fast = named(&record, "fast")
        .spawn::<(), _>(|token| {
            token.sleep(Duration::from_millis(50))?;
            Err(ExecError::ProtocolError("fast failure".into()))
        })
        .unwrap();

    // Join in the opposite order of failure.
    assert!(slow.join().is_err());
    assert!(fast.join().is_err());

    let first = record.first().unwrap();
    assert_eq!(first.name, "fast");
    let names: Vec<_> = record.entries().into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["fast", "slow"]);
}

#[test]
fn test_join_reraises_the_worker_error() {
    let record = Arc::new(FailureRecord::new());
    let worker = WorkerBuilder::new()
        .record(Arc::clone(&record))
        .spawn::<u8, _>(|_| {
            Err(ExecError::NonZeroExit {
                code: 3,
                command: "make".into(),
                pid: Some(42),
                output: None,
            })
        })
        .unwrap();

    match worker.join() {
        Err(ExecError::NonZeroExit { code, pid, .. }) => {
            assert_eq!(code, 3);
            assert_eq!(pid, Some(42));
        }
        other => panic!("expected NonZeroExit, got {other:?}"),
    }
    assert_eq!(record.len(), 1);
}

#[test]
fn test_aborted_worker_is_not_recorded() {
    let record = Arc::new(FailureRecord::new());
    let worker = WorkerBuilder::new()
        .name("sleeper")
        .record(Arc::clone(&record))
        .spawn::<(), _>(|token| {
            loop {
                token.sleep(Duration::from_millis(20))?;
            }
        })
        .unwrap();

    assert!(worker.abort(Duration::from_secs(5)));
    assert!(worker.aborted());
    assert!(matches!(worker.join(), Ok(None)));
    assert!(record.is_empty());
}

#[test]
fn test_unreported_failure_still_reraises() {
    let record = Arc::new(FailureRecord::new());
    let worker = WorkerBuilder::new()
        .report(false)
        .record(Arc::clone(&record))
        .spawn::<(), _>(|_| Err(ExecError::InvalidArgument("bad".into())))
        .unwrap();

    assert!(matches!(worker.join(), Err(ExecError::InvalidArgument(_))));
    assert!(record.is_empty());
}

#[tokio::test]
async fn test_subscriber_is_notified() {
    let record = Arc::new(FailureRecord::new());
    let mut failures = record.subscribe(4);

    let worker = WorkerBuilder::new()
        .name("notifier")
        .notify(true)
        .record(Arc::clone(&record))
        .spawn::<(), _>(|_| Err(ExecError::ProtocolError("lost".into())))
        .unwrap();

    let entry = tokio::time::timeout(Duration::from_secs(5), failures.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.name, "notifier");
    assert!(matches!(entry.failure, ExecError::ProtocolError(_)));

    assert!(worker.join().is_err());
}
