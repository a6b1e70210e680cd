//! Supervised worker threads.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{CancelToken, FailureEntry, FailureRecord, WorkerId};
use crate::error::ExecError;
use crate::retry::Retry;
use crate::Result;

/// Interval between cancellation attempts in [`Worker::abort`].
pub const ABORT_INTERVAL: Duration = Duration::from_millis(100);

/// Per-worker bookkeeping shared between the worker thread and its handle.
#[derive(Debug)]
struct Record {
    id: WorkerId,
    name: String,
    started_at: OnceLock<Instant>,
    thread_id: Mutex<Option<ThreadId>>,
    failure: Mutex<Option<ExecError>>,
    aborted_by: OnceLock<String>,
    token: CancelToken,
    done: Mutex<bool>,
    done_cv: Condvar,
}

impl Record {
    fn set_thread(&self, id: Option<ThreadId>) {
        *self
            .thread_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = id;
    }

    fn is_done(&self) -> bool {
        *self.done.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn mark_done(&self) {
        let mut done = self.done.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *done = true;
        self.done_cv.notify_all();
    }

    fn wait_done(&self, timeout: Option<Duration>) -> bool {
        let mut done = self.done.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let deadline = timeout.map(|t| Instant::now() + t);
        while !*done {
            match deadline {
                None => {
                    done = self
                        .done_cv
                        .wait(done)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    done = self
                        .done_cv
                        .wait_timeout(done, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0;
                }
            }
        }
        true
    }
}

/// Builder for [`Worker`].
#[derive(Debug, Clone)]
pub struct WorkerBuilder {
    name: Option<String>,
    report: bool,
    notify: bool,
    record: Option<Arc<FailureRecord>>,
}

impl Default for WorkerBuilder {
    fn default() -> Self {
        Self {
            name: None,
            report: true,
            notify: false,
            record: None,
        }
    }
}

impl WorkerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Thread name. Defaults to the worker id.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Whether failures are appended to the failure record (default on).
    pub fn report(mut self, report: bool) -> Self {
        self.report = report;
        self
    }

    /// Whether failures are pushed to record subscribers (default off).
    pub fn notify(mut self, notify: bool) -> Self {
        self.notify = notify;
        self
    }

    /// Record failures somewhere other than [`FailureRecord::global`].
    pub fn record(mut self, record: Arc<FailureRecord>) -> Self {
        self.record = Some(record);
        self
    }

    /// Start the worker thread.
    pub fn spawn<T, F>(self, body: F) -> Result<Worker<T>>
    where
        T: Send + 'static,
        F: FnOnce(&CancelToken) -> Result<T> + Send + 'static,
    {
        let id = WorkerId::next();
        let name = self.name.unwrap_or_else(|| id.to_string());
        let record = Arc::new(Record {
            id,
            name: name.clone(),
            started_at: OnceLock::new(),
            thread_id: Mutex::new(None),
            failure: Mutex::new(None),
            aborted_by: OnceLock::new(),
            token: CancelToken::new(),
            done: Mutex::new(false),
            done_cv: Condvar::new(),
        });
        let failures = self.record.unwrap_or_else(FailureRecord::global);
        let (report, notify) = (self.report, self.notify);

        let shared = Arc::clone(&record);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || run(shared, failures, report, notify, body))?;

        debug!(worker = %id, name = %record.name, "worker started");
        Ok(Worker {
            record,
            handle: Some(handle),
        })
    }
}

fn run<T, F>(
    record: Arc<Record>,
    failures: Arc<FailureRecord>,
    report: bool,
    notify: bool,
    body: F,
) -> Option<T>
where
    F: FnOnce(&CancelToken) -> Result<T>,
{
    let _ = record.started_at.set(Instant::now());
    record.token.bind_current_thread();
    record.set_thread(Some(thread::current().id()));

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(&record.token)));
    let result = outcome.unwrap_or_else(|payload| {
        Err(ExecError::Panicked {
            worker: record.name.clone(),
            message: panic_message(payload.as_ref()),
        })
    });

    record.set_thread(None);
    let value = match result {
        Ok(value) => Some(value),
        Err(failure) => {
            capture(&record, &failures, report, notify, failure);
            None
        }
    };
    record.mark_done();
    value
}

fn capture(
    record: &Record,
    failures: &FailureRecord,
    report: bool,
    notify: bool,
    failure: ExecError,
) {
    *record
        .failure
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(failure.clone());

    if let Some(canceller) = record.aborted_by.get() {
        debug!(worker = %record.id, %canceller, error = %failure, "aborted worker ended");
        return;
    }

    warn!(worker = %record.id, name = %record.name, error = %failure, "worker failed");
    if !report {
        return;
    }
    let entry = FailureEntry::now(record.id, record.name.clone(), failure);
    if notify {
        failures.push_and_notify(entry);
    } else {
        failures.push(entry);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// A unit of work running on its own supervised thread.
///
/// A failure inside the body is captured rather than lost: it is stored on
/// the worker, appended to the [`FailureRecord`] and re-raised by
/// [`Worker::join`]. Aborted workers never re-raise.
#[derive(Debug)]
pub struct Worker<T> {
    record: Arc<Record>,
    handle: Option<JoinHandle<Option<T>>>,
}

impl<T: Send + 'static> Worker<T> {
    /// Spawn a worker with default settings.
    pub fn spawn<F>(body: F) -> Result<Self>
    where
        F: FnOnce(&CancelToken) -> Result<T> + Send + 'static,
    {
        WorkerBuilder::new().spawn(body)
    }

    pub fn builder() -> WorkerBuilder {
        WorkerBuilder::new()
    }
}

impl<T> Worker<T> {
    pub fn id(&self) -> WorkerId {
        self.record.id
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    /// When the body started running, if it has.
    pub fn started_at(&self) -> Option<Instant> {
        self.record.started_at.get().copied()
    }

    /// Thread id while the body is running.
    pub fn tid(&self) -> Option<ThreadId> {
        *self
            .record
            .thread_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Alias of [`Worker::tid`].
    pub fn thread_id(&self) -> Option<ThreadId> {
        self.tid()
    }

    pub fn is_alive(&self) -> bool {
        !self.record.is_done()
    }

    /// Whether someone has started aborting this worker.
    pub fn aborted(&self) -> bool {
        self.record.aborted_by.get().is_some()
    }

    /// Name of the first party that aborted this worker.
    pub fn aborted_by(&self) -> Option<&str> {
        self.record.aborted_by.get().map(String::as_str)
    }

    /// The captured failure, once the body has failed.
    pub fn failure(&self) -> Option<ExecError> {
        self.record
            .failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// The worker's cancellation token.
    pub fn token(&self) -> &CancelToken {
        &self.record.token
    }

    /// Block until the body finishes or `timeout` elapses. Returns whether
    /// it finished.
    pub fn wait_timeout(&self, timeout: Option<Duration>) -> bool {
        self.record.wait_done(timeout)
    }

    /// Cancel the worker and wait up to `timeout` for it to end.
    ///
    /// This is racy by nature: the cancellation only lands when the body
    /// reaches a cancellation point ([`CancelToken::checkpoint`],
    /// [`CancelToken::sleep`] or a session/transfer loop iteration). A body
    /// stuck in a blocking call keeps running. Returns whether the worker is
    /// dead.
    pub fn abort(&self, timeout: Duration) -> bool {
        let current = thread::current();
        let canceller = current
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{:?}", current.id()));
        if self.record.aborted_by.set(canceller).is_ok() {
            debug!(worker = %self.record.id, "aborting worker");
        }

        self.record.token.cancel();
        if timeout.is_zero() {
            return self.record.is_done();
        }

        let retry = Retry::new()
            .timeout(timeout)
            .sleep(Duration::ZERO)
            .raise_on_exhaustion(false);
        for _attempt in retry.iter().flatten() {
            if self.record.wait_done(Some(ABORT_INTERVAL)) {
                return true;
            }
            self.record.token.cancel();
        }
        self.record.is_done()
    }

    /// Block until the worker finishes.
    ///
    /// Returns `Err` with the captured failure unless the worker was
    /// aborted, `Ok(None)` for an aborted worker that did not produce a
    /// value, and `Ok(Some(value))` otherwise.
    pub fn join(mut self) -> Result<Option<T>> {
        let value = match self.handle.take() {
            Some(handle) => handle.join().map_err(|payload| ExecError::Panicked {
                worker: self.record.name.clone(),
                message: panic_message(payload.as_ref()),
            })?,
            None => None,
        };
        if value.is_some() {
            return Ok(value);
        }
        if self.aborted() {
            return Ok(None);
        }
        match self.failure() {
            Some(failure) => Err(failure),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn private_builder() -> (WorkerBuilder, Arc<FailureRecord>) {
        let record = Arc::new(FailureRecord::new());
        (WorkerBuilder::new().record(Arc::clone(&record)), record)
    }

    #[test]
    fn test_join_returns_value() {
        let (builder, record) = private_builder();
        let worker = builder.name("adder").spawn(|_| Ok(2 + 2)).unwrap();
        assert_eq!(worker.name(), "adder");
        assert_eq!(worker.join().unwrap(), Some(4));
        assert!(record.is_empty());
    }

    #[test]
    fn test_join_reraises_failure() {
        let (builder, record) = private_builder();
        let worker = builder
            .spawn::<(), _>(|_| Err(ExecError::ProtocolError("bad header".into())))
            .unwrap();
        let err = worker.join().unwrap_err();
        assert!(matches!(err, ExecError::ProtocolError(ref m) if m == "bad header"));
        assert_eq!(record.len(), 1);
    }

    #[test]
    fn test_join_reraises_identical_io_error() {
        let (builder, record) = private_builder();
        let worker = builder
            .spawn::<(), _>(|_| Err(std::io::Error::other("disk gone").into()))
            .unwrap();
        let err = worker.join().unwrap_err();
        let recorded = record.first().unwrap().failure;
        match (err, recorded) {
            (ExecError::Io(a), ExecError::Io(b)) => assert!(Arc::ptr_eq(&a, &b)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_panic_is_captured() {
        let (builder, record) = private_builder();
        let worker = builder
            .name("panicky")
            .spawn::<(), _>(|_| panic!("kaboom"))
            .unwrap();
        let err = worker.join().unwrap_err();
        assert!(matches!(err, ExecError::Panicked { ref worker, ref message }
            if worker == "panicky" && message == "kaboom"));
        assert_eq!(record.len(), 1);
    }

    #[test]
    fn test_abort_suppresses_failure() {
        let (builder, record) = private_builder();
        let worker = builder
            .spawn::<(), _>(|token| {
                token.sleep(Duration::from_secs(60))?;
                Ok(())
            })
            .unwrap();
        assert!(worker.abort(Duration::from_secs(5)));
        assert!(worker.aborted());
        assert!(worker.aborted_by().is_some());
        assert!(matches!(worker.failure(), Some(ExecError::Cancelled)));
        assert_eq!(worker.join().unwrap(), None);
        assert!(record.is_empty());
    }

    #[test]
    fn test_abort_gives_up_on_blocked_worker() {
        let (builder, _record) = private_builder();
        let worker = builder
            .spawn(|_| {
                std::thread::sleep(Duration::from_millis(800));
                Ok(())
            })
            .unwrap();
        assert!(!worker.abort(Duration::from_millis(250)));
        assert!(worker.is_alive());
        // The body completed normally despite the abort.
        assert_eq!(worker.join().unwrap(), Some(()));
    }

    #[test]
    fn test_tid_only_while_running() {
        let (builder, _record) = private_builder();
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let worker = builder
            .spawn(move |_| {
                rx.recv().ok();
                Ok(())
            })
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while worker.tid().is_none() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(worker.tid().is_some());
        assert!(worker.started_at().is_some());

        tx.send(()).unwrap();
        assert!(worker.wait_timeout(Some(Duration::from_secs(5))));
        assert!(worker.tid().is_none());
        assert!(!worker.is_alive());
    }

    #[test]
    fn test_report_disabled() {
        let (builder, record) = private_builder();
        let worker = builder
            .report(false)
            .spawn::<(), _>(|_| Err(ExecError::Cancelled))
            .unwrap();
        assert!(worker.join().is_err());
        assert!(record.is_empty());
    }
}
