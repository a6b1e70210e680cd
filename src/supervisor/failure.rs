//! Process-wide record of worker failures.
//!
//! Workers append an entry when their body fails. Readers ask for the
//! earliest entry by capture time, which gives a deterministic answer when
//! several workers fail close together and append in a different order.
//! Coordinators that do not join their workers can subscribe and drain
//! notifications from a bounded channel instead.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Instant, SystemTime};

use tokio::sync::mpsc;
use tracing::warn;

use super::WorkerId;
use crate::error::ExecError;

static GLOBAL: OnceLock<Arc<FailureRecord>> = OnceLock::new();

/// One captured worker failure.
#[derive(Debug, Clone)]
pub struct FailureEntry {
    /// Worker that failed.
    pub worker: WorkerId,
    /// Worker name at the time of failure.
    pub name: String,
    /// Monotonic capture time, used for ordering.
    pub captured_at: Instant,
    /// Wall-clock capture time, for reporting.
    pub wall_time: SystemTime,
    /// The failure itself.
    pub failure: ExecError,
}

impl FailureEntry {
    /// Build an entry stamped with the current time.
    pub fn now(worker: WorkerId, name: impl Into<String>, failure: ExecError) -> Self {
        Self {
            worker,
            name: name.into(),
            captured_at: Instant::now(),
            wall_time: SystemTime::now(),
            failure,
        }
    }
}

/// Receiving half of a failure subscription.
pub type FailureReceiver = mpsc::Receiver<FailureEntry>;

/// Timestamp-ordered collection of worker failures.
#[derive(Debug, Default)]
pub struct FailureRecord {
    entries: Mutex<Vec<FailureEntry>>,
    subscribers: Mutex<Vec<mpsc::Sender<FailureEntry>>>,
}

impl FailureRecord {
    /// Create an empty, private record.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide record used by workers unless told otherwise.
    pub fn global() -> Arc<FailureRecord> {
        GLOBAL.get_or_init(|| Arc::new(FailureRecord::new())).clone()
    }

    /// Append an entry without notifying subscribers.
    pub fn push(&self, entry: FailureEntry) {
        self.lock_entries().push(entry);
    }

    /// Append an entry and offer it to every subscriber.
    ///
    /// Never blocks: a subscriber whose channel is full misses the
    /// notification, and closed subscribers are dropped.
    pub fn push_and_notify(&self, entry: FailureEntry) {
        self.push(entry.clone());
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.retain(|tx| match tx.try_send(entry.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(worker = %entry.worker, "failure subscriber is full, notification dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Subscribe to future notifications through a bounded channel.
    pub fn subscribe(&self, capacity: usize) -> FailureReceiver {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tx);
        rx
    }

    /// The earliest failure by capture time.
    pub fn first(&self) -> Option<FailureEntry> {
        self.lock_entries()
            .iter()
            .min_by_key(|e| e.captured_at)
            .cloned()
    }

    /// All failures, earliest first.
    pub fn entries(&self) -> Vec<FailureEntry> {
        let mut entries = self.lock_entries().clone();
        entries.sort_by_key(|e| e.captured_at);
        entries
    }

    /// Forget all recorded failures.
    pub fn reset(&self) {
        self.lock_entries().clear();
    }

    /// Number of recorded failures.
    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    /// Whether no failures are recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, Vec<FailureEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry_at(at: Instant, name: &str) -> FailureEntry {
        FailureEntry {
            worker: WorkerId::next(),
            name: name.into(),
            captured_at: at,
            wall_time: SystemTime::now(),
            failure: ExecError::ProtocolError(name.into()),
        }
    }

    #[test]
    fn test_first_is_earliest_regardless_of_append_order() {
        let record = FailureRecord::new();
        let t0 = Instant::now();
        let w1 = entry_at(t0 + Duration::from_secs(1), "w1");
        let w2 = entry_at(t0 + Duration::from_secs(2), "w2");

        // W2 finishes appending first.
        record.push(w2);
        record.push(w1);

        assert_eq!(record.first().unwrap().name, "w1");
        let names: Vec<_> = record.entries().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["w1", "w2"]);
    }

    #[test]
    fn test_reset() {
        let record = FailureRecord::new();
        record.push(entry_at(Instant::now(), "x"));
        assert_eq!(record.len(), 1);
        record.reset();
        assert!(record.is_empty());
        assert!(record.first().is_none());
    }

    #[test]
    fn test_subscribers_are_notified() {
        let record = FailureRecord::new();
        let mut rx = record.subscribe(4);
        record.push_and_notify(entry_at(Instant::now(), "boom"));
        let got = rx.try_recv().unwrap();
        assert_eq!(got.name, "boom");
    }

    #[test]
    fn test_full_subscriber_does_not_block() {
        let record = FailureRecord::new();
        let mut rx = record.subscribe(1);
        record.push_and_notify(entry_at(Instant::now(), "a"));
        record.push_and_notify(entry_at(Instant::now(), "b"));
        assert_eq!(record.len(), 2);
        assert_eq!(rx.try_recv().unwrap().name, "a");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_subscriber_is_dropped() {
        let record = FailureRecord::new();
        drop(record.subscribe(1));
        record.push_and_notify(entry_at(Instant::now(), "a"));
        assert!(record.subscribers.lock().unwrap().is_empty());
    }
}
