//! Keyed, reference-counted cache of live connections.
//!
//! One mutex guards the whole map. Entry mutations happen under it, while
//! closing a transport always happens after it is released so a slow close
//! never blocks other keys. Close failures are logged and discarded.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use super::transport::Transport;

/// Identifies one multiplexing slot in the pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey {
    pub principal: String,
    pub endpoint: String,
    pub tag: String,
}

impl ConnectionKey {
    pub fn new(
        principal: impl Into<String>,
        endpoint: impl Into<String>,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            principal: principal.into(),
            endpoint: endpoint.into(),
            tag: tag.into(),
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}({})", self.principal, self.endpoint, self.tag)
    }
}

struct Entry<T> {
    conn: Arc<T>,
    refs: usize,
}

type Entries<T> = Arc<Mutex<HashMap<ConnectionKey, Entry<T>>>>;

fn lock<T>(entries: &Entries<T>) -> MutexGuard<'_, HashMap<ConnectionKey, Entry<T>>> {
    // Entries are plain counters; a panic mid-update cannot leave them torn.
    entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn close_quietly<T: Transport>(key: &ConnectionKey, conn: &T) {
    if let Err(e) = conn.close() {
        debug!(%key, error = %e, "ignoring close failure");
    }
}

fn checkin<T>(entries: &Entries<T>, key: &ConnectionKey) {
    if let Some(entry) = lock(entries).get_mut(key) {
        entry.refs = entry.refs.saturating_sub(1);
    }
}

/// Pool of shared connections.
pub struct ConnectionPool<T> {
    entries: Entries<T>,
}

impl<T> Default for ConnectionPool<T> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T> Clone for ConnectionPool<T> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<T> fmt::Debug for ConnectionPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("len", &lock(&self.entries).len())
            .finish()
    }
}

impl<T: Transport> ConnectionPool<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a freshly built connection for `key`.
    ///
    /// An idle entry already cached for the key is closed and replaced. An
    /// entry in use is kept and the candidate is closed instead, so two
    /// workers racing to create the same key waste one connection but never
    /// leave two open.
    pub fn insert(&self, key: ConnectionKey, candidate: T) -> Lease<T> {
        let candidate = Arc::new(candidate);
        let (conn, discarded) = {
            let mut entries = lock(&self.entries);
            match entries.get_mut(&key) {
                Some(entry) if entry.refs > 0 => {
                    entry.refs += 1;
                    (Arc::clone(&entry.conn), Some(candidate))
                }
                _ => {
                    let old = entries.insert(
                        key.clone(),
                        Entry {
                            conn: Arc::clone(&candidate),
                            refs: 1,
                        },
                    );
                    (candidate, old.map(|e| e.conn))
                }
            }
        };
        if let Some(discarded) = discarded {
            debug!(%key, "closing superseded connection");
            close_quietly(&key, &*discarded);
        }
        self.lease(key, conn)
    }

    /// Check out the entry for `key`, or build one with `factory` and
    /// insert it. The factory runs without the pool lock held.
    pub fn acquire_or_create<F, E>(&self, key: &ConnectionKey, factory: F) -> Result<Lease<T>, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        if let Some(lease) = self.checkout(key) {
            return Ok(lease);
        }
        let candidate = factory()?;
        Ok(self.insert(key.clone(), candidate))
    }

    /// The existing entry for `key` with its count incremented.
    pub fn checkout(&self, key: &ConnectionKey) -> Option<Lease<T>> {
        let conn = {
            let mut entries = lock(&self.entries);
            let entry = entries.get_mut(key)?;
            entry.refs += 1;
            Arc::clone(&entry.conn)
        };
        Some(self.lease(key.clone(), conn))
    }

    /// Decrement the count for `key`, never below zero.
    ///
    /// Dropping a [`Lease`] does this; call it directly only to balance a
    /// lease that was leaked with [`std::mem::forget`].
    pub fn checkin(&self, key: &ConnectionKey) {
        checkin(&self.entries, key);
    }

    /// Close and remove the entry for `key` if nobody references it.
    /// Returns whether it was removed.
    pub fn evict(&self, key: &ConnectionKey) -> bool {
        let removed = {
            let mut entries = lock(&self.entries);
            match entries.get(key) {
                Some(entry) if entry.refs == 0 => entries.remove(key),
                _ => None,
            }
        };
        match removed {
            Some(entry) => {
                debug!(%key, "evicting connection");
                close_quietly(key, &*entry.conn);
                true
            }
            None => false,
        }
    }

    /// Close and remove every entry, in use or not.
    pub fn clear(&self) {
        let drained: Vec<_> = lock(&self.entries).drain().collect();
        for (key, entry) in drained {
            if entry.refs > 0 {
                debug!(%key, refs = entry.refs, "closing connection still in use");
            }
            close_quietly(&key, &*entry.conn);
        }
    }

    /// Reference count for `key`, `None` when absent.
    pub fn ref_count(&self, key: &ConnectionKey) -> Option<usize> {
        lock(&self.entries).get(key).map(|e| e.refs)
    }

    pub fn contains(&self, key: &ConnectionKey) -> bool {
        lock(&self.entries).contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lease(&self, key: ConnectionKey, conn: Arc<T>) -> Lease<T> {
        Lease {
            entries: Arc::clone(&self.entries),
            key,
            conn,
        }
    }
}

/// A counted reference to a pooled connection. Checks itself back in on
/// drop.
pub struct Lease<T> {
    entries: Entries<T>,
    key: ConnectionKey,
    conn: Arc<T>,
}

impl<T> Lease<T> {
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn connection(&self) -> &Arc<T> {
        &self.conn
    }

    /// Check in now rather than at end of scope.
    pub fn release(self) {}
}

impl<T> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.conn
    }
}

impl<T> Drop for Lease<T> {
    fn drop(&mut self) {
        checkin(&self.entries, &self.key);
    }
}

impl<T> fmt::Debug for Lease<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease").field("key", &self.key).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::transport::{Channel, StreamRead};
    use crate::Result;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    #[derive(Default)]
    struct Counters {
        opened: AtomicUsize,
        closed: AtomicUsize,
    }

    impl Counters {
        fn open_now(&self) -> usize {
            self.opened.load(Ordering::SeqCst) - self.closed.load(Ordering::SeqCst)
        }
    }

    struct FakeTransport {
        counters: Arc<Counters>,
        fail_close: bool,
    }

    impl FakeTransport {
        fn new(counters: &Arc<Counters>) -> Self {
            counters.opened.fetch_add(1, Ordering::SeqCst);
            Self {
                counters: Arc::clone(counters),
                fail_close: false,
            }
        }
    }

    struct NoChannel;

    impl Channel for NoChannel {
        fn request_pty(&mut self, _term: &str) -> Result<()> {
            Ok(())
        }
        fn exec(&mut self, _command: &str) -> Result<()> {
            Ok(())
        }
        fn read_stdout(&mut self, _max: usize) -> Result<StreamRead> {
            Ok(StreamRead::Closed)
        }
        fn read_stderr(&mut self, _max: usize) -> Result<StreamRead> {
            Ok(StreamRead::Closed)
        }
        fn write_stdin(&mut self, data: &[u8]) -> Result<usize> {
            Ok(data.len())
        }
        fn send_eof(&mut self) -> Result<()> {
            Ok(())
        }
        fn exit_status_ready(&mut self) -> Result<bool> {
            Ok(true)
        }
        fn exit_status(&mut self) -> Result<i32> {
            Ok(0)
        }
        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    impl Transport for FakeTransport {
        type Channel = NoChannel;

        fn open_channel(&self) -> Result<NoChannel> {
            Ok(NoChannel)
        }

        fn close(&self) -> Result<()> {
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                Err(crate::error::ExecError::Transport("close failed".into()))
            } else {
                Ok(())
            }
        }
    }

    fn key(tag: &str) -> ConnectionKey {
        ConnectionKey::new("root", "node1", tag)
    }

    #[test]
    fn test_key_display() {
        assert_eq!(key("main").to_string(), "root@node1(main)");
    }

    #[test]
    fn test_checkout_checkin_evict() {
        let counters = Arc::new(Counters::default());
        let pool = ConnectionPool::new();
        let lease = pool.insert(key("a"), FakeTransport::new(&counters));
        assert_eq!(pool.ref_count(&key("a")), Some(1));

        let second = pool.checkout(&key("a")).unwrap();
        assert_eq!(pool.ref_count(&key("a")), Some(2));
        assert!(!pool.evict(&key("a")), "in-use entries are not evicted");

        drop(second);
        drop(lease);
        assert_eq!(pool.ref_count(&key("a")), Some(0));
        assert!(pool.evict(&key("a")));
        assert!(!pool.contains(&key("a")));
        assert_eq!(counters.open_now(), 0);
    }

    #[test]
    fn test_checkin_floors_at_zero() {
        let counters = Arc::new(Counters::default());
        let pool = ConnectionPool::new();
        pool.insert(key("a"), FakeTransport::new(&counters)).release();
        pool.checkin(&key("a"));
        pool.checkin(&key("missing"));
        assert_eq!(pool.ref_count(&key("a")), Some(0));
    }

    #[test]
    fn test_idle_entry_is_replaced() {
        let counters = Arc::new(Counters::default());
        let pool = ConnectionPool::new();
        pool.insert(key("a"), FakeTransport::new(&counters)).release();
        let lease = pool.insert(key("a"), FakeTransport::new(&counters));
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.ref_count(&key("a")), Some(1));
        assert_eq!(counters.open_now(), 1);
        drop(lease);
    }

    #[test]
    fn test_busy_entry_keeps_existing() {
        let counters = Arc::new(Counters::default());
        let pool = ConnectionPool::new();
        let first = pool.insert(key("a"), FakeTransport::new(&counters));
        let second = pool.insert(key("a"), FakeTransport::new(&counters));
        assert!(Arc::ptr_eq(first.connection(), second.connection()));
        assert_eq!(pool.ref_count(&key("a")), Some(2));
        assert_eq!(counters.open_now(), 1);
    }

    #[test]
    fn test_concurrent_create_leaves_one_open() {
        let counters = Arc::new(Counters::default());
        let pool = ConnectionPool::new();
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let counters = Arc::clone(&counters);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    let lease = pool
                        .acquire_or_create(&key("race"), || {
                            Ok::<_, ()>(FakeTransport::new(&counters))
                        })
                        .unwrap();
                    std::thread::sleep(std::time::Duration::from_millis(10));
                    drop(lease);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(pool.len(), 1);
        assert_eq!(counters.open_now(), 1);
        assert_eq!(pool.ref_count(&key("race")), Some(0));
    }

    #[test]
    fn test_factory_error_leaves_pool_untouched() {
        let pool: ConnectionPool<FakeTransport> = ConnectionPool::new();
        let result = pool.acquire_or_create(&key("a"), || Err("refused"));
        assert_eq!(result.err(), Some("refused"));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_clear_swallows_close_errors() {
        let counters = Arc::new(Counters::default());
        let pool = ConnectionPool::new();
        let mut failing = FakeTransport::new(&counters);
        failing.fail_close = true;
        let _held = pool.insert(key("a"), failing);
        pool.insert(key("b"), FakeTransport::new(&counters)).release();

        pool.clear();
        assert!(pool.is_empty());
        assert_eq!(counters.closed.load(Ordering::SeqCst), 2);
    }
}
