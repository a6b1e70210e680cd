//! Cooperative cancellation token.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::Thread;
use std::time::{Duration, Instant};

use crate::error::ExecError;
use crate::Result;

#[derive(Debug, Default)]
struct State {
    cancelled: bool,
    thread: Option<Thread>,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    wake: Condvar,
}

/// Shared flag a worker checks at its cancellation points.
///
/// Cancelling wakes any [`CancelToken::sleep`] in progress and unparks the
/// bound thread. Work that never reaches a cancellation point is not
/// interrupted.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    /// Create an uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.cancelled = true;
        if let Some(thread) = &state.thread {
            thread.unpark();
        }
        self.inner.wake.notify_all();
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner
            .state
            .lock()
            .map(|s| s.cancelled)
            .unwrap_or(true)
    }

    /// Return `Err(Cancelled)` once cancellation has been requested.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ExecError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration` unless cancelled first.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        let mut state = self
            .inner
            .state
            .lock()
            .map_err(|_| ExecError::LockPoisoned)?;
        loop {
            if state.cancelled {
                return Err(ExecError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            state = self
                .inner
                .wake
                .wait_timeout(state, deadline - now)
                .map_err(|_| ExecError::LockPoisoned)?
                .0;
        }
    }

    /// Bind the current thread so `cancel` unparks it.
    pub(crate) fn bind_current_thread(&self) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.thread = Some(std::thread::current());
        }
    }
}
