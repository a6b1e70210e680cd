//! Bounded attempt/timeout iteration.
//!
//! [`Retry`] encapsulates retry and timeout bookkeeping. After each pass of
//! the caller's loop body it checks whether the attempt budget or the
//! deadline is spent, and sleeps between passes otherwise. The caller breaks
//! out of the loop on success.
//!
//! ```no_run
//! use std::time::Duration;
//! use shell_exec::retry::Retry;
//!
//! # fn probe() -> bool { true }
//! # fn main() -> shell_exec::Result<()> {
//! for attempt in Retry::new().attempts(5).timeout(Duration::from_secs(60)).iter() {
//!     let attempt = attempt?;
//!     if probe() {
//!         println!("succeeded on attempt {attempt}");
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::time::{Duration, Instant};

use crate::error::ExecError;
use crate::Result;

/// Default pause between attempts.
pub const DEFAULT_SLEEP: Duration = Duration::from_secs(1);

/// Why a retry loop stopped producing attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exhaustion {
    /// The absolute deadline passed.
    Deadline,
    /// The attempt budget was used up.
    Attempts,
}

/// Retry loop configuration.
#[derive(Debug, Clone)]
pub struct Retry {
    attempts: Option<u32>,
    timeout: Option<Duration>,
    sleep: Duration,
    raise_on_exhaustion: bool,
    message: Option<String>,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            attempts: None,
            timeout: None,
            sleep: DEFAULT_SLEEP,
            raise_on_exhaustion: true,
            message: None,
        }
    }
}

impl Retry {
    /// Unlimited attempts, no deadline, one second between attempts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from signed limits, where values `<= 0` mean unbounded.
    pub fn with_limits(attempts: i64, timeout_secs: f64) -> Self {
        let mut retry = Self::new();
        if attempts > 0 {
            retry.attempts = Some(u32::try_from(attempts).unwrap_or(u32::MAX));
        }
        if timeout_secs > 0.0 {
            retry.timeout = Some(Duration::from_secs_f64(timeout_secs));
        }
        retry
    }

    /// Limit the number of attempts.
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = (attempts > 0).then_some(attempts);
        self
    }

    /// Limit the number of attempts, `None` for unlimited.
    pub fn max_attempts(mut self, attempts: Option<u32>) -> Self {
        self.attempts = attempts.filter(|a| *a > 0);
        self
    }

    /// Set the overall deadline relative to the first `next()`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Set the overall deadline, `None` for unbounded.
    pub fn deadline_after(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    /// Set the pause between attempts.
    pub fn sleep(mut self, sleep: Duration) -> Self {
        self.sleep = sleep;
        self
    }

    /// Whether exhaustion yields an error (default) or ends silently.
    pub fn raise_on_exhaustion(mut self, raise: bool) -> Self {
        self.raise_on_exhaustion = raise;
        self
    }

    /// Replace the default exhaustion message.
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Start iterating. The deadline clock starts now.
    pub fn iter(&self) -> RetryIter {
        RetryIter {
            config: self.clone(),
            deadline: self.timeout.map(|t| Instant::now() + t),
            attempt: 0,
            done: false,
            exhaustion: None,
        }
    }
}

/// Iterator over attempt numbers produced by [`Retry::iter`].
#[derive(Debug)]
pub struct RetryIter {
    config: Retry,
    deadline: Option<Instant>,
    attempt: u32,
    done: bool,
    exhaustion: Option<Exhaustion>,
}

impl RetryIter {
    /// Attempts yielded so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The condition that ended the loop, once it has ended.
    pub fn exhaustion(&self) -> Option<Exhaustion> {
        self.exhaustion
    }

    /// Time left before the deadline, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() > d)
    }

    fn finish(&mut self, kind: Exhaustion) -> Option<Result<u32>> {
        self.done = true;
        self.exhaustion = Some(kind);
        if !self.config.raise_on_exhaustion {
            return None;
        }
        let message = match (&self.config.message, kind) {
            (Some(message), _) => message.clone(),
            (None, Exhaustion::Deadline) => format!(
                "timed out after {} seconds",
                self.config.timeout.map(|t| t.as_secs()).unwrap_or(0)
            ),
            (None, Exhaustion::Attempts) => format!(
                "retried unsuccessfully {} times",
                self.config.attempts.unwrap_or(0)
            ),
        };
        Some(Err(match kind {
            Exhaustion::Deadline => ExecError::TimeoutExceeded(message),
            Exhaustion::Attempts => ExecError::AttemptsExceeded(message),
        }))
    }
}

impl Iterator for RetryIter {
    type Item = Result<u32>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        if self.attempt > 0 {
            // The caller's body ran and did not break out.
            if self.config.attempts == Some(self.attempt) {
                return self.finish(Exhaustion::Attempts);
            }
            if self.deadline_passed() {
                return self.finish(Exhaustion::Deadline);
            }
            let pause = match self.remaining() {
                Some(remaining) => remaining.min(self.config.sleep),
                None => self.config.sleep,
            };
            if !pause.is_zero() {
                std::thread::sleep(pause);
            }
        }

        if self.deadline_passed() {
            return self.finish(Exhaustion::Deadline);
        }

        self.attempt += 1;
        Some(Ok(self.attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempts_exhaustion() {
        let retry = Retry::new().attempts(3).sleep(Duration::ZERO);
        let mut seen = Vec::new();
        let mut error = None;
        for attempt in retry.iter() {
            match attempt {
                Ok(n) => seen.push(n),
                Err(e) => error = Some(e),
            }
        }
        assert_eq!(seen, vec![1, 2, 3]);
        assert!(matches!(error, Some(ExecError::AttemptsExceeded(ref m)) if m == "retried unsuccessfully 3 times"));
    }

    #[test]
    fn test_timeout_exhaustion_bounds() {
        let timeout = Duration::from_millis(300);
        let sleep = Duration::from_millis(50);
        let start = Instant::now();
        let retry = Retry::new().timeout(timeout).sleep(sleep);
        let result: Result<Vec<u32>> = retry.iter().collect();
        let elapsed = start.elapsed();

        assert!(matches!(result, Err(ExecError::TimeoutExceeded(_))));
        assert!(elapsed >= timeout, "ended early: {elapsed:?}");
        assert!(elapsed <= timeout + sleep + Duration::from_millis(100), "ended late: {elapsed:?}");
    }

    #[test]
    fn test_silent_exhaustion() {
        let retry = Retry::new()
            .attempts(2)
            .sleep(Duration::ZERO)
            .raise_on_exhaustion(false);
        let mut iter = retry.iter();
        assert_eq!(iter.next().map(|r| r.ok()), Some(Some(1)));
        assert_eq!(iter.next().map(|r| r.ok()), Some(Some(2)));
        assert!(iter.next().is_none());
        assert_eq!(iter.exhaustion(), Some(Exhaustion::Attempts));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_custom_message() {
        let retry = Retry::new()
            .attempts(1)
            .sleep(Duration::ZERO)
            .message("host never came up");
        let last = retry.iter().last();
        assert!(matches!(last, Some(Err(ExecError::AttemptsExceeded(ref m))) if m == "host never came up"));
    }

    #[test]
    fn test_with_limits_non_positive_is_unbounded() {
        let retry = Retry::with_limits(-1, -1.0).sleep(Duration::ZERO);
        assert_eq!(retry.iter().take(50).filter(|r| r.is_ok()).count(), 50);

        let retry = Retry::with_limits(4, 0.0).sleep(Duration::ZERO);
        assert_eq!(retry.iter().filter(|r| r.is_ok()).count(), 4);
    }

    #[test]
    fn test_break_on_success_stops_early() {
        let retry = Retry::new().attempts(10).sleep(Duration::ZERO);
        let mut last = 0;
        for attempt in retry.iter() {
            last = attempt.unwrap();
            if last == 4 {
                break;
            }
        }
        assert_eq!(last, 4);
    }
}
