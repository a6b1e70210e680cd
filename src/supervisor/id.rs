//! Worker identifier type.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::ExecError;

/// Global counter for worker ID generation.
static COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier for a supervised worker.
///
/// Displayed as `worker-XXXXXXXX` where X is a hexadecimal digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl WorkerId {
    /// Allocate the next worker ID.
    pub fn next() -> Self {
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw u64 value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Create a WorkerId from a raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{:08x}", self.0)
    }
}

impl FromStr for WorkerId {
    type Err = ExecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix("worker-")
            .and_then(|hex| u64::from_str_radix(hex, 16).ok())
            .map(WorkerId)
            .ok_or_else(|| ExecError::InvalidArgument(format!("not a worker id: {s}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let a = WorkerId::next();
        let b = WorkerId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_display_roundtrip() {
        let id = WorkerId::from_raw(0x2a);
        assert_eq!(id.to_string(), "worker-0000002a");
        assert_eq!("worker-0000002a".parse::<WorkerId>().unwrap(), id);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("sess-01".parse::<WorkerId>().is_err());
        assert!("worker-zz".parse::<WorkerId>().is_err());
    }
}
