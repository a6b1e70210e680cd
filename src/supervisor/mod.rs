//! Thread supervision.
//!
//! Each concurrent unit of work runs as a [`Worker`] on its own OS thread.
//! Failures are captured on the worker, appended to a timestamp-ordered
//! [`FailureRecord`] and re-raised at join. Cancellation is cooperative
//! through a [`CancelToken`].

mod cancel;
mod failure;
mod id;
mod worker;

pub use cancel::CancelToken;
pub use failure::{FailureEntry, FailureReceiver, FailureRecord};
pub use id::WorkerId;
pub use worker::{Worker, WorkerBuilder, ABORT_INTERVAL};
