//! Structured error types for the queue and reactor.
//!
//! # The Error Boundary Rule
//!
//! > **Arbitrary backend errors stay in `anyhow`; operations the caller is
//! > expected to pattern-match on return [`QueueError`].**
//!
//! - `anyhow::Error` is what a [`Store`](crate::store::Store) implementer
//!   returns - connection failures, serialization bugs, whatever their
//!   backend throws at them.
//! - `QueueError` is what `Enqueue`/`Dequeue`/`Complete`/`Fail`/`Cancel`, the
//!   queue, and the reactor return to their callers - a small, closed set of
//!   conditions a caller can branch on.

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the public queue and reactor operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// `Dequeue` was called with a zero timeout.
    #[error("missing timeout: Dequeue requires timeout > 0")]
    MissingTimeout,

    /// `Complete`/`Fail`/`Cancel` found no record for the given id in the
    /// expected state. This should not happen if the worker just dequeued
    /// the same id - it indicates a programmer error or a record that was
    /// mutated out of band.
    #[error("missing job: no record for id {id} in the expected state")]
    MissingJob {
        /// The job id that could not be transitioned.
        id: Uuid,
    },

    /// `Queue::Add` was called twice with the same task name.
    #[error("duplicate task name: {name}")]
    DuplicateTaskName {
        /// The task name that collided.
        name: &'static str,
    },

    /// A reactor operation was registered twice under the same name.
    #[error("duplicate operation name: {name}")]
    DuplicateOperationName {
        /// The operation name that collided.
        name: &'static str,
    },

    /// The task a handler just ran longer than the attempt's `Timeout`, and
    /// the watchdog fired before it returned.
    #[error("ran longer than the specified lifetime")]
    LifetimeExceeded,

    /// The underlying store failed. Basic operations are side-effect-free on
    /// this error: the conditional update either happened or it did not.
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_timeout_message() {
        let err = QueueError::MissingTimeout;
        assert_eq!(err.to_string(), "missing timeout: Dequeue requires timeout > 0");
    }

    #[test]
    fn missing_job_includes_id() {
        let id = Uuid::nil();
        let err = QueueError::MissingJob { id };
        assert!(err.to_string().contains(&id.to_string()));
    }

    #[test]
    fn store_error_wraps_anyhow() {
        let inner = anyhow::anyhow!("connection reset");
        let err: QueueError = inner.into();
        assert!(matches!(err, QueueError::Store(_)));
        assert!(err.to_string().contains("connection reset"));
    }
}
