//! The reactor: idempotent per-model operations driven by model mutations,
//! direct calls, and periodic scans (spec §4.7).
//!
//! One file per concern: `registry.rs` (name→operation index), `tag.rs` (the
//! outstanding-work marker), `check.rs` (`Check`, the modifier-callback entry
//! point), `scan.rs` (`ScanJob`/`ProcessJob`, registered onto a
//! [`crate::queue::Queue`] as ordinary tasks - the reactor has no worker pool
//! of its own, it rides the same `TaskWorker` machinery every other task
//! uses).
//!
//! `Model`/`ModelStore` split routing identity (`Model::model_id`) from
//! durable state (`ModelStore::load`/`save`), with `Revision`/`StoreError`
//! giving the store optimistic concurrency and a conflict/backend error
//! split, the same shape as the job store's own error boundary.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::QueueError;
use crate::store::Store;

pub mod check;
pub mod registry;
pub mod scan;
pub mod tag;

pub use check::{OperationContext, ProcessorOutcome};
pub use registry::{Operation, OperationRegistry};
pub use scan::{ProcessJob, ScanJob, DEFAULT_MAX_DEFER_DELAY, DEFAULT_SCAN_BATCH};
pub use tag::Tag;

/// Identifies a model instance across a [`ModelStore`] and reactor job
/// payloads. A plain string rather than a newtype: the reactor never
/// interprets it, only threads it through.
pub type ModelId = String;

/// Errors from a [`ModelStore`] (spec §6): a conflict (lost a race on
/// `save`) is a distinct, expected condition from a backend failure.
#[derive(Debug)]
pub enum StoreError {
    /// Another writer saved this model since it was loaded.
    Conflict,
    /// The storage backend failed (timeout, connection, serialization).
    Backend(anyhow::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Conflict => write!(f, "revision conflict: model was modified concurrently"),
            StoreError::Backend(e) => write!(f, "model store backend error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Conflict => None,
            StoreError::Backend(e) => Some(e.as_ref()),
        }
    }
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        StoreError::Backend(err)
    }
}

/// Optimistic-concurrency revision for [`ModelStore::save`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Revision(pub u64);

impl Revision {
    /// A model that has never been saved.
    pub const NONE: Revision = Revision(0);

    /// Construct an explicit revision value.
    pub fn new(value: u64) -> Self {
        Revision(value)
    }

    /// The revision after a successful save.
    pub fn next(self) -> Self {
        Revision(self.0.saturating_add(1))
    }

    /// Is this the `NONE` sentinel?
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    /// The inner counter value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_none() {
            write!(f, "NONE")
        } else {
            write!(f, "r{}", self.0)
        }
    }
}

/// A model type the reactor can schedule [`Operation`]s against (spec §3
/// "Reactor operation", §4.7). Implementors store a [`Tag`] somewhere on
/// their own document; the reactor only asks for it through this trait.
pub trait Model: Clone + Send + Sync + 'static {
    /// Job name used for this model's `ProcessJob`s. Must be distinct from
    /// every other registered task/job name.
    const PROCESS_JOB_NAME: &'static str;
    /// Job name used for this model's `ScanJob`s.
    const SCAN_JOB_NAME: &'static str;

    /// This instance's id, as tracked by [`ModelStore`] and embedded in
    /// `ProcessJob`/`ScanJob` payloads.
    fn model_id(&self) -> ModelId;
    /// The model's current outstanding-work tag.
    fn tag(&self) -> Tag;
    /// Replace the model's tag (in memory; persisting it is the caller's
    /// job, via [`ModelStore::save`] or [`ModelStore::adjust_tag`]).
    fn set_tag(&mut self, tag: Tag);
}

/// Durable storage for a [`Model`] type (spec §6 "a parallel `ModelStore`
/// trait serves the reactor's model collection").
#[async_trait]
pub trait ModelStore<M: Model>: Send + Sync + 'static {
    /// Load a model and its current revision. `None` if it doesn't exist.
    async fn load(&self, id: &ModelId) -> Result<Option<(M, Revision)>, StoreError>;

    /// Persist `model` under optimistic concurrency control: fails with
    /// [`StoreError::Conflict`] if `expected` doesn't match the stored
    /// revision.
    async fn save(&self, id: &ModelId, model: &M, expected: Revision) -> Result<Revision, StoreError>;

    /// Adjust the model's tag counter by `delta` and set its expiry,
    /// without requiring the caller to hold the full model in hand (used by
    /// `Check`'s async path, which only has a reference, not ownership).
    async fn adjust_tag(&self, id: &ModelId, delta: i64, expiry: DateTime<Utc>) -> Result<(), StoreError>;

    /// Candidates for `operation`: the union of that operation's own query
    /// and every model with an outstanding tag (`tag.value > 0`), limited to
    /// `batch` (spec §4.7 "ScanJob"). The in-memory [`Operation::with_filter`]
    /// predicate is applied by the caller afterward.
    async fn scan(&self, operation: &'static str, batch: usize) -> Result<Vec<M>, StoreError>;
}

/// Coordinates [`Operation`]s bound to a single model type: synchronous
/// dispatch from a mutation callback ([`Reactor::check`], in `check.rs`)
/// and asynchronous dispatch via queued jobs ridden on a [`crate::queue::Queue`]
/// ([`Reactor::process_task`]/[`Reactor::scan_task`], in `scan.rs`).
pub struct Reactor<M: Model> {
    pub(crate) registry: OperationRegistry<M>,
    pub(crate) store: Arc<dyn ModelStore<M>>,
    pub(crate) job_store: Arc<dyn Store>,
}

impl<M: Model> Reactor<M> {
    /// Create a reactor with no operations registered yet. `store` persists
    /// models; `job_store` is the same job collection a [`crate::queue::Queue`]
    /// is built on - `ProcessJob`/`ScanJob` are ordinary jobs in it.
    pub fn new(store: Arc<dyn ModelStore<M>>, job_store: Arc<dyn Store>) -> Self {
        Self {
            registry: OperationRegistry::new(),
            store,
            job_store,
        }
    }

    /// Register an operation. Must be called before wiring
    /// [`Reactor::process_task`]/[`Reactor::scan_task`] into a `Queue`, the
    /// same ordering `Queue::add` requires of its own tasks.
    pub fn add(&mut self, operation: Operation<M>) -> Result<(), QueueError> {
        self.registry.add(operation)
    }

    /// Number of registered operations.
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    /// Whether any operations are registered.
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revision_next_saturates_instead_of_overflowing() {
        let r = Revision::new(u64::MAX);
        assert_eq!(r.next(), Revision::new(u64::MAX));
    }

    #[test]
    fn revision_display_formats_none_and_numbered() {
        assert_eq!(Revision::NONE.to_string(), "NONE");
        assert_eq!(Revision::new(3).to_string(), "r3");
    }

    #[test]
    fn store_error_wraps_anyhow_as_backend() {
        let err: StoreError = anyhow::anyhow!("timeout").into();
        assert!(matches!(err, StoreError::Backend(_)));
    }
}
