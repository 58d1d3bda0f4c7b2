//! # queuecore
//!
//! A persistent, distributed job queue built on top of an abstract
//! document-store change feed, plus a reactor for driving idempotent
//! per-model operations off the same store.
//!
//! ## Core concepts
//!
//! - [`job::Job`] = a typed payload registered under a stable name.
//! - [`job::Task`] = a [`job::Job`] plus a handler and policy ([`job::TaskConfig`]).
//! - [`store::Store`] = the document-store contract an embedder implements:
//!   conditional insert/update, point lookups, and a change feed
//!   ([`store::ReconcileEvent`]).
//! - [`ops`] = the five basic operations (`Enqueue`, `Dequeue`, `Complete`,
//!   `Fail`, `Cancel`) as free functions over `&dyn Store`, implementing the
//!   job state machine.
//! - [`board::Board`] = a per-task in-memory index of available jobs, kept
//!   warm by the change feed so workers don't poll the store directly.
//! - [`worker::TaskWorker`] = one worker loop per board slot: poll, dequeue,
//!   run, resolve.
//! - [`queue::Queue`] = owns the registry, boards, workers, and the
//!   reconcile-stream consumer; the top-level handle an embedder holds.
//! - [`await_`] = synchronously wait for a triggering job and everything it
//!   transitively enqueues to reach a terminal state.
//! - [`reactor`] = `Check`/`ProcessJob`/`ScanJob`: idempotent operations
//!   bound to a model type, dispatched inline from a mutation callback or
//!   asynchronously via jobs ridden on the same `Queue`.
//!
//! ## Architecture
//!
//! ```text
//! Store (embedder-provided)
//!     │
//!     ▼ reconcile()
//! Board  ◄── Opened/Created/Updated ── Queue::run's reconcile consumer
//!     │
//!     ▼ poll()
//! TaskWorker ── Dequeue ── run handler ── Complete/Fail/Cancel
//!     │
//!     ▼ (handler enqueues more jobs, or a model mutation runs Check)
//! Reactor::check / ProcessJob / ScanJob ── enqueue_raw ──► Store
//! ```
//!
//! ## Key invariants
//!
//! 1. Every state transition goes through the store's conditional-update
//!    primitives (`insert_if_missing`, `update_first`) - concurrent callers
//!    cannot corrupt a job's state machine.
//! 2. `Enqueued -> Dequeued -> {Completed | Failed | Cancelled}`, with
//!    `Failed` non-terminal and eligible for re-dequeue until `max_attempts`.
//! 3. A board's view of "available" is advisory; the store's filters are
//!    authoritative. A stale board entry just causes a wasted poll.
//!
//! ## What this is not
//!
//! `queuecore` is **not**:
//! - A storage backend (bring your own [`store::Store`])
//! - A distributed lock manager
//! - A saga/workflow orchestrator, beyond `await_`'s "wait for the fan-out
//!   to settle" helper

pub mod await_;
pub mod backoff;
pub mod board;
pub mod error;
pub mod job;
pub mod ops;
pub mod queue;
pub mod reactor;
pub mod store;
pub mod worker;

pub use await_::{await_job, await_jobs, AwaitError};
pub use backoff::backoff;
pub use board::Board;
pub use error::QueueError;
pub use job::{ErasedTask, Failure, HandlerOutcome, Job, Task, TaskConfig, TaskRegistry};
pub use ops::{cancel, complete, dequeue, enqueue, enqueue_raw, fail, load};
pub use queue::{Queue, Ready};
pub use reactor::{Model, ModelStore, Operation, OperationRegistry, Reactor, Revision, StoreError, Tag};
pub use store::{JobFilter, JobId, JobRecord, JobState, JobUpdate, ReconcileEvent, Store};
pub use worker::{default_reporter, Reporter, TaskWorker};
