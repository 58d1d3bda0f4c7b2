//! Basic operations: `Enqueue`, `Dequeue`, `Complete`, `Fail`, `Cancel`
//! (spec §4.2).
//!
//! Each is a free async function over `&dyn Store` rather than a method
//! requiring `self` - syntactic sugar functions, not services with their own
//! state. All five rely entirely on the store's conditional-update
//! primitives so that concurrent callers cannot violate the job state
//! machine (spec §4.2 rationale).

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::QueueError;
use crate::job::Job;
use crate::store::{JobEvent, JobFilter, JobId, JobRecord, JobState, JobUpdate, Store};

/// Insert a new job record (spec §4.2 `Enqueue`).
///
/// - If `label` is empty and `isolation` is zero: unconditional insert,
///   always returns `true`.
/// - Otherwise: insert-if-absent under the filter matching records with the
///   same `(name, label)` that are either non-terminal, or terminal with
///   `finished > now - isolation`. Returns whether the insert happened.
pub async fn enqueue<J: Job>(
    store: &dyn Store,
    job: &J,
    label: impl Into<String>,
    delay: std::time::Duration,
    isolation: std::time::Duration,
) -> Result<bool, QueueError> {
    let data = serde_json::to_value(job).map_err(|e| QueueError::Store(e.into()))?;
    enqueue_raw(store, J::NAME, data, label, delay, isolation).await
}

/// Name-and-payload form of `Enqueue`, used for periodic blueprints and any
/// other caller that already has an encoded payload rather than a concrete
/// [`Job`](crate::job::Job) value in hand.
pub async fn enqueue_raw(
    store: &dyn Store,
    name: &str,
    data: Value,
    label: impl Into<String>,
    delay: std::time::Duration,
    isolation: std::time::Duration,
) -> Result<bool, QueueError> {
    let label = label.into();
    let now = Utc::now();
    let record = JobRecord {
        id: Uuid::new_v4(),
        name: name.to_string(),
        label: label.clone(),
        data,
        state: JobState::Enqueued,
        created: now,
        available: now + to_chrono(delay),
        started: None,
        ended: None,
        finished: None,
        attempts: 0,
        events: vec![JobEvent::new(now, JobState::Enqueued)],
    };

    if label.is_empty() && isolation.is_zero() {
        store.insert(record).await?;
        return Ok(true);
    }

    // Reserve the slot: reject the insert if a record with the same
    // (name, label) exists that is either non-terminal, or terminal but
    // finished within the isolation window.
    let finished_after = now - to_chrono(isolation);
    let filter = JobFilter {
        name: Some(name.to_string()),
        label: Some(label),
        or: vec![
            JobFilter {
                non_terminal: true,
                ..Default::default()
            },
            JobFilter {
                finished_after: Some(finished_after),
                ..Default::default()
            },
        ],
        ..Default::default()
    };
    let inserted = store.insert_if_missing(record, filter).await?;
    Ok(inserted)
}

fn to_chrono(d: std::time::Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or(ChronoDuration::zero())
}

/// Claim a job for execution (spec §4.2 `Dequeue`).
///
/// Requires `timeout > 0`. Atomically transitions the first record matching
/// `(id, state in {Enqueued, Dequeued, Failed}, available <= now)` into
/// `Dequeued`, setting `available = now + timeout` (the visibility
/// deadline), incrementing `attempts`, and appending a `Dequeued` event.
/// Loads and returns the full updated record (including decoded `data`),
/// or `None` if another worker won the race or the record was not eligible.
pub async fn dequeue(
    store: &dyn Store,
    id: JobId,
    timeout: std::time::Duration,
) -> Result<Option<JobRecord>, QueueError> {
    if timeout.is_zero() {
        return Err(QueueError::MissingTimeout);
    }

    let now = Utc::now();
    let filter = JobFilter {
        id: Some(id),
        states: Some(JobState::DEQUEUE_ELIGIBLE.to_vec()),
        available_before: Some(now),
        ..Default::default()
    };
    let update = JobUpdate {
        state: Some(JobState::Dequeued),
        available: Some(now + to_chrono(timeout)),
        started: Some(now),
        ended: Some(None),
        increment_attempts: 1,
        push_event: Some(JobEvent::new(now, JobState::Dequeued)),
        ..Default::default()
    };

    Ok(store.update_first(filter, update).await?)
}

/// Fetch the full record for a job, including decoded `data`. Used after a
/// successful `dequeue` to hand the worker a concrete job.
pub async fn load<J: Job>(store: &dyn Store, id: JobId) -> Result<J, QueueError> {
    let record = store
        .find_one(JobFilter::by_id(id))
        .await?
        .ok_or(QueueError::MissingJob { id })?;
    serde_json::from_value(record.data).map_err(|e| QueueError::Store(e.into()))
}

/// Mark a job Completed (spec §4.2 `Complete`).
///
/// Conditional on `state = Dequeued`. `data` replaces the stored payload -
/// the caller passes back whatever the handler returned, since a handler may
/// mutate the job before succeeding. Missing the record signals a programmer
/// error: the worker just dequeued this id.
pub async fn complete(store: &dyn Store, id: JobId, data: Value) -> Result<(), QueueError> {
    let now = Utc::now();
    let filter = JobFilter {
        id: Some(id),
        states: Some(vec![JobState::Dequeued]),
        ..Default::default()
    };
    let update = JobUpdate {
        state: Some(JobState::Completed),
        ended: Some(Some(now)),
        finished: Some(now),
        data: Some(data),
        push_event: Some(JobEvent::new(now, JobState::Completed)),
        ..Default::default()
    };
    store
        .update_first(filter, update)
        .await?
        .map(|_| ())
        .ok_or(QueueError::MissingJob { id })
}

/// Mark a job Failed, non-terminal, eligible for redequeue after `delay`
/// (spec §4.2 `Fail`).
pub async fn fail(
    store: &dyn Store,
    id: JobId,
    reason: impl Into<String>,
    delay: std::time::Duration,
) -> Result<(), QueueError> {
    let now = Utc::now();
    let reason = reason.into();
    let filter = JobFilter {
        id: Some(id),
        states: Some(vec![JobState::Dequeued]),
        ..Default::default()
    };
    let update = JobUpdate {
        state: Some(JobState::Failed),
        available: Some(now + to_chrono(delay)),
        ended: Some(Some(now)),
        push_event: Some(JobEvent::with_reason(now, JobState::Failed, reason)),
        ..Default::default()
    };
    store
        .update_first(filter, update)
        .await?
        .map(|_| ())
        .ok_or(QueueError::MissingJob { id })
}

/// Mark a job Cancelled, terminal (spec §4.2 `Cancel`).
pub async fn cancel(
    store: &dyn Store,
    id: JobId,
    reason: impl Into<String>,
) -> Result<(), QueueError> {
    let now = Utc::now();
    let reason = reason.into();
    let filter = JobFilter {
        id: Some(id),
        states: Some(vec![JobState::Dequeued]),
        ..Default::default()
    };
    let update = JobUpdate {
        state: Some(JobState::Cancelled),
        ended: Some(Some(now)),
        finished: Some(now),
        push_event: Some(JobEvent::with_reason(now, JobState::Cancelled, reason)),
        ..Default::default()
    };
    store
        .update_first(filter, update)
        .await?
        .map(|_| ())
        .ok_or(QueueError::MissingJob { id })
}
