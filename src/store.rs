//! Abstract document-store primitives the queue is built on.
//!
//! Splits policy from persistence: [`crate::job`] decides, a [`Store`]
//! implementer persists. This crate owns the state machine, conditional-
//! update contracts, and change-feed consumption; an embedder supplies a
//! concrete `Store` backed by whatever database it already runs.
//!
//! Recommended indexes for a real backend (see spec §6): `name`, `state`,
//! `finished` (TTL-style expiry), and a composite `(name, label, state)` to
//! accelerate labeled insert-if-absent.

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unique job identifier.
pub type JobId = Uuid;

/// One state in the job lifecycle (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Waiting to be dequeued (`available` may still be in the future).
    Enqueued,
    /// Claimed by a worker; re-dequeue-able once `available` (the visibility
    /// deadline) passes without a terminal transition.
    Dequeued,
    /// Terminal: ran successfully.
    Completed,
    /// Non-terminal: ran and failed, eligible for redequeue after `available`.
    Failed,
    /// Terminal: abandoned, will not run again.
    Cancelled,
}

impl JobState {
    /// States in which a record is a candidate for the board / redequeue.
    pub const DEQUEUE_ELIGIBLE: [JobState; 3] =
        [JobState::Enqueued, JobState::Dequeued, JobState::Failed];

    /// Terminal states: `finished` is set, no further transitions occur.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Cancelled)
    }
}

/// One entry in a job's causally-ordered transition history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    /// When the transition happened.
    pub timestamp: DateTime<Utc>,
    /// The state the job transitioned into.
    pub state: JobState,
    /// Present on `Failed`/`Cancelled` events.
    pub reason: Option<String>,
}

impl JobEvent {
    /// Construct an event with no reason (Enqueued, Dequeued, Completed).
    pub fn new(timestamp: DateTime<Utc>, state: JobState) -> Self {
        Self {
            timestamp,
            state,
            reason: None,
        }
    }

    /// Construct an event carrying a reason (Failed, Cancelled).
    pub fn with_reason(timestamp: DateTime<Utc>, state: JobState, reason: impl Into<String>) -> Self {
        Self {
            timestamp,
            state,
            reason: Some(reason.into()),
        }
    }
}

/// The persisted job record (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique id, assigned at `Enqueue` time.
    pub id: JobId,
    /// Registered task name.
    pub name: String,
    /// Optional exclusivity tag; empty string means "no label".
    pub label: String,
    /// Opaque serialized job payload.
    pub data: Value,
    /// Current lifecycle state.
    pub state: JobState,
    /// First insertion time.
    pub created: DateTime<Utc>,
    /// Monotonically-increasing time at which the job may next be dequeued.
    pub available: DateTime<Utc>,
    /// Last dequeue time.
    pub started: Option<DateTime<Utc>>,
    /// Last attempt end time (set by Complete, Fail, and Cancel).
    pub ended: Option<DateTime<Utc>>,
    /// Set only on Completed or Cancelled; terminal marker.
    pub finished: Option<DateTime<Utc>>,
    /// Incremented on every successful dequeue.
    pub attempts: i64,
    /// Ordered transition history.
    pub events: Vec<JobEvent>,
}

impl JobRecord {
    /// `attempts` must equal the count of Dequeued events (spec invariant 2).
    pub fn dequeue_event_count(&self) -> usize {
        self.events
            .iter()
            .filter(|e| e.state == JobState::Dequeued)
            .count()
    }
}

/// Filter used by `find_one`/`find_all`/`update_first`/`insert_if_missing`.
///
/// Fields are conjunctive (AND). `None` means "don't constrain on this
/// field". This is intentionally a plain struct rather than a query
/// builder: the abstract store primitives in spec §2 only need conjunction.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Match a specific job id.
    pub id: Option<JobId>,
    /// Match a specific task name.
    pub name: Option<String>,
    /// Match a specific label.
    pub label: Option<String>,
    /// Match any of these states.
    pub states: Option<Vec<JobState>>,
    /// Match records whose `available <= at`.
    pub available_before: Option<DateTime<Utc>>,
    /// Match records whose `finished > after` (used for isolation windows).
    pub finished_after: Option<DateTime<Utc>>,
    /// Match records that are non-terminal (state not in {Completed, Cancelled}).
    pub non_terminal: bool,
    /// Disjunction group: if non-empty, at least one of these sub-filters
    /// must also match (ANDed with every other field above). This is the
    /// only way this crate expresses `OR` - e.g. `Enqueue`'s isolation
    /// predicate ("non-terminal OR terminal-but-recently-finished") is
    /// `{name, label, or: [non_terminal, finished_after]}`. A real backend
    /// implements this as a native `$or`/`OR` clause.
    pub or: Vec<JobFilter>,
}

impl JobFilter {
    /// Filter matching a single job id, used by `Dequeue`/`Complete`/`Fail`/`Cancel`.
    pub fn by_id(id: JobId) -> Self {
        Self {
            id: Some(id),
            ..Default::default()
        }
    }

    /// Does `record` satisfy this filter? Used by [`InMemoryStore`](crate::store::memory::InMemoryStore)
    /// and by callers that want to check a filter against an in-memory copy
    /// (e.g. the board refreshing its view, the reactor re-checking a model).
    pub fn matches(&self, record: &JobRecord) -> bool {
        if let Some(id) = self.id {
            if record.id != id {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if &record.name != name {
                return false;
            }
        }
        if let Some(label) = &self.label {
            if &record.label != label {
                return false;
            }
        }
        if let Some(states) = &self.states {
            if !states.contains(&record.state) {
                return false;
            }
        }
        if let Some(before) = self.available_before {
            if record.available > before {
                return false;
            }
        }
        if let Some(after) = self.finished_after {
            match record.finished {
                Some(f) if f > after => {}
                _ => return false,
            }
        }
        if self.non_terminal && record.state.is_terminal() {
            return false;
        }
        if !self.or.is_empty() && !self.or.iter().any(|f| f.matches(record)) {
            return false;
        }
        true
    }
}

/// A conditional update applied by `update_first`.
///
/// `update_first` finds the first record matching the filter and applies
/// this update atomically; it is the primitive every basic operation
/// (§4.2) is built from.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    /// New state, if the transition changes state.
    pub state: Option<JobState>,
    /// New `available` time.
    pub available: Option<DateTime<Utc>>,
    /// New `started` time.
    pub started: Option<DateTime<Utc>>,
    /// New `ended` time. `Some(None)` clears it; `None` leaves it untouched.
    pub ended: Option<Option<DateTime<Utc>>>,
    /// New `finished` time.
    pub finished: Option<DateTime<Utc>>,
    /// Replace the payload (handler may have mutated it before Complete).
    pub data: Option<Value>,
    /// Increment `attempts` by this amount (0 if untouched).
    pub increment_attempts: i64,
    /// Event to append to `events`.
    pub push_event: Option<JobEvent>,
}

impl JobUpdate {
    /// Apply this update to a record in place. Used by `InMemoryStore` and
    /// documents the exact semantics a real backend's conditional update
    /// must implement.
    pub fn apply(&self, record: &mut JobRecord) {
        if let Some(state) = self.state {
            record.state = state;
        }
        if let Some(available) = self.available {
            record.available = available;
        }
        if let Some(started) = self.started {
            record.started = Some(started);
        }
        if let Some(ended) = self.ended {
            record.ended = ended;
        }
        if let Some(finished) = self.finished {
            record.finished = Some(finished);
        }
        if let Some(data) = &self.data {
            record.data = data.clone();
        }
        record.attempts += self.increment_attempts;
        if let Some(event) = &self.push_event {
            record.events.push(event.clone());
        }
    }
}

/// Events delivered by [`Store::reconcile`] (spec §2, §6).
#[derive(Debug, Clone)]
pub enum ReconcileEvent {
    /// The change stream is live; the initial sync has completed.
    Opened,
    /// A new document was inserted.
    Created(JobRecord),
    /// An existing document was updated; this is its post-update state.
    Updated(JobRecord),
    /// The change feed hit an error it could recover from.
    Errored(String),
    /// The change feed ended.
    Stopped,
}

/// Abstract document-store primitives (spec §2).
///
/// Any database with conditional updates and a change feed can implement
/// this: `Insert`, `InsertIfMissing`, `UpdateFirst`, `FindOne`, `FindAll`,
/// and `Reconcile`. This crate never talks to a concrete database; see
/// [`memory::InMemoryStore`] for the reference implementation used in tests.
#[async_trait::async_trait]
pub trait Store: Send + Sync + 'static {
    /// Unconditionally insert a new record.
    async fn insert(&self, record: JobRecord) -> anyhow::Result<()>;

    /// Insert `record` only if no existing record matches `filter`.
    /// Returns whether the insert happened.
    async fn insert_if_missing(&self, record: JobRecord, filter: JobFilter) -> anyhow::Result<bool>;

    /// Find the first record matching `filter` and apply `update` to it
    /// atomically. Returns the updated record, or `None` if no record
    /// matched.
    async fn update_first(
        &self,
        filter: JobFilter,
        update: JobUpdate,
    ) -> anyhow::Result<Option<JobRecord>>;

    /// Find a single record matching `filter`.
    async fn find_one(&self, filter: JobFilter) -> anyhow::Result<Option<JobRecord>>;

    /// Find all records matching `filter`.
    async fn find_all(&self, filter: JobFilter) -> anyhow::Result<Vec<JobRecord>>;

    /// Open a change feed over the job collection, delivering `Opened`
    /// first (once the initial sync completes) and `Created`/`Updated`/
    /// `Errored`/`Stopped` thereafter.
    async fn reconcile(&self) -> anyhow::Result<BoxStream<'static, ReconcileEvent>>;
}

/// In-memory reference [`Store`] implementation, used by tests and as a
/// worked example of the contract: a `Mutex<HashMap<..>>` plus a broadcast
/// channel standing in for a change stream.
#[cfg(any(test, feature = "testing"))]
pub mod memory;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample(state: JobState) -> JobRecord {
        let now = Utc::now();
        JobRecord {
            id: Uuid::new_v4(),
            name: "task".into(),
            label: String::new(),
            data: Value::Null,
            state,
            created: now,
            available: now,
            started: None,
            ended: None,
            finished: None,
            attempts: 0,
            events: vec![JobEvent::new(now, JobState::Enqueued)],
        }
    }

    #[test]
    fn filter_by_id_matches_only_that_record() {
        let r = sample(JobState::Enqueued);
        let filter = JobFilter::by_id(r.id);
        assert!(filter.matches(&r));
        let mut other = sample(JobState::Enqueued);
        other.id = Uuid::new_v4();
        assert!(!filter.matches(&other));
    }

    #[test]
    fn non_terminal_excludes_completed_and_cancelled() {
        let filter = JobFilter {
            non_terminal: true,
            ..Default::default()
        };
        assert!(filter.matches(&sample(JobState::Enqueued)));
        assert!(filter.matches(&sample(JobState::Failed)));
        assert!(!filter.matches(&sample(JobState::Completed)));
        assert!(!filter.matches(&sample(JobState::Cancelled)));
    }

    #[test]
    fn available_before_excludes_future_records() {
        let now = Utc::now();
        let mut r = sample(JobState::Enqueued);
        r.available = now + Duration::seconds(10);
        let filter = JobFilter {
            available_before: Some(now),
            ..Default::default()
        };
        assert!(!filter.matches(&r));
        r.available = now - Duration::seconds(10);
        assert!(filter.matches(&r));
    }

    #[test]
    fn update_applies_push_event_and_increments_attempts() {
        let mut r = sample(JobState::Enqueued);
        let now = Utc::now();
        let update = JobUpdate {
            state: Some(JobState::Dequeued),
            started: Some(now),
            increment_attempts: 1,
            push_event: Some(JobEvent::new(now, JobState::Dequeued)),
            ..Default::default()
        };
        update.apply(&mut r);
        assert_eq!(r.state, JobState::Dequeued);
        assert_eq!(r.attempts, 1);
        assert_eq!(r.events.len(), 2);
        assert_eq!(r.dequeue_event_count(), 1);
    }

    #[test]
    fn terminal_states_are_flagged() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Failed.is_terminal());
        assert!(!JobState::Enqueued.is_terminal());
        assert!(!JobState::Dequeued.is_terminal());
    }
}
