//! In-memory [`Store`] backed by a `Mutex<HashMap>`. The broadcast channel
//! stands in for a real change feed: every insert/update is pushed to subscribers,
//! and each new `reconcile()` call synthesizes an `Opened` event before
//! forwarding live events, matching the contract a real backend's change
//! stream must honor (`Opened` once the initial sync completes, then
//! `Created`/`Updated` as writes happen).

use std::collections::HashMap;
use std::sync::Mutex;

use futures::stream::{self, BoxStream};
use tokio::sync::broadcast;

use super::{JobFilter, JobId, JobRecord, JobUpdate, ReconcileEvent, Store};

const CHANNEL_CAPACITY: usize = 4096;

/// In-memory [`Store`] for tests and examples.
pub struct InMemoryStore {
    records: Mutex<HashMap<JobId, JobRecord>>,
    changes: broadcast::Sender<ReconcileEvent>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            records: Mutex::new(HashMap::new()),
            changes,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, JobRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Store for InMemoryStore {
    async fn insert(&self, record: JobRecord) -> anyhow::Result<()> {
        let event = ReconcileEvent::Created(record.clone());
        self.lock().insert(record.id, record);
        let _ = self.changes.send(event);
        Ok(())
    }

    async fn insert_if_missing(&self, record: JobRecord, filter: JobFilter) -> anyhow::Result<bool> {
        let mut guard = self.lock();
        if guard.values().any(|existing| filter.matches(existing)) {
            return Ok(false);
        }
        let event = ReconcileEvent::Created(record.clone());
        guard.insert(record.id, record);
        drop(guard);
        let _ = self.changes.send(event);
        Ok(true)
    }

    async fn update_first(
        &self,
        filter: JobFilter,
        update: JobUpdate,
    ) -> anyhow::Result<Option<JobRecord>> {
        let mut guard = self.lock();
        let target_id = guard
            .values()
            .find(|record| filter.matches(record))
            .map(|record| record.id);

        let Some(id) = target_id else {
            return Ok(None);
        };
        let record = guard.get_mut(&id).expect("id came from this map");
        update.apply(record);
        let updated = record.clone();
        drop(guard);
        let _ = self.changes.send(ReconcileEvent::Updated(updated.clone()));
        Ok(Some(updated))
    }

    async fn find_one(&self, filter: JobFilter) -> anyhow::Result<Option<JobRecord>> {
        Ok(self
            .lock()
            .values()
            .find(|record| filter.matches(record))
            .cloned())
    }

    async fn find_all(&self, filter: JobFilter) -> anyhow::Result<Vec<JobRecord>> {
        Ok(self
            .lock()
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect())
    }

    async fn reconcile(&self) -> anyhow::Result<BoxStream<'static, ReconcileEvent>> {
        let rx = self.changes.subscribe();
        let stream = stream::unfold((false, rx), |(opened, mut rx)| async move {
            if !opened {
                return Some((ReconcileEvent::Opened, (true, rx)));
            }
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, (true, rx))),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{JobEvent, JobState};
    use chrono::Utc;
    use futures::StreamExt;
    use uuid::Uuid;

    fn sample(name: &str, label: &str) -> JobRecord {
        let now = Utc::now();
        JobRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            label: label.to_string(),
            data: serde_json::Value::Null,
            state: JobState::Enqueued,
            created: now,
            available: now,
            started: None,
            ended: None,
            finished: None,
            attempts: 0,
            events: vec![JobEvent::new(now, JobState::Enqueued)],
        }
    }

    #[tokio::test]
    async fn insert_then_find_one_round_trips() {
        let store = InMemoryStore::new();
        let record = sample("task", "");
        store.insert(record.clone()).await.unwrap();

        let found = store.find_one(JobFilter::by_id(record.id)).await.unwrap();
        assert_eq!(found.unwrap().id, record.id);
    }

    #[tokio::test]
    async fn insert_if_missing_rejects_when_filter_matches() {
        let store = InMemoryStore::new();
        let record = sample("task", "exclusive");
        let filter = JobFilter {
            name: Some("task".into()),
            label: Some("exclusive".into()),
            non_terminal: true,
            ..Default::default()
        };

        assert!(store
            .insert_if_missing(record.clone(), filter.clone())
            .await
            .unwrap());

        let second = sample("task", "exclusive");
        assert!(!store.insert_if_missing(second, filter).await.unwrap());
    }

    #[tokio::test]
    async fn update_first_applies_and_broadcasts() {
        let store = InMemoryStore::new();
        let record = sample("task", "");
        store.insert(record.clone()).await.unwrap();

        let mut stream = store.reconcile().await.unwrap();
        assert!(matches!(stream.next().await, Some(ReconcileEvent::Opened)));

        let update = JobUpdate {
            state: Some(JobState::Dequeued),
            increment_attempts: 1,
            ..Default::default()
        };
        let updated = store
            .update_first(JobFilter::by_id(record.id), update)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.state, JobState::Dequeued);
        assert_eq!(updated.attempts, 1);

        match stream.next().await {
            Some(ReconcileEvent::Updated(r)) => assert_eq!(r.id, record.id),
            other => panic!("expected Updated, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn update_first_on_missing_record_returns_none() {
        let store = InMemoryStore::new();
        let update = JobUpdate::default();
        let result = store
            .update_first(JobFilter::by_id(Uuid::new_v4()), update)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn find_all_filters_by_state() {
        let store = InMemoryStore::new();
        let a = sample("a", "");
        let mut b = sample("b", "");
        b.state = JobState::Completed;
        store.insert(a.clone()).await.unwrap();
        store.insert(b).await.unwrap();

        let filter = JobFilter {
            non_terminal: true,
            ..Default::default()
        };
        let all = store.find_all(filter).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, a.id);
    }
}
