//! `Check`: per-model operation dispatch, inline or via a queued process job
//! (spec §4.7 "Check").

use chrono::Utc;

use crate::error::QueueError;

use super::registry::Operation;
use super::scan::ProcessJob;
use super::{Model, Reactor};

/// Context handed to an operation's processor (spec §4.7 "Check", "ProcessJob").
pub struct OperationContext<M: Model> {
    /// The model at the time the operation ran: the caller's in-progress
    /// mutation for a sync operation, or the freshly loaded record for an
    /// async `ProcessJob`.
    pub model: M,
    /// `true` inline in `Check`, `false` from a queued `ProcessJob`.
    pub sync: bool,
}

/// What an operation's processor decided (spec §4.7 "Check", "ProcessJob").
pub enum ProcessorOutcome<M> {
    /// The operation ran to completion. The closure stands in for the
    /// spec's "update document": merged into the in-memory model during
    /// `Check`, or applied atomically alongside the tag decrement during
    /// `ProcessJob`.
    Done(Box<dyn FnOnce(&mut M) + Send>),
    /// Not ready yet; fall back to (or remain on) the async path.
    Defer,
}

impl<M: Model> Reactor<M> {
    /// Run every operation bound to this model type against `model` (spec
    /// §4.7 "Check"). Call this from the embedder's Create/Update modifier
    /// callback.
    ///
    /// `in_transaction` tells `Check` whether the caller is about to persist
    /// `model` as part of an already-open transaction. Only then can a sync
    /// success's tag adjustment ride along with that same write; otherwise
    /// the tag is left as-is and the next scan or process job reconciles it
    /// (spec §9 Open Question: the async path is authoritative for tag
    /// accounting, the sync path clears it only when it can do so
    /// atomically with the model update).
    pub async fn check(&self, model: &mut M, in_transaction: bool) -> Result<(), QueueError> {
        for operation in self.registry.iter() {
            if let Some(filter) = &operation.filter {
                if !filter(model) {
                    continue;
                }
            }

            if operation.sync {
                let ctx = OperationContext {
                    model: model.clone(),
                    sync: true,
                };
                match (operation.processor)(ctx).await.map_err(QueueError::Store)? {
                    ProcessorOutcome::Done(apply) => {
                        apply(model);
                        if in_transaction {
                            let mut tag = model.tag();
                            tag.value = (tag.value - 1).max(0);
                            model.set_tag(tag);
                        }
                    }
                    ProcessorOutcome::Defer => {
                        self.schedule_async(operation, model).await?;
                    }
                }
            } else {
                self.schedule_async(operation, model).await?;
            }
        }
        Ok(())
    }

    /// Enqueue a `ProcessJob`, deduped the same way `ScanJob` dedupes its own
    /// enqueues (`src/reactor/scan.rs`'s `run_scan_job`): labeled
    /// `"{operation}:{model_id}"` with `isolation = operation.tag_expiry`, so
    /// rapid repeated `Check` calls against the same model (spec §8 scenario
    /// 8: a create plus two rapid updates) insert only one in-flight process
    /// job rather than one per call. The outstanding-work tag is incremented
    /// only when this call is the one that actually inserted the job - the
    /// ones that lost the dedup race ride along on the already-scheduled
    /// job's eventual decrement instead of inflating the tag further.
    pub(super) async fn schedule_async(
        &self,
        operation: &Operation<M>,
        model: &mut M,
    ) -> Result<(), QueueError> {
        let expiry = Utc::now()
            + chrono::Duration::from_std(operation.tag_expiry).unwrap_or_else(|_| chrono::Duration::zero());

        let payload = ProcessJob::<M>::new(operation.name, model.model_id());
        let data = serde_json::to_value(&payload).map_err(|e| QueueError::Store(e.into()))?;
        let label = format!("{}:{}", operation.name, model.model_id());
        let inserted = crate::ops::enqueue_raw(
            self.job_store.as_ref(),
            M::PROCESS_JOB_NAME,
            data,
            label,
            std::time::Duration::ZERO,
            operation.tag_expiry,
        )
        .await?;

        if inserted {
            self.store
                .adjust_tag(&model.model_id(), 1, expiry)
                .await
                .map_err(|e| QueueError::Store(e.into()))?;

            let mut tag = model.tag();
            tag.value += 1;
            tag.expiry = expiry;
            model.set_tag(tag);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use tokio::sync::Mutex;

    use super::*;
    use crate::reactor::{ModelId, ModelStore, Revision, StoreError, Tag};
    use crate::store::memory::InMemoryStore;
    use crate::store::Store;

    #[derive(Clone)]
    struct Counter {
        id: String,
        value: i64,
        tag: Tag,
    }

    impl Model for Counter {
        const PROCESS_JOB_NAME: &'static str = "counter.process";
        const SCAN_JOB_NAME: &'static str = "counter.scan";

        fn model_id(&self) -> ModelId {
            self.id.clone()
        }
        fn tag(&self) -> Tag {
            self.tag
        }
        fn set_tag(&mut self, tag: Tag) {
            self.tag = tag;
        }
    }

    #[derive(Default)]
    struct FakeModelStore {
        models: Mutex<std::collections::HashMap<String, (Counter, Revision)>>,
        tag_adjustments: AtomicUsize,
    }

    #[async_trait]
    impl ModelStore<Counter> for FakeModelStore {
        async fn load(&self, id: &ModelId) -> Result<Option<(Counter, Revision)>, StoreError> {
            Ok(self.models.lock().await.get(id).cloned())
        }

        async fn save(&self, id: &ModelId, model: &Counter, expected: Revision) -> Result<Revision, StoreError> {
            let mut models = self.models.lock().await;
            let current = models.get(id).map(|(_, r)| *r).unwrap_or(Revision::NONE);
            if current != expected {
                return Err(StoreError::Conflict);
            }
            let next = expected.next();
            models.insert(id.clone(), (model.clone(), next));
            Ok(next)
        }

        async fn adjust_tag(&self, id: &ModelId, delta: i64, expiry: DateTime<Utc>) -> Result<(), StoreError> {
            self.tag_adjustments.fetch_add(1, Ordering::SeqCst);
            let mut models = self.models.lock().await;
            if let Some((model, _)) = models.get_mut(id) {
                let mut tag = model.tag;
                tag.value = (tag.value + delta).max(0);
                tag.expiry = expiry;
                model.tag = tag;
            }
            Ok(())
        }

        async fn scan(&self, _operation: &'static str, batch: usize) -> Result<Vec<Counter>, StoreError> {
            Ok(self
                .models
                .lock()
                .await
                .values()
                .filter(|(m, _)| m.tag.is_outstanding())
                .take(batch)
                .map(|(m, _)| m.clone())
                .collect())
        }
    }

    fn reactor() -> (Reactor<Counter>, Arc<FakeModelStore>) {
        let model_store = Arc::new(FakeModelStore::default());
        let job_store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        (Reactor::new(model_store.clone(), job_store), model_store)
    }

    #[tokio::test]
    async fn sync_operation_merges_update_in_memory() {
        let (mut reactor, _) = reactor();
        reactor
            .add(Operation::new("double", true, |ctx: OperationContext<Counter>| async move {
                let doubled = ctx.model.value * 2;
                Ok(ProcessorOutcome::Done(Box::new(move |m: &mut Counter| {
                    m.value = doubled;
                })))
            }))
            .unwrap();

        let mut model = Counter {
            id: "c1".into(),
            value: 7,
            tag: Tag::none(Utc::now()),
        };
        reactor.check(&mut model, false).await.unwrap();
        assert_eq!(model.value, 14);
        assert!(!model.tag.is_outstanding());
    }

    #[tokio::test]
    async fn async_operation_increments_tag_and_enqueues_process_job() {
        let (mut reactor, model_store) = reactor();
        reactor
            .add(Operation::new("slow", false, |ctx: OperationContext<Counter>| async move {
                Ok(ProcessorOutcome::Done(Box::new(move |m: &mut Counter| {
                    m.value = ctx.model.value;
                })))
            }))
            .unwrap();

        let mut model = Counter {
            id: "c2".into(),
            value: 1,
            tag: Tag::none(Utc::now()),
        };
        model_store
            .models
            .lock()
            .await
            .insert(model.id.clone(), (model.clone(), Revision::NONE));

        reactor.check(&mut model, false).await.unwrap();
        assert_eq!(model.tag.value, 1);
        assert_eq!(model_store.tag_adjustments.load(Ordering::SeqCst), 1);

        let all = reactor
            .job_store
            .find_all(crate::store::JobFilter::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, Counter::PROCESS_JOB_NAME);
    }

    #[tokio::test]
    async fn rapid_repeated_checks_enqueue_a_single_process_job() {
        // Spec §8 scenario 8: a create plus two rapid updates, all async
        // `Check` calls, before the process job has a chance to run.
        let (mut reactor, model_store) = reactor();
        reactor
            .add(Operation::new("slow", false, |ctx: OperationContext<Counter>| async move {
                Ok(ProcessorOutcome::Done(Box::new(move |m: &mut Counter| {
                    m.value = ctx.model.value;
                })))
            }))
            .unwrap();

        let mut model = Counter {
            id: "c5".into(),
            value: 7,
            tag: Tag::none(Utc::now()),
        };
        model_store
            .models
            .lock()
            .await
            .insert(model.id.clone(), (model.clone(), Revision::NONE));

        reactor.check(&mut model, false).await.unwrap();
        model.value = 14;
        reactor.check(&mut model, false).await.unwrap();
        model.value = 28;
        reactor.check(&mut model, false).await.unwrap();

        assert_eq!(model.tag.value, 1);

        let all = reactor
            .job_store
            .find_all(crate::store::JobFilter::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn filter_skips_non_matching_models() {
        let (mut reactor, _) = reactor();
        reactor
            .add(
                Operation::new("double", true, |ctx: OperationContext<Counter>| async move {
                    let doubled = ctx.model.value * 2;
                    Ok(ProcessorOutcome::Done(Box::new(move |m: &mut Counter| {
                        m.value = doubled;
                    })))
                })
                .with_filter(|m: &Counter| m.value > 100),
            )
            .unwrap();

        let mut model = Counter {
            id: "c3".into(),
            value: 7,
            tag: Tag::none(Utc::now()),
        };
        reactor.check(&mut model, false).await.unwrap();
        assert_eq!(model.value, 7);
    }

    #[tokio::test]
    async fn sync_defer_falls_back_to_async_path() {
        let (mut reactor, model_store) = reactor();
        reactor
            .add(Operation::new("maybe", true, |_ctx: OperationContext<Counter>| async move {
                Ok(ProcessorOutcome::Defer)
            }))
            .unwrap();

        let mut model = Counter {
            id: "c4".into(),
            value: 1,
            tag: Tag::none(Utc::now()),
        };
        model_store
            .models
            .lock()
            .await
            .insert(model.id.clone(), (model.clone(), Revision::NONE));

        reactor.check(&mut model, false).await.unwrap();
        assert!(model.tag.is_outstanding());
    }
}
