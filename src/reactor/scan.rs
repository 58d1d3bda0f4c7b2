//! `ProcessJob`/`ScanJob`: the reactor's async dispatch and periodic sweep
//! (spec §4.7 "ProcessJob", "ScanJob").
//!
//! Both are ordinary [`Job`]s, run by ordinary [`TaskWorker`](crate::worker::TaskWorker)s
//! once registered onto a [`crate::queue::Queue`] via [`Reactor::process_task`]/
//! [`Reactor::scan_task`] - the reactor itself owns no workers.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::backoff::{backoff, DEFAULT_FACTOR, DEFAULT_MIN_DELAY};
use crate::job::{Failure, Job, Task};
use crate::ops;
use crate::store::Store;

use super::check::{OperationContext, ProcessorOutcome};
use super::registry::OperationRegistry;
use super::{Model, ModelId, ModelStore, Reactor};

/// Default scan batch size (spec §4.7 "ScanJob").
pub const DEFAULT_SCAN_BATCH: usize = 100;

/// How long a process job keeps deferring before it gives up and completes
/// without clearing the model's tag, leaving the next scan to pick the work
/// back up (spec §4.7 "ProcessJob": "stop deferring ... the next scan will
/// pick the work up again"). Tracked per `(operation, model)` in an
/// in-process map rather than on the job record itself - `Fail` doesn't
/// persist a mutated payload (spec §4.2), so there is nowhere durable to
/// count attempts from inside a single process job's retries.
pub const DEFAULT_MAX_DEFER_DELAY: Duration = Duration::from_secs(60);

/// One `(operation, model)` unit of async work (spec §3 "Reactor operation",
/// §4.7 "ProcessJob"). Enqueued by `Check`'s async path and by `ScanJob`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct ProcessJob<M> {
    /// Name of the operation to run.
    pub operation: String,
    /// The model instance to run it against.
    pub model_id: ModelId,
    #[serde(skip)]
    _model: PhantomData<fn() -> M>,
}

impl<M> ProcessJob<M> {
    /// Construct a process job for `operation` against `model_id`.
    pub fn new(operation: &'static str, model_id: ModelId) -> Self {
        Self {
            operation: operation.to_string(),
            model_id,
            _model: PhantomData,
        }
    }
}

impl<M: Model> Job for ProcessJob<M> {
    const NAME: &'static str = M::PROCESS_JOB_NAME;
}

/// A scan request (spec §4.7 "ScanJob"): `None` fans out one scan job per
/// registered operation; `Some(name)` scans that operation's candidates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct ScanJob<M> {
    /// `None` to fan out one scan per operation.
    pub operation: Option<String>,
    #[serde(skip)]
    _model: PhantomData<fn() -> M>,
}

impl<M> ScanJob<M> {
    /// A scan job that fans out one scan per registered operation.
    pub fn all() -> Self {
        Self {
            operation: None,
            _model: PhantomData,
        }
    }

    /// A scan job for a single named operation.
    pub fn one(operation: &'static str) -> Self {
        Self {
            operation: Some(operation.to_string()),
            _model: PhantomData,
        }
    }
}

impl<M: Model> Job for ScanJob<M> {
    const NAME: &'static str = M::SCAN_JOB_NAME;
}

impl<M: Model> Default for ScanJob<M> {
    fn default() -> Self {
        Self::all()
    }
}

impl<M: Model> Reactor<M> {
    /// Build the `ProcessJob` task to register onto a [`crate::queue::Queue`]
    /// (spec §4.7 "ProcessJob"). A single task handles every operation bound
    /// to this model type; the payload's `operation` field picks which one
    /// runs for a given job.
    pub fn process_task(&self) -> Task<ProcessJob<M>> {
        let registry = Arc::new(self.registry.clone());
        let model_store = self.store.clone();
        let defer_attempts: Arc<DashMap<(String, ModelId), u32>> = Arc::new(DashMap::new());

        Task::new(move |job: ProcessJob<M>| {
            let registry = registry.clone();
            let model_store = model_store.clone();
            let defer_attempts = defer_attempts.clone();
            async move { run_process_job(registry, model_store, defer_attempts, job).await }
        })
    }

    /// Build the `ScanJob` task to register onto a [`crate::queue::Queue`],
    /// typically with `TaskConfig::periodicity` set so it sweeps on an
    /// interval (spec §4.7 "ScanJob").
    pub fn scan_task(&self) -> Task<ScanJob<M>> {
        let registry = Arc::new(self.registry.clone());
        let model_store = self.store.clone();
        let job_store = self.job_store.clone();

        Task::new(move |job: ScanJob<M>| {
            let registry = registry.clone();
            let model_store = model_store.clone();
            let job_store = job_store.clone();
            async move { run_scan_job(registry, model_store, job_store, job).await }
        })
    }
}

async fn run_process_job<M: Model>(
    registry: Arc<OperationRegistry<M>>,
    model_store: Arc<dyn ModelStore<M>>,
    defer_attempts: Arc<DashMap<(String, ModelId), u32>>,
    job: ProcessJob<M>,
) -> anyhow::Result<ProcessJob<M>> {
    let Some(operation) = registry.get(&job.operation) else {
        // The operation was unregistered since this job was enqueued.
        return Ok(job);
    };

    let Some((mut model, revision)) = model_store.load(&job.model_id).await.map_err(anyhow::Error::from)? else {
        // Model is gone; nothing left to reconcile.
        return Ok(job);
    };

    let key = (job.operation.clone(), job.model_id.clone());

    if let Some(filter) = &operation.filter {
        if !filter(&model) {
            model_store
                .adjust_tag(&job.model_id, -1, chrono::Utc::now())
                .await
                .map_err(anyhow::Error::from)?;
            defer_attempts.remove(&key);
            return Ok(job);
        }
    }

    let ctx = OperationContext {
        model: model.clone(),
        sync: false,
    };

    match (operation.processor)(ctx).await? {
        ProcessorOutcome::Done(apply) => {
            apply(&mut model);
            let mut tag = model.tag();
            tag.value = (tag.value - 1).max(0);
            model.set_tag(tag);
            model_store
                .save(&job.model_id, &model, revision)
                .await
                .map_err(anyhow::Error::from)?;
            defer_attempts.remove(&key);
            Ok(job)
        }
        ProcessorOutcome::Defer => {
            let attempt = {
                let mut entry = defer_attempts.entry(key.clone()).or_insert(0);
                *entry += 1;
                *entry
            };
            // Clamp the backoff's own ceiling to `DEFAULT_MAX_DEFER_DELAY`
            // (not `DEFAULT_MAX_DELAY`) so the comparison below can actually
            // go false once the attempt count climbs high enough - comparing
            // against a delay clamped to a *smaller* ceiling than the bound
            // would make this branch unreachable.
            let delay = backoff(DEFAULT_MIN_DELAY, DEFAULT_MAX_DEFER_DELAY, DEFAULT_FACTOR, attempt);
            if delay < DEFAULT_MAX_DEFER_DELAY {
                Err(Failure::retryable("deferred").into())
            } else {
                defer_attempts.remove(&key);
                Ok(job)
            }
        }
    }
}

async fn run_scan_job<M: Model>(
    registry: Arc<OperationRegistry<M>>,
    model_store: Arc<dyn ModelStore<M>>,
    job_store: Arc<dyn Store>,
    job: ScanJob<M>,
) -> anyhow::Result<ScanJob<M>> {
    match &job.operation {
        None => {
            for operation in registry.iter() {
                let fanout = ScanJob::<M>::one(operation.name);
                let data = serde_json::to_value(&fanout)?;
                ops::enqueue_raw(job_store.as_ref(), M::SCAN_JOB_NAME, data, "", Duration::ZERO, Duration::ZERO)
                    .await?;
            }
            Ok(job)
        }
        Some(name) => {
            let Some(operation) = registry.get(name) else {
                return Ok(job);
            };

            let candidates = model_store
                .scan(operation.name, DEFAULT_SCAN_BATCH)
                .await
                .map_err(anyhow::Error::from)?;

            for model in candidates {
                if let Some(filter) = &operation.filter {
                    if !filter(&model) {
                        continue;
                    }
                }
                let model_id = model.model_id();
                let payload = ProcessJob::<M>::new(operation.name, model_id.clone());
                let data = serde_json::to_value(&payload)?;
                let label = format!("{}:{}", operation.name, model_id);
                ops::enqueue_raw(
                    job_store.as_ref(),
                    M::PROCESS_JOB_NAME,
                    data,
                    label,
                    Duration::ZERO,
                    operation.tag_expiry,
                )
                .await?;
            }
            Ok(job)
        }
    }
}
