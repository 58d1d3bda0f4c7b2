//! `Await`/`AwaitJob`: synchronously wait for a triggering job and everything
//! it transitively spawns to reach a terminal state (spec §4.6).
//!
//! Named with a trailing underscore to dodge the `await` keyword. Consumes
//! the same `Reconcile` stream the board does, but scoped to a single call
//! rather than a long-lived task.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use futures::StreamExt;

use crate::error::QueueError;
use crate::job::Job;
use crate::ops;
use crate::store::{JobId, JobState, ReconcileEvent, Store};

/// Why an [`await_jobs`]/[`await_job`] call ended early with an error.
#[derive(Debug, thiserror::Error)]
pub enum AwaitError {
    /// A watched job transitioned into `Failed` or `Cancelled`.
    #[error("job failed: {reason}")]
    JobFailed {
        /// Jobs observed before the failure.
        jobs_seen: i64,
        /// The failing job's last event reason.
        reason: String,
    },
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Enqueue `job` and wait for it (and everything it spawns) to terminate
/// (spec §6 `AwaitJob`). `timeout = None` waits indefinitely.
pub async fn await_job<J: Job>(
    store: &dyn Store,
    timeout: Option<Duration>,
    job: &J,
) -> Result<i64, AwaitError> {
    await_jobs(store, timeout, || async move {
        ops::enqueue(store, job, "", Duration::ZERO, Duration::ZERO).await?;
        Ok(())
    })
    .await
}

/// Run `trigger`, then wait for every job it (transitively) spawns to
/// terminate (spec §4.6).
///
/// - `trigger` runs once the reconcile stream's initial sync completes, so
///   every job it creates - and every job those jobs create before
///   terminating - is observed.
/// - Returns `Ok(num)` once the outstanding set empties after having seen at
///   least one job, or once `timeout` elapses (with whatever count had
///   accumulated; no outstanding jobs is not an error).
/// - Returns `Err(AwaitError::JobFailed { .. })` on the first `Failed` or
///   `Cancelled` transition observed, carrying that job's reason.
pub async fn await_jobs<F, Fut>(
    store: &dyn Store,
    timeout: Option<Duration>,
    trigger: F,
) -> Result<i64, AwaitError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(), QueueError>>,
{
    let mut stream = store
        .reconcile()
        .await
        .map_err(QueueError::Store)
        .map_err(AwaitError::Queue)?;

    let mut outstanding: HashSet<JobId> = HashSet::new();
    let mut num: i64 = 0;
    let mut seen_any = false;
    let mut trigger = Some(trigger);

    // No real "infinite" duration exists for `Instant` arithmetic; stand in
    // with a century, far past any practical `timeout`.
    const NO_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 100);
    let sleep = match timeout {
        Some(d) if !d.is_zero() => tokio::time::sleep(d),
        _ => tokio::time::sleep(NO_TIMEOUT),
    };
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return Ok(num),
            event = stream.next() => {
                let Some(event) = event else { return Ok(num) };
                match event {
                    ReconcileEvent::Opened => {
                        if let Some(cb) = trigger.take() {
                            cb().await?;
                        }
                    }
                    ReconcileEvent::Created(record) => {
                        if outstanding.insert(record.id) {
                            seen_any = true;
                            num += 1;
                        }
                    }
                    ReconcileEvent::Updated(record) => match record.state {
                        JobState::Dequeued => {
                            if outstanding.insert(record.id) {
                                seen_any = true;
                                num += 1;
                            }
                        }
                        JobState::Completed => {
                            outstanding.remove(&record.id);
                            if seen_any && outstanding.is_empty() {
                                return Ok(num);
                            }
                        }
                        JobState::Failed | JobState::Cancelled => {
                            let reason = record
                                .events
                                .last()
                                .and_then(|e| e.reason.clone())
                                .unwrap_or_default();
                            return Err(AwaitError::JobFailed { jobs_seen: num, reason });
                        }
                        JobState::Enqueued => {}
                    },
                    ReconcileEvent::Errored(_) | ReconcileEvent::Stopped => return Ok(num),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Echo {
        value: i32,
    }
    impl Job for Echo {
        const NAME: &'static str = "echo";
    }

    #[tokio::test]
    async fn await_job_counts_one_for_a_job_that_completes() {
        let store = InMemoryStore::new();
        let echo = Echo { value: 1 };

        let store_ref: &dyn Store = &store;
        let await_fut = await_job(store_ref, None, &echo);
        let driver = async {
            // Give await_job a moment to open the stream and run its
            // trigger before we dequeue/complete the job it enqueued.
            tokio::time::sleep(Duration::from_millis(10)).await;
            loop {
                let all = store
                    .find_all(crate::store::JobFilter::default())
                    .await
                    .unwrap();
                if let Some(record) = all.into_iter().find(|r| r.state == JobState::Enqueued) {
                    let dequeued = ops::dequeue(&store, record.id, Duration::from_secs(10))
                        .await
                        .unwrap()
                        .unwrap();
                    ops::complete(&store, dequeued.id, dequeued.data).await.unwrap();
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };

        let (result, ()) = tokio::join!(await_fut, driver);
        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test]
    async fn await_jobs_reports_failure_reason() {
        let store = InMemoryStore::new();
        let store_ref: &dyn Store = &store;

        let await_fut = await_jobs(store_ref, None, || async {
            ops::enqueue(
                store_ref,
                &Echo { value: 1 },
                "",
                Duration::ZERO,
                Duration::ZERO,
            )
            .await?;
            Ok(())
        });

        let driver = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let all = store
                .find_all(crate::store::JobFilter::default())
                .await
                .unwrap();
            let record = all.into_iter().next().unwrap();
            let dequeued = ops::dequeue(&store, record.id, Duration::from_secs(10))
                .await
                .unwrap()
                .unwrap();
            ops::cancel(&store, dequeued.id, "bad input").await.unwrap();
        };

        let (result, ()) = tokio::join!(await_fut, driver);
        match result {
            Err(AwaitError::JobFailed { reason, .. }) => assert_eq!(reason, "bad input"),
            other => panic!("expected JobFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_returns_accumulated_count_without_error() {
        let store = InMemoryStore::new();
        let store_ref: &dyn Store = &store;

        let result = await_jobs(store_ref, Some(Duration::from_millis(20)), || async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(result, 0);
    }
}
