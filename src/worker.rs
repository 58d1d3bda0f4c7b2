//! Task worker loop (spec §4.4).
//!
//! One [`TaskWorker`] drives one [`Board`] slot: poll for an available
//! record, `Dequeue` it, run the registered handler, and resolve the
//! outcome back into the job state machine. The loop is a `tokio::select!`
//! between doing work and observing a shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::backoff::backoff;
use crate::board::Board;
use crate::error::QueueError;
use crate::job::{ErasedTask, HandlerOutcome};
use crate::ops;
use crate::store::{JobRecord, Store};

/// How a worker reports an error it cannot otherwise surface to the caller
/// (a crashed handler, a panicked handler, a store error on a best-effort
/// write). `Arc<dyn Fn>` rather than a channel, for a cheap out-of-band
/// observation hook the caller doesn't have to poll.
pub type Reporter = Arc<dyn Fn(anyhow::Error) + Send + Sync>;

/// A reporter that logs via `tracing::error!`, used when the embedder
/// doesn't supply one.
pub fn default_reporter() -> Reporter {
    Arc::new(|err| tracing::error!(error = %err, "queuecore worker error"))
}

/// Idle poll interval when a board has nothing available.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Drives one task's board: dequeue, run, resolve, repeat, until told to
/// shut down.
pub struct TaskWorker {
    task: Arc<dyn ErasedTask>,
    board: Arc<Board>,
    store: Arc<dyn Store>,
    reporter: Reporter,
    shutdown: watch::Receiver<bool>,
}

impl TaskWorker {
    /// Construct a worker for `task`, backed by `board` and `store`.
    /// `shutdown` ticks `true` when the worker should stop after its current
    /// iteration.
    pub fn new(
        task: Arc<dyn ErasedTask>,
        board: Arc<Board>,
        store: Arc<dyn Store>,
        reporter: Reporter,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            task,
            board,
            store,
            reporter,
            shutdown,
        }
    }

    /// Run until the shutdown signal fires. Intended to be spawned as its
    /// own task; `Queue` runs `config.workers` of these per registered task.
    pub async fn run(mut self) {
        loop {
            if *self.shutdown.borrow() {
                return;
            }

            match self.board.poll() {
                Some(candidate) => self.attempt(candidate).await,
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
                        _ = self.shutdown.changed() => {}
                    }
                }
            }
        }
    }

    /// Claim `candidate`, run its handler, and resolve the outcome.
    async fn attempt(&self, candidate: JobRecord) {
        let config = self.task.config();

        let dequeued = match ops::dequeue(self.store.as_ref(), candidate.id, config.timeout).await
        {
            Ok(Some(record)) => record,
            // Another worker (on this board or elsewhere) won the race, or
            // the board's in-memory copy is stale; nothing to do.
            Ok(None) => return,
            Err(err) => {
                (self.reporter)(err.into());
                return;
            }
        };

        let run = self.task.run(dequeued.data.clone());
        let outcome = match tokio::time::timeout(config.lifetime, run).await {
            Ok(outcome) => outcome,
            Err(_) => {
                (self.reporter)(QueueError::LifetimeExceeded.into());
                self.finish_failure(&dequeued, "exceeded configured lifetime", true)
                    .await;
                return;
            }
        };

        match outcome {
            HandlerOutcome::Success(data) => {
                match ops::complete(self.store.as_ref(), dequeued.id, data).await {
                    Ok(()) => self.task.notify(false, ""),
                    Err(err) => (self.reporter)(err.into()),
                }
            }
            HandlerOutcome::Failed(failure) => {
                self.finish_failure(&dequeued, &failure.message, failure.retry)
                    .await;
            }
            HandlerOutcome::Crashed(err) => {
                (self.reporter)(err);
                self.finish_failure(&dequeued, "unexpected error in handler", true)
                    .await;
            }
            HandlerOutcome::Panicked(message) => {
                (self.reporter)(anyhow::anyhow!("handler panicked: {message}"));
                self.finish_failure(&dequeued, &message, true).await;
            }
        }
    }

    /// Resolve a non-success outcome: redequeue-eligible `Fail` with
    /// backoff, or terminal `Cancel` once `retry` is false or `max_attempts`
    /// is exhausted.
    async fn finish_failure(&self, record: &JobRecord, reason: &str, retry: bool) {
        let config = self.task.config();
        let attempt = (record.attempts - 1) as u32;
        let exhausted = record.attempts >= config.max_attempts;

        let result = if retry && !exhausted {
            let delay = backoff(config.min_delay, config.max_delay, config.delay_factor, attempt);
            ops::fail(self.store.as_ref(), record.id, reason, delay).await
        } else {
            ops::cancel(self.store.as_ref(), record.id, reason).await
        };

        match result {
            Ok(()) => {
                if !retry || exhausted {
                    self.task.notify(true, reason);
                }
            }
            Err(err) => (self.reporter)(err.into()),
        }
    }
}
