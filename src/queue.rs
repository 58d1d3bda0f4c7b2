//! Queue lifecycle: owns tasks, boards, the reconcile stream, and periodic
//! scheduling (spec §4.5).
//!
//! A struct that owns a registry, spawns one `tokio::task` per worker loop
//! plus housekeeping tasks, tracks their `JoinHandle`s, and coordinates
//! shutdown with `tokio::sync::watch` rather than a raw channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::board::Board;
use crate::error::QueueError;
use crate::job::{ErasedTask, Job, Task, TaskRegistry};
use crate::ops;
use crate::store::{ReconcileEvent, Store};
use crate::worker::{default_reporter, Reporter, TaskWorker};

/// Resolves once the reconcile stream's initial sync has completed, mirroring
/// the signaling value `Queue::Run` returns in spec §4.5 point 2.
pub struct Ready(oneshot::Receiver<()>);

impl Ready {
    /// Wait for the initial sync. Resolves immediately if it already has.
    pub async fn wait(self) {
        let _ = self.0.await;
    }
}

/// Owns registered tasks, their boards, and the background tasks that keep
/// the boards and periodic schedules running.
pub struct Queue {
    registry: TaskRegistry,
    store: Arc<dyn Store>,
    reporter: Reporter,
    boards: HashMap<&'static str, Arc<Board>>,
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: Option<watch::Sender<bool>>,
}

impl Queue {
    /// Create an empty queue over `store`, reporting worker-loop errors via
    /// [`default_reporter`].
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_reporter(store, default_reporter())
    }

    /// Create an empty queue with a custom error reporter.
    pub fn with_reporter(store: Arc<dyn Store>, reporter: Reporter) -> Self {
        Self {
            registry: TaskRegistry::new(),
            store,
            reporter,
            boards: HashMap::new(),
            handles: Vec::new(),
            shutdown_tx: None,
        }
    }

    /// Register a task. Must be called before [`Queue::run`].
    pub fn add<J: Job>(&mut self, task: Task<J>) -> Result<(), QueueError> {
        self.registry.add(task)
    }

    /// Enqueue a job directly against this queue's store (spec §6
    /// `Queue.Enqueue`).
    pub async fn enqueue<J: Job>(
        &self,
        job: &J,
        label: impl Into<String>,
        delay: Duration,
        isolation: Duration,
    ) -> Result<bool, QueueError> {
        ops::enqueue(self.store.as_ref(), job, label, delay, isolation).await
    }

    /// Create one board per registered task, open the reconcile stream, and
    /// start all task workers plus periodic schedulers. Returns a [`Ready`]
    /// that resolves once the stream's initial sync completes.
    pub async fn run(&mut self) -> Result<Ready, QueueError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);

        self.boards = self
            .registry
            .iter()
            .map(|task| (task.name(), Arc::new(Board::default())))
            .collect();

        let stream = self.store.reconcile().await?;
        let (ready_tx, ready_rx) = oneshot::channel();
        self.handles.push(tokio::spawn(consume_reconcile(
            stream,
            self.boards.clone(),
            ready_tx,
        )));

        for task in self.registry.iter() {
            let board = self.boards[task.name()].clone();
            let workers = task.config().workers.max(1);
            for _ in 0..workers {
                let worker = TaskWorker::new(
                    task.clone(),
                    board.clone(),
                    self.store.clone(),
                    self.reporter.clone(),
                    shutdown_rx.clone(),
                );
                self.handles.push(tokio::spawn(worker.run()));
            }

            if let Some(period) = task.config().periodicity {
                if let Some(blueprint) = task.periodic_blueprint() {
                    self.handles.push(tokio::spawn(run_periodic(
                        task.clone(),
                        blueprint.data,
                        blueprint.label,
                        period,
                        self.store.clone(),
                        self.reporter.clone(),
                        shutdown_rx.clone(),
                    )));
                }
            }
        }

        Ok(Ready(ready_rx))
    }

    /// Signal every worker and scheduler to exit, then wait for all of them
    /// to drain.
    pub async fn close(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}

/// Consume the reconcile stream, fanning record changes out to the board
/// for their task's name and resolving `ready_tx` on the first `Opened`.
async fn consume_reconcile(
    mut stream: futures::stream::BoxStream<'static, ReconcileEvent>,
    boards: HashMap<&'static str, Arc<Board>>,
    ready_tx: oneshot::Sender<()>,
) {
    let mut ready_tx = Some(ready_tx);
    while let Some(event) = stream.next().await {
        match event {
            ReconcileEvent::Opened => {
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(());
                }
            }
            ReconcileEvent::Created(record) | ReconcileEvent::Updated(record) => {
                if let Some(board) = boards.get(record.name.as_str()) {
                    board.apply(record);
                }
            }
            ReconcileEvent::Errored(_) | ReconcileEvent::Stopped => {}
        }
    }
}

/// Re-enqueue a task's periodic blueprint every `period`, labeled with
/// isolation = `period` so exactly one instance runs cluster-wide per
/// interval (spec §4.5 point 3).
async fn run_periodic(
    task: Arc<dyn ErasedTask>,
    data: serde_json::Value,
    label: String,
    period: Duration,
    store: Arc<dyn Store>,
    reporter: Reporter,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if let Err(err) =
            ops::enqueue_raw(store.as_ref(), task.name(), data.clone(), label.clone(), Duration::ZERO, period)
                .await
        {
            reporter(err.into());
        }
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = shutdown.changed() => {}
        }
    }
}
