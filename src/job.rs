//! Job registration: typed task names, handlers, and policy knobs.
//!
//! Registers a concrete type under a stable name with a type-erased
//! deserializer closure; the closure also carries the handler, since a
//! [`Task`] *is* "a name plus how to run it" rather than "a name plus how to
//! decode it" - dispatch and decode are not separate steps here.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::backoff::{DEFAULT_FACTOR, DEFAULT_MAX_DELAY, DEFAULT_MIN_DELAY};
use crate::error::QueueError;

/// A typed unit of work. Implementors are registered with [`TaskRegistry`]
/// under a stable [`Job::NAME`] and round-trip through [`Store`](crate::store::Store)
/// as `serde_json::Value`.
pub trait Job: DeserializeOwned + Serialize + Send + Sync + 'static {
    /// Stable name used for persistence and routing. Must not change once
    /// jobs with this name exist in the queue.
    const NAME: &'static str;
}

/// A typed failure returned by a handler (spec §4.4 step 5, §7).
///
/// Handlers return `anyhow::Result<J>`; a handler that wants retry control
/// returns `Err(Failure::retryable(..).into())` or
/// `Err(Failure::terminal(..).into())`. Any other `Err` (an "unexpected
/// error") is treated by the worker as a retryable crash and reported via
/// the [`Reporter`](crate::worker::Reporter) hook.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct Failure {
    /// Human-readable reason, recorded on the job's event history.
    pub message: String,
    /// Whether this failure should be retried (subject to `max_attempts`).
    pub retry: bool,
}

impl Failure {
    /// A failure the worker should retry with backoff, up to `max_attempts`.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retry: true,
        }
    }

    /// A failure that should cancel the job immediately, no retry.
    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retry: false,
        }
    }
}

/// Per-task policy knobs (spec §3 "Registered task").
#[derive(Debug, Clone)]
pub struct TaskConfig {
    /// Number of concurrent worker loops for this task. Default 1.
    pub workers: usize,
    /// Maximum dequeue attempts before a retryable failure becomes Cancelled.
    pub max_attempts: i64,
    /// Per-attempt visibility timeout passed to `Dequeue`.
    pub timeout: Duration,
    /// Upper bound after which the worker gives up waiting on the handler
    /// and reports a lifetime error. Must be `>= timeout`.
    pub lifetime: Duration,
    /// Minimum backoff delay.
    pub min_delay: Duration,
    /// Maximum backoff delay.
    pub max_delay: Duration,
    /// Backoff growth factor.
    pub delay_factor: f64,
    /// If `Some`, the queue re-enqueues this task's periodic blueprint every
    /// interval, cluster-wide exactly once per interval.
    pub periodicity: Option<Duration>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        let timeout = Duration::from_secs(30);
        Self {
            workers: 1,
            max_attempts: 25,
            timeout,
            lifetime: timeout,
            min_delay: DEFAULT_MIN_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            delay_factor: DEFAULT_FACTOR,
            periodicity: None,
        }
    }
}

/// The blueprint re-enqueued by a periodic task (spec §4.5 point 3).
#[derive(Debug, Clone)]
pub struct PeriodicBlueprint {
    /// Encoded job payload to enqueue each interval.
    pub data: Value,
    /// Label the periodic job is enqueued under (isolation key).
    pub label: String,
}

/// Outcome of a handler invocation, as seen by the worker (spec §4.4 step 5).
pub enum HandlerOutcome {
    /// The handler returned `Ok(job)`. Carries the re-encoded job, since the
    /// handler may have mutated it; the worker persists this via `Complete`.
    Success(Value),
    /// The handler returned a typed [`Failure`].
    Failed(Failure),
    /// The handler returned an untyped error. Treated as a retryable crash;
    /// reported via the reporter hook.
    Crashed(anyhow::Error),
    /// The handler panicked. Recovered and converted to a descriptive crash.
    Panicked(String),
}

/// Type-erased interface the [`crate::worker::TaskWorker`] drives. One
/// instance per registered task; never implemented directly - use
/// [`Task::new`] and register it with [`TaskRegistry`].
pub trait ErasedTask: Send + Sync {
    /// The task's registered name.
    fn name(&self) -> &'static str;
    /// The task's policy knobs.
    fn config(&self) -> &TaskConfig;
    /// Run the handler against an encoded payload, catching panics.
    fn run(&self, data: Value) -> BoxFuture<'static, HandlerOutcome>;
    /// Invoke the notifier, if one is registered, after a terminal transition.
    fn notify(&self, cancelled: bool, reason: &str);
    /// The periodic blueprint, if this task has `periodicity` configured.
    fn periodic_blueprint(&self) -> Option<PeriodicBlueprint>;
}

type HandlerFn<J> = Arc<dyn Fn(J) -> BoxFuture<'static, anyhow::Result<J>> + Send + Sync>;
type NotifierFn = Arc<dyn Fn(bool, &str) + Send + Sync>;

/// A registered task: `J::NAME`, a handler, an optional notifier, and policy.
pub struct Task<J: Job> {
    handler: HandlerFn<J>,
    notifier: Option<NotifierFn>,
    config: TaskConfig,
    periodic_job: Option<J>,
    periodic_label: String,
}

impl<J: Job> Task<J> {
    /// Register a task with a handler and default policy. The handler takes
    /// the decoded job by value and returns it back (possibly mutated) on
    /// success - the worker re-persists whatever it returns.
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(J) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<J>> + Send + 'static,
    {
        Self {
            handler: Arc::new(move |job| Box::pin(handler(job))),
            notifier: None,
            config: TaskConfig::default(),
            periodic_job: None,
            periodic_label: String::new(),
        }
    }

    /// Override the default policy.
    pub fn with_config(mut self, config: TaskConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a notifier invoked with `(cancelled, reason)` after every
    /// terminal transition.
    pub fn with_notifier<N>(mut self, notifier: N) -> Self
    where
        N: Fn(bool, &str) + Send + Sync + 'static,
    {
        self.notifier = Some(Arc::new(notifier));
        self
    }

    /// Configure this task as periodic: `blueprint` is re-enqueued under
    /// `label` every `config.periodicity` interval. Panics if `config`
    /// wasn't given a `periodicity`.
    pub fn with_periodic(mut self, blueprint: J, label: impl Into<String>) -> Self {
        assert!(
            self.config.periodicity.is_some(),
            "with_periodic requires TaskConfig::periodicity to be set"
        );
        self.periodic_job = Some(blueprint);
        self.periodic_label = label.into();
        self
    }
}

impl<J: Job> ErasedTask for Task<J> {
    fn name(&self) -> &'static str {
        J::NAME
    }

    fn config(&self) -> &TaskConfig {
        &self.config
    }

    fn run(&self, data: Value) -> BoxFuture<'static, HandlerOutcome> {
        let handler = self.handler.clone();
        Box::pin(async move {
            let job: J = match serde_json::from_value(data) {
                Ok(job) => job,
                Err(e) => return HandlerOutcome::Crashed(e.into()),
            };

            let fut = (handler)(job);
            let result = std::panic::AssertUnwindSafe(fut)
                .catch_unwind()
                .await;

            match result {
                Ok(Ok(job)) => match serde_json::to_value(&job) {
                    Ok(data) => HandlerOutcome::Success(data),
                    Err(e) => HandlerOutcome::Crashed(e.into()),
                },
                Ok(Err(err)) => match err.downcast::<Failure>() {
                    Ok(failure) => HandlerOutcome::Failed(failure),
                    Err(err) => HandlerOutcome::Crashed(err),
                },
                Err(panic) => HandlerOutcome::Panicked(describe_panic(panic)),
            }
        })
    }

    fn notify(&self, cancelled: bool, reason: &str) {
        if let Some(notifier) = &self.notifier {
            notifier(cancelled, reason);
        }
    }

    fn periodic_blueprint(&self) -> Option<PeriodicBlueprint> {
        let job = self.periodic_job.as_ref()?;
        Some(PeriodicBlueprint {
            data: serde_json::to_value(job).expect("periodic blueprint must serialize"),
            label: self.periodic_label.clone(),
        })
    }
}

fn describe_panic(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked with a non-string payload".to_string()
    }
}

/// Registry of tasks, keyed by name.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<&'static str, Arc<dyn ErasedTask>>,
}

impl TaskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task. Returns [`QueueError::DuplicateTaskName`] instead of
    /// panicking - the queue calls this from `Queue::add`, a fallible,
    /// caller-facing entry point.
    pub fn add<J: Job>(&mut self, task: Task<J>) -> Result<(), QueueError> {
        if self.tasks.contains_key(J::NAME) {
            return Err(QueueError::DuplicateTaskName { name: J::NAME });
        }
        self.tasks.insert(J::NAME, Arc::new(task));
        Ok(())
    }

    /// Look up a task by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ErasedTask>> {
        self.tasks.get(name).cloned()
    }

    /// Iterate all registered tasks.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ErasedTask>> {
        self.tasks.values()
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the registry has no tasks.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("names", &self.tasks.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Greet {
        name: String,
    }
    impl Job for Greet {
        const NAME: &'static str = "greet";
    }

    #[tokio::test]
    async fn run_decodes_and_invokes_handler() {
        let task = Task::<Greet>::new(|job| async move {
            assert_eq!(job.name, "ada");
            Ok(job)
        });
        let outcome = task.run(serde_json::json!({"name": "ada"})).await;
        match outcome {
            HandlerOutcome::Success(data) => assert_eq!(data["name"], "ada"),
            _ => panic!("expected Success"),
        }
    }

    #[tokio::test]
    async fn run_converts_typed_failure() {
        let task: Task<Greet> =
            Task::new(|_job| async move { Err(Failure::retryable("nope").into()) });
        let outcome = task.run(serde_json::json!({"name": "x"})).await;
        match outcome {
            HandlerOutcome::Failed(f) => assert!(f.retry),
            _ => panic!("expected Failed"),
        }
    }

    #[tokio::test]
    async fn run_treats_untyped_error_as_crash() {
        let task: Task<Greet> = Task::new(|_job| async move { Err(anyhow::anyhow!("boom")) });
        let outcome = task.run(serde_json::json!({"name": "x"})).await;
        assert!(matches!(outcome, HandlerOutcome::Crashed(_)));
    }

    #[tokio::test]
    async fn run_recovers_from_panic() {
        let task: Task<Greet> = Task::new(|_job| async move {
            panic!("handler exploded");
        });
        let outcome = task.run(serde_json::json!({"name": "x"})).await;
        match outcome {
            HandlerOutcome::Panicked(msg) => assert!(msg.contains("exploded")),
            _ => panic!("expected Panicked"),
        }
    }

    #[test]
    fn registry_rejects_duplicate_names() {
        let mut registry = TaskRegistry::new();
        registry
            .add(Task::<Greet>::new(|job| async { Ok(job) }))
            .unwrap();
        let err = registry
            .add(Task::<Greet>::new(|job| async { Ok(job) }))
            .unwrap_err();
        assert!(matches!(err, QueueError::DuplicateTaskName { name: "greet" }));
    }

    #[test]
    fn periodic_blueprint_requires_config() {
        let result = std::panic::catch_unwind(|| {
            Task::<Greet>::new(|job| async { Ok(job) })
                .with_periodic(Greet { name: "x".into() }, "lbl")
        });
        assert!(result.is_err());
    }

    #[test]
    fn periodic_blueprint_present_when_configured() {
        let task = Task::<Greet>::new(|job| async { Ok(job) })
            .with_config(TaskConfig {
                periodicity: Some(Duration::from_secs(60)),
                ..Default::default()
            })
            .with_periodic(Greet { name: "x".into() }, "lbl");
        let bp = task.periodic_blueprint().unwrap();
        assert_eq!(bp.label, "lbl");
    }
}
