//! Operations indexed by name, for a single model type (spec §4.7
//! "Registry").

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::error::QueueError;

use super::check::OperationContext;
use super::check::ProcessorOutcome;
use super::Model;

pub(crate) type Filter<M> = Arc<dyn Fn(&M) -> bool + Send + Sync>;
pub(crate) type Processor<M> =
    Arc<dyn Fn(OperationContext<M>) -> BoxFuture<'static, anyhow::Result<ProcessorOutcome<M>>> + Send + Sync>;

/// A named unit of model-bound work (spec §4.7 "Reactor operation"): a
/// target model type, an optional in-memory filter, a processor, a
/// sync-or-async flag, and a tag-expiry knob.
pub struct Operation<M: Model> {
    pub(crate) name: &'static str,
    pub(crate) sync: bool,
    pub(crate) filter: Option<Filter<M>>,
    pub(crate) processor: Processor<M>,
    pub(crate) tag_expiry: Duration,
}

impl<M: Model> Operation<M> {
    /// Define an operation. `sync = true` runs inline in
    /// [`Reactor::check`](super::Reactor::check) (the modifier callback);
    /// `sync = false` always dispatches via a queued `ProcessJob`.
    pub fn new<F, Fut>(name: &'static str, sync: bool, processor: F) -> Self
    where
        F: Fn(OperationContext<M>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<ProcessorOutcome<M>>> + Send + 'static,
    {
        Self {
            name,
            sync,
            filter: None,
            processor: Arc::new(move |ctx| Box::pin(processor(ctx))),
            tag_expiry: Duration::from_secs(5 * 60),
        }
    }

    /// Restrict this operation to models matching `filter`. Checked both
    /// inline (`Check`) and before running a queued `ProcessJob`.
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&M) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Override the default tag expiry (default 5 minutes): how long an
    /// orphaned async tag survives before the scan treats the model as
    /// needing a fresh look regardless.
    pub fn with_tag_expiry(mut self, expiry: Duration) -> Self {
        self.tag_expiry = expiry;
        self
    }
}

/// Operations indexed by name, scoped to a single model type.
#[derive(Clone)]
pub struct OperationRegistry<M: Model> {
    operations: HashMap<&'static str, Arc<Operation<M>>>,
}

impl<M: Model> Default for OperationRegistry<M> {
    fn default() -> Self {
        Self {
            operations: HashMap::new(),
        }
    }
}

impl<M: Model> OperationRegistry<M> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation. Returns [`QueueError::DuplicateOperationName`]
    /// instead of panicking - `Reactor::add` is a fallible, caller-facing
    /// entry point, mirroring how [`crate::job::TaskRegistry::add`] reports
    /// duplicate task names.
    pub fn add(&mut self, operation: Operation<M>) -> Result<(), QueueError> {
        if self.operations.contains_key(operation.name) {
            return Err(QueueError::DuplicateOperationName { name: operation.name });
        }
        self.operations.insert(operation.name, Arc::new(operation));
        Ok(())
    }

    /// Look up an operation by name.
    pub fn get(&self, name: &str) -> Option<Arc<Operation<M>>> {
        self.operations.get(name).cloned()
    }

    /// Iterate all registered operations.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Operation<M>>> {
        self.operations.values()
    }

    /// Number of registered operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Whether the registry has no operations.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
