//! Worker API: how task kinds are executed.
//!
//! The dispatcher only knows [`Worker`]. [`HandlerRegistry`] implements it by
//! routing each payload variant to the [`Handler`] registered for that kind,
//! so handlers receive their concrete payload type instead of raw JSON.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{
    CheckpointPayload, ExecResult, PartitionId, PartitionKey, ReindexPayload, TaskError, TaskId,
    TaskKind, TaskPayload, TaskRecord, VerifyPayload,
};

/// What a handler knows about the attempt it runs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub partition: PartitionId,
    pub partition_key: PartitionKey,
    /// 1 for the first attempt.
    pub attempt: u32,
    pub retries_left: u32,
}

impl From<&TaskRecord> for TaskContext {
    fn from(task: &TaskRecord) -> Self {
        Self {
            task_id: task.id,
            partition: task.partition.clone(),
            partition_key: task.partition_key.clone(),
            attempt: task.attempt,
            retries_left: task.retries_left,
        }
    }
}

/// Executes claimed tasks. `Ok(())` is success; see [`TaskError`] for how
/// failures map onto the lifecycle.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn execute(&self, payload: &TaskPayload, ctx: &TaskContext) -> ExecResult;

    /// Kinds this worker can run; checked when the engine is built.
    fn supports(&self, _kind: TaskKind) -> bool {
        true
    }
}

/// Handler for one payload type.
///
/// ```ignore
/// struct ReindexHandler;
///
/// #[async_trait]
/// impl Handler<ReindexPayload> for ReindexHandler {
///     async fn handle(&self, payload: &ReindexPayload, _ctx: &TaskContext) -> ExecResult {
///         rebuild(&payload.index).map_err(|e| TaskError::recoverable(e.to_string()))
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<P>: Send + Sync {
    async fn handle(&self, payload: &P, ctx: &TaskContext) -> ExecResult;
}

/// Adapts a synchronous closure into a [`Handler`].
pub struct FnHandler<P, F> {
    f: F,
    _payload: PhantomData<fn(&P)>,
}

pub fn handler_fn<P, F>(f: F) -> FnHandler<P, F>
where
    F: Fn(&P, &TaskContext) -> ExecResult + Send + Sync,
{
    FnHandler {
        f,
        _payload: PhantomData,
    }
}

#[async_trait]
impl<P, F> Handler<P> for FnHandler<P, F>
where
    P: Sync,
    F: Fn(&P, &TaskContext) -> ExecResult + Send + Sync,
{
    async fn handle(&self, payload: &P, ctx: &TaskContext) -> ExecResult {
        (self.f)(payload, ctx)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("handler for task kind '{0}' is already registered")]
    AlreadyRegistered(TaskKind),
}

/// Payload types that have a handler slot in [`HandlerRegistry`].
pub trait KindPayload: Send + Sync + Sized + 'static {
    const KIND: TaskKind;

    #[doc(hidden)]
    fn slot(registry: &mut HandlerRegistry) -> &mut Option<Arc<dyn Handler<Self>>>;
}

impl KindPayload for ReindexPayload {
    const KIND: TaskKind = TaskKind::Reindex;

    fn slot(registry: &mut HandlerRegistry) -> &mut Option<Arc<dyn Handler<Self>>> {
        &mut registry.reindex
    }
}

impl KindPayload for VerifyPayload {
    const KIND: TaskKind = TaskKind::Verify;

    fn slot(registry: &mut HandlerRegistry) -> &mut Option<Arc<dyn Handler<Self>>> {
        &mut registry.verify
    }
}

impl KindPayload for CheckpointPayload {
    const KIND: TaskKind = TaskKind::Checkpoint;

    fn slot(registry: &mut HandlerRegistry) -> &mut Option<Arc<dyn Handler<Self>>> {
        &mut registry.checkpoint
    }
}

/// One handler slot per task kind.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    reindex: Option<Arc<dyn Handler<ReindexPayload>>>,
    verify: Option<Arc<dyn Handler<VerifyPayload>>>,
    checkpoint: Option<Arc<dyn Handler<CheckpointPayload>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P, H>(&mut self, handler: H) -> Result<(), RegistryError>
    where
        P: KindPayload,
        H: Handler<P> + 'static,
    {
        let slot = P::slot(self);
        if slot.is_some() {
            return Err(RegistryError::AlreadyRegistered(P::KIND));
        }
        *slot = Some(Arc::new(handler));
        Ok(())
    }

    pub fn supported_kinds(&self) -> Vec<TaskKind> {
        TaskKind::ALL
            .into_iter()
            .filter(|kind| self.supports(*kind))
            .collect()
    }
}

fn missing(kind: TaskKind) -> TaskError {
    TaskError::fatal(format!("no handler registered for task kind '{kind}'"))
}

#[async_trait]
impl Worker for HandlerRegistry {
    async fn execute(&self, payload: &TaskPayload, ctx: &TaskContext) -> ExecResult {
        match payload {
            TaskPayload::Reindex(p) => match &self.reindex {
                Some(h) => h.handle(p, ctx).await,
                None => Err(missing(TaskKind::Reindex)),
            },
            TaskPayload::Verify(p) => match &self.verify {
                Some(h) => h.handle(p, ctx).await,
                None => Err(missing(TaskKind::Verify)),
            },
            TaskPayload::Checkpoint(p) => match &self.checkpoint {
                Some(h) => h.handle(p, ctx).await,
                None => Err(missing(TaskKind::Checkpoint)),
            },
        }
    }

    fn supports(&self, kind: TaskKind) -> bool {
        match kind {
            TaskKind::Reindex => self.reindex.is_some(),
            TaskKind::Verify => self.verify.is_some(),
            TaskKind::Checkpoint => self.checkpoint.is_some(),
        }
    }
}
