use std::sync::Arc;

use tracing::debug;

use super::dependency::check_chain;
use crate::domain::{NewTask, TaskId, TaskRecord, TaskRef, TaskState, TransitionReason};
use crate::error::{QueueError, Result};
use crate::lifecycle;
use crate::partition::PartitionRouter;
use crate::ports::{Clock, IdGenerator, TaskStore};

/// Producer API: decides nothing about execution, only what work exists.
#[derive(Clone)]
pub struct Producer {
    store: Arc<dyn TaskStore>,
    router: Arc<PartitionRouter>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    default_retries: u32,
}

impl Producer {
    pub fn new(
        store: Arc<dyn TaskStore>,
        router: Arc<PartitionRouter>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        default_retries: u32,
    ) -> Self {
        Self {
            store,
            router,
            clock,
            ids,
            default_retries,
        }
    }

    /// Inserts a `pending` task and returns its id.
    ///
    /// With a natural key the call is idempotent: if the key is already taken
    /// in the target partition, the existing task's id is returned. Routing
    /// fails closed; dependencies must exist and must not form a cycle.
    pub async fn enqueue(&self, task: NewTask) -> Result<TaskId> {
        let record = self.prepare(task).await?;
        let natural_key = record.natural_key.clone();
        let kind = record.kind;
        let partition = record.partition.clone();

        match self.store.insert(record).await {
            Ok(id) => {
                debug!(task = %id, %kind, partition = %partition, "task enqueued");
                Ok(id)
            }
            Err(QueueError::DuplicateTask { existing, .. }) => {
                debug!(
                    task = %existing,
                    natural_key = natural_key.as_deref().unwrap_or_default(),
                    "task already enqueued"
                );
                Ok(existing)
            }
            Err(e) => Err(e),
        }
    }

    /// Like [`Producer::enqueue`], returning the row's address.
    pub async fn enqueue_ref(&self, task: NewTask) -> Result<TaskRef> {
        let partition = self.router.resolve(&task.partition_key).await?;
        let id = self.enqueue(task).await?;
        Ok(TaskRef::new(id, partition))
    }

    /// `pending -> cancelled`. A running task cannot be cancelled.
    pub async fn cancel(&self, task: &TaskRef) -> Result<TaskRecord> {
        let current = self.store.get(task).await?.ok_or_else(|| QueueError::TaskNotFound {
            task: task.id,
            partition: task.partition.clone(),
        })?;
        let update = lifecycle::cancel(&current, TransitionReason::Cancelled, None, self.clock.now())?;
        let cancelled = self.store.update_state(task, TaskState::Pending, update).await?;
        debug!(task = %task, "task cancelled");
        Ok(cancelled)
    }

    async fn prepare(&self, task: NewTask) -> Result<TaskRecord> {
        let retries_left = task.retries.unwrap_or(self.default_retries);
        if retries_left == 0 {
            return Err(QueueError::InvalidTask(
                "a task needs at least one retry to be runnable".to_string(),
            ));
        }
        if task.natural_key.as_deref().is_some_and(str::is_empty) {
            return Err(QueueError::InvalidTask("natural key must not be empty".to_string()));
        }

        let partition = self.router.resolve(&task.partition_key).await?;
        let id = task.id.unwrap_or_else(|| self.ids.generate_task_id());
        if let Some(dependency) = &task.depends_on {
            check_chain(self.store.as_ref(), id, dependency).await?;
        }

        let now = self.clock.now();
        Ok(TaskRecord {
            id,
            partition_key: task.partition_key,
            partition,
            kind: task.payload.kind(),
            payload: task.payload,
            natural_key: task.natural_key,
            priority: task.priority,
            perform_at: task.perform_at.unwrap_or(now),
            state: TaskState::Pending,
            retries_left,
            attempt: 0,
            depends_on: task.depends_on,
            created_at: now,
            started_at: None,
            completed_at: None,
            lease_expires_at: None,
            last_error: None,
            failure_class: None,
            updated_at: now,
        })
    }
}
