use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, warn};

use crate::config::DispatcherConfig;
use crate::domain::{
    DispatcherId, ExecResult, PartitionId, TaskRecord, TaskState, TransitionReason,
};
use crate::error::Result;
use crate::lifecycle::{self, Decider, to_chrono};
use crate::observability::dispatch_span;
use crate::partition::PartitionCatalog;
use crate::ports::{Clock, TaskStore};
use crate::worker::{TaskContext, Worker};

/// Which partitions a dispatcher serves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PartitionScope {
    /// Every attached partition, re-listed on each poll.
    #[default]
    All,
    Only(Vec<PartitionId>),
}

/// Polls, claims and executes tasks.
///
/// Many dispatchers may run against the same store; exclusivity comes from
/// the store's compare-and-swap, never from process-local locks. Execution
/// runs on a bounded pool so slow tasks do not stall polling.
#[derive(Clone)]
pub struct Dispatcher {
    id: DispatcherId,
    store: Arc<dyn TaskStore>,
    catalog: Arc<dyn PartitionCatalog>,
    clock: Arc<dyn Clock>,
    decider: Arc<dyn Decider>,
    worker: Arc<dyn Worker>,
    config: DispatcherConfig,
    permits: Arc<Semaphore>,
    next_partition: Arc<AtomicUsize>,
}

impl Dispatcher {
    pub fn new(
        id: DispatcherId,
        store: Arc<dyn TaskStore>,
        catalog: Arc<dyn PartitionCatalog>,
        clock: Arc<dyn Clock>,
        decider: Arc<dyn Decider>,
        worker: Arc<dyn Worker>,
        config: DispatcherConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.workers));
        Self {
            id,
            store,
            catalog,
            clock,
            decider,
            worker,
            config,
            permits,
            next_partition: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn id(&self) -> DispatcherId {
        self.id
    }

    async fn partitions(&self, scope: &PartitionScope) -> Result<Vec<PartitionId>> {
        match scope {
            PartitionScope::All => self.catalog.partitions().await,
            PartitionScope::Only(partitions) => Ok(partitions.clone()),
        }
    }

    /// Due, claimable tasks: up to `limit` in total, each partition in
    /// `(perform_at, priority)` order. The starting partition rotates between
    /// calls so a busy partition cannot starve the rest. The rows are
    /// reserved for this dispatcher until claimed or released.
    pub async fn poll(&self, scope: &PartitionScope, limit: usize) -> Result<Vec<TaskRecord>> {
        let now = self.clock.now();
        let mut partitions = self.partitions(scope).await?;
        let mut polled = Vec::new();
        if partitions.is_empty() || limit == 0 {
            return Ok(polled);
        }
        let start = self.next_partition.fetch_add(1, Ordering::Relaxed) % partitions.len();
        partitions.rotate_left(start);
        for partition in partitions {
            let remaining = limit - polled.len();
            if remaining == 0 {
                break;
            }
            polled.extend(self.store.poll(&partition, self.id, now, remaining).await?);
        }
        Ok(polled)
    }

    /// `pending -> running`. `false` means another dispatcher won the race,
    /// which is not an error.
    pub async fn claim(&self, task: &TaskRecord) -> Result<bool> {
        Ok(self.try_claim(task).await?.is_some())
    }

    async fn try_claim(&self, task: &TaskRecord) -> Result<Option<TaskRecord>> {
        let now = self.clock.now();
        let update = match lifecycle::claim(task, now, to_chrono(self.config.lease())) {
            Ok(update) => update,
            Err(e) => {
                debug!(task = %task.id, error = %e, "claim skipped");
                self.store.release(&task.task_ref(), self.id).await?;
                return Ok(None);
            }
        };
        match self
            .store
            .update_state(&task.task_ref(), TaskState::Pending, update)
            .await
        {
            Ok(claimed) => {
                debug!(task = %task.id, attempt = claimed.attempt, "claim won");
                Ok(Some(claimed))
            }
            Err(e) if e.is_stale() => {
                debug!(task = %task.id, "claim lost");
                self.store.release(&task.task_ref(), self.id).await?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Runs a claimed task to its outcome, heartbeating while it runs.
    ///
    /// Returns the row after the outcome is written. If the lease was lost
    /// meanwhile the outcome is discarded and `StaleState` is returned.
    pub async fn execute(&self, claimed: TaskRecord) -> Result<TaskRecord> {
        let span = dispatch_span(self.id, &claimed.partition);
        async move {
            let ctx = TaskContext::from(&claimed);
            let work = self.worker.execute(&claimed.payload, &ctx);
            tokio::pin!(work);

            let mut current = claimed.clone();
            let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
            ticker.tick().await;

            let result: ExecResult = loop {
                tokio::select! {
                    result = &mut work => break result,
                    _ = ticker.tick() => {
                        match self.heartbeat(&current).await {
                            Ok(row) => current = row,
                            Err(e) => warn!(task = %current.id, error = %e, "heartbeat failed"),
                        }
                    }
                }
            };
            self.finish(&current, result).await
        }
        .instrument(span)
        .await
    }

    async fn heartbeat(&self, task: &TaskRecord) -> Result<TaskRecord> {
        let update = lifecycle::heartbeat(
            task,
            task.attempt,
            self.clock.now(),
            to_chrono(self.config.lease()),
        )?;
        self.store
            .update_state(&task.task_ref(), TaskState::Running, update)
            .await
    }

    async fn finish(&self, task: &TaskRecord, result: ExecResult) -> Result<TaskRecord> {
        let now = self.clock.now();
        let update = match &result {
            Ok(()) => lifecycle::complete(task, task.attempt, now)?,
            Err(error) => lifecycle::fail(task, task.attempt, error, self.decider.as_ref(), now)?,
        };
        let reason = update.reason;
        let written = match self
            .store
            .update_state(&task.task_ref(), TaskState::Running, update)
            .await
        {
            Ok(row) => row,
            Err(e) => {
                if e.is_stale() {
                    warn!(task = %task.id, attempt = task.attempt, "lease lost, outcome discarded");
                }
                return Err(e);
            }
        };

        match reason {
            TransitionReason::Completed => info!(task = %written.id, "task succeeded"),
            TransitionReason::RetryScheduled => info!(
                task = %written.id,
                retries_left = written.retries_left,
                perform_at = %written.perform_at,
                error = written.last_error.as_deref().unwrap_or_default(),
                "task failed, retry scheduled"
            ),
            _ => warn!(
                task = %written.id,
                reason = ?reason,
                error = written.last_error.as_deref().unwrap_or_default(),
                "task failed"
            ),
        }
        Ok(written)
    }

    /// Cancels pending tasks whose dependency ended without succeeding.
    pub async fn cancel_orphans(&self, scope: &PartitionScope) -> Result<usize> {
        let mut cancelled = 0;
        for partition in self.partitions(scope).await? {
            for blocked in self
                .store
                .blocked_by_dependency(&partition, self.config.poll_limit)
                .await?
            {
                let Some(dependency) = blocked.task.depends_on.as_ref() else {
                    continue;
                };
                let detail = match blocked.dependency_state {
                    Some(state) => format!("dependency {dependency} ended {state}"),
                    None => format!("dependency {dependency} no longer exists"),
                };
                let update = lifecycle::cancel(
                    &blocked.task,
                    TransitionReason::DependencyFailed,
                    Some(&detail),
                    self.clock.now(),
                )?;
                match self
                    .store
                    .update_state(&blocked.task.task_ref(), TaskState::Pending, update)
                    .await
                {
                    Ok(_) => {
                        info!(task = %blocked.task.id, %detail, "task cancelled");
                        cancelled += 1;
                    }
                    Err(e) if e.is_stale() => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(cancelled)
    }

    /// One poll/claim round; claimed tasks are spawned into `in_flight`.
    async fn dispatch_into(
        &self,
        scope: &PartitionScope,
        in_flight: &mut JoinSet<()>,
    ) -> Result<usize> {
        self.cancel_orphans(scope).await?;

        let free = self.permits.available_permits();
        if free == 0 {
            return Ok(0);
        }
        let polled = self.poll(scope, free.min(self.config.poll_limit)).await?;

        let mut claimed = 0;
        for task in polled {
            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                self.store.release(&task.task_ref(), self.id).await?;
                continue;
            };
            let Some(row) = self.try_claim(&task).await? else {
                continue;
            };
            claimed += 1;
            let this = self.clone();
            in_flight.spawn(async move {
                let _permit = permit;
                // failures are already logged and recorded on the row
                let _ = this.execute(row).await;
            });
        }
        Ok(claimed)
    }

    /// Polls once, executes what was claimed and waits for it to finish.
    /// Returns the number of tasks claimed.
    pub async fn run_once(&self, scope: &PartitionScope) -> Result<usize> {
        let mut in_flight = JoinSet::new();
        let claimed = self.dispatch_into(scope, &mut in_flight).await;
        while in_flight.join_next().await.is_some() {}
        claimed
    }

    /// Poll loop until `shutdown` flips to `true`.
    ///
    /// Poll-level errors are logged and retried with exponential backoff;
    /// tasks already claimed keep running and are awaited on shutdown.
    pub async fn run(&self, scope: PartitionScope, mut shutdown: watch::Receiver<bool>) {
        let mut in_flight = JoinSet::new();
        let mut consecutive_errors = 0u32;
        info!(dispatcher = %self.id, "dispatcher started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            while in_flight.try_join_next().is_some() {}

            let delay = match self.dispatch_into(&scope, &mut in_flight).await {
                Ok(_) => {
                    consecutive_errors = 0;
                    self.config.poll_interval()
                }
                Err(e) => {
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    let backoff = self.config.poll_error_backoff(consecutive_errors);
                    error!(dispatcher = %self.id, error = %e, ?backoff, "poll failed");
                    backoff
                }
            };

            tokio::select! {
                changed = shutdown.changed() => {
                    // sender dropped
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        while in_flight.join_next().await.is_some() {}
        info!(dispatcher = %self.id, "dispatcher stopped");
    }
}
