//! In-memory task store.
//!
//! Each partition is its own shard behind its own mutex; the partition map is
//! only read-locked long enough to clone a shard handle. Operations on
//! different partitions therefore never wait on each other, and no code path
//! holds two shard locks at once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    DispatcherId, PartitionId, StateCounts, TaskId, TaskRecord, TaskRef, TaskState, TaskUpdate,
    TransitionRecord,
};
use crate::error::{QueueError, Result, poison_err};
use crate::lifecycle::to_chrono;
use crate::partition::PartitionCatalog;
use crate::ports::{BlockedTask, TaskStore};

#[derive(Debug, Clone, Copy)]
struct Reservation {
    dispatcher: DispatcherId,
    until: DateTime<Utc>,
}

#[derive(Default)]
struct ShardState {
    detached: bool,
    rows: HashMap<TaskId, TaskRecord>,
    natural_keys: HashMap<String, TaskId>,
    reservations: HashMap<TaskId, Reservation>,
    transitions: HashMap<TaskId, Vec<TransitionRecord>>,
}

impl ShardState {
    fn is_reserved(&self, id: &TaskId, now: DateTime<Utc>) -> bool {
        self.reservations.get(id).is_some_and(|r| r.until > now)
    }
}

#[derive(Default)]
struct Shard {
    state: Mutex<ShardState>,
}

/// In-memory implementation of [`TaskStore`] and [`PartitionCatalog`].
pub struct InMemoryTaskStore {
    shards: RwLock<HashMap<PartitionId, Arc<Shard>>>,
    reservation_ttl: chrono::Duration,
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::with_reservation_ttl(Duration::from_secs(5))
    }

    pub fn with_reservation_ttl(ttl: Duration) -> Self {
        Self {
            shards: RwLock::new(HashMap::new()),
            reservation_ttl: to_chrono(ttl),
        }
    }

    fn shard(&self, partition: &PartitionId) -> Result<Option<Arc<Shard>>> {
        let shards = self.shards.read().map_err(poison_err)?;
        Ok(shards.get(partition).cloned())
    }

    fn partitions_where(&self, detached: bool) -> Result<Vec<PartitionId>> {
        let handles: Vec<(PartitionId, Arc<Shard>)> = {
            let shards = self.shards.read().map_err(poison_err)?;
            shards.iter().map(|(id, s)| (id.clone(), Arc::clone(s))).collect()
        };
        let mut selected = Vec::with_capacity(handles.len());
        for (id, shard) in handles {
            if shard.state.lock().map_err(poison_err)?.detached == detached {
                selected.push(id);
            }
        }
        selected.sort();
        Ok(selected)
    }

    fn existing_shard(&self, task: &TaskRef) -> Result<Arc<Shard>> {
        self.shard(&task.partition)?
            .ok_or_else(|| QueueError::TaskNotFound {
                task: task.id,
                partition: task.partition.clone(),
            })
    }

    /// State of a dependency, locking only the dependency's shard.
    fn dependency_state(&self, dependency: &TaskRef) -> Result<Option<TaskState>> {
        let Some(shard) = self.shard(&dependency.partition)? else {
            return Ok(None);
        };
        let state = shard.state.lock().map_err(poison_err)?;
        Ok(state.rows.get(&dependency.id).map(|row| row.state))
    }
}

fn transition_record(before: &TaskRecord, after: &TaskRecord, update: &TaskUpdate) -> TransitionRecord {
    TransitionRecord {
        task_id: after.id,
        partition: after.partition.clone(),
        previous_status: before.state,
        next_status: after.state,
        reason: update.reason,
        attempt: after.attempt,
        retries_left: after.retries_left,
        detail: update.detail.clone(),
        recorded_at: update.updated_at,
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, task: TaskRecord) -> Result<TaskId> {
        let Some(shard) = self.shard(&task.partition)? else {
            return Err(QueueError::PartitionRoutingFailure {
                key: task.partition_key.clone(),
                reason: format!("partition {} does not exist", task.partition),
            });
        };
        let mut state = shard.state.lock().map_err(poison_err)?;
        if state.detached {
            return Err(QueueError::PartitionRoutingFailure {
                key: task.partition_key.clone(),
                reason: format!("partition {} is detached", task.partition),
            });
        }
        if state.rows.contains_key(&task.id) {
            return Err(QueueError::InvalidTask(format!(
                "task id {} already exists in {}",
                task.id, task.partition
            )));
        }
        if let Some(key) = &task.natural_key
            && let Some(existing) = state.natural_keys.get(key)
        {
            return Err(QueueError::DuplicateTask {
                partition: task.partition.clone(),
                natural_key: key.clone(),
                existing: *existing,
            });
        }

        let id = task.id;
        if let Some(key) = &task.natural_key {
            state.natural_keys.insert(key.clone(), id);
        }
        state.rows.insert(id, task);
        Ok(id)
    }

    async fn get(&self, task: &TaskRef) -> Result<Option<TaskRecord>> {
        let Some(shard) = self.shard(&task.partition)? else {
            return Ok(None);
        };
        let state = shard.state.lock().map_err(poison_err)?;
        Ok(state.rows.get(&task.id).cloned())
    }

    async fn find_by_natural_key(
        &self,
        partition: &PartitionId,
        natural_key: &str,
    ) -> Result<Option<TaskRecord>> {
        let Some(shard) = self.shard(partition)? else {
            return Ok(None);
        };
        let state = shard.state.lock().map_err(poison_err)?;
        Ok(state
            .natural_keys
            .get(natural_key)
            .and_then(|id| state.rows.get(id))
            .cloned())
    }

    async fn update_state(
        &self,
        task: &TaskRef,
        expected: TaskState,
        update: TaskUpdate,
    ) -> Result<TaskRecord> {
        let shard = self.existing_shard(task)?;
        let mut state = shard.state.lock().map_err(poison_err)?;
        let row = state
            .rows
            .get_mut(&task.id)
            .ok_or_else(|| QueueError::TaskNotFound {
                task: task.id,
                partition: task.partition.clone(),
            })?;

        let attempt_matches = update.expected_attempt.is_none_or(|a| a == row.attempt);
        if row.state != expected || !attempt_matches {
            return Err(QueueError::StaleState {
                task: task.id,
                expected,
                actual: row.state,
            });
        }
        if !expected.can_transition_to(update.state) {
            return Err(QueueError::InvalidTransition {
                from: expected,
                to: update.state,
                reason: "edge not in the state graph".to_string(),
            });
        }
        if update.retries_left == 0 && update.state != TaskState::Failed {
            return Err(QueueError::InvalidTransition {
                from: expected,
                to: update.state,
                reason: "zero retries left outside failed".to_string(),
            });
        }

        let before = row.clone();
        update.apply_to(row);
        let after = row.clone();

        state.reservations.remove(&task.id);
        if before.state != after.state {
            let record = transition_record(&before, &after, &update);
            state.transitions.entry(task.id).or_default().push(record);
        }
        Ok(after)
    }

    async fn poll(
        &self,
        partition: &PartitionId,
        dispatcher: DispatcherId,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>> {
        let Some(shard) = self.shard(partition)? else {
            return Ok(Vec::new());
        };
        if limit == 0 {
            return Ok(Vec::new());
        }

        // Candidates in readiness order.
        let mut candidates: Vec<(TaskId, Option<TaskRef>, (DateTime<Utc>, i32, TaskId))> = {
            let state = shard.state.lock().map_err(poison_err)?;
            if state.detached {
                return Ok(Vec::new());
            }
            state
                .rows
                .values()
                .filter(|row| row.is_due(now) && !state.is_reserved(&row.id, now))
                .map(|row| (row.id, row.depends_on.clone(), row.readiness_key()))
                .collect()
        };
        candidates.sort_by(|a, b| a.2.cmp(&b.2));

        // Dependency check outside the shard lock.
        let mut ready = Vec::new();
        for (id, depends_on, _) in candidates {
            if ready.len() == limit {
                break;
            }
            let claimable = match &depends_on {
                None => true,
                Some(dependency) => self.dependency_state(dependency)? == Some(TaskState::Succeeded),
            };
            if claimable {
                ready.push(id);
            }
        }

        // Re-check and reserve.
        let mut state = shard.state.lock().map_err(poison_err)?;
        let until = crate::lifecycle::add(now, self.reservation_ttl);
        let mut polled = Vec::with_capacity(ready.len());
        for id in ready {
            let still_free = state.rows.get(&id).is_some_and(|row| row.is_due(now))
                && !state.is_reserved(&id, now);
            if !still_free {
                continue;
            }
            state.reservations.insert(id, Reservation { dispatcher, until });
            if let Some(row) = state.rows.get(&id) {
                polled.push(row.clone());
            }
        }
        Ok(polled)
    }

    async fn release(&self, task: &TaskRef, dispatcher: DispatcherId) -> Result<()> {
        let shard = self.existing_shard(task)?;
        let mut state = shard.state.lock().map_err(poison_err)?;
        if state
            .reservations
            .get(&task.id)
            .is_some_and(|r| r.dispatcher == dispatcher)
        {
            state.reservations.remove(&task.id);
        }
        Ok(())
    }

    async fn expired_leases(
        &self,
        partition: &PartitionId,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>> {
        let Some(shard) = self.shard(partition)? else {
            return Ok(Vec::new());
        };
        let state = shard.state.lock().map_err(poison_err)?;
        let mut expired: Vec<TaskRecord> = state
            .rows
            .values()
            .filter(|row| row.is_lease_expired(now))
            .cloned()
            .collect();
        expired.sort_by_key(|row| (row.lease_expires_at, row.id));
        expired.truncate(limit);
        Ok(expired)
    }

    async fn blocked_by_dependency(
        &self,
        partition: &PartitionId,
        limit: usize,
    ) -> Result<Vec<BlockedTask>> {
        let Some(shard) = self.shard(partition)? else {
            return Ok(Vec::new());
        };
        let waiting: Vec<TaskRecord> = {
            let state = shard.state.lock().map_err(poison_err)?;
            state
                .rows
                .values()
                .filter(|row| row.state == TaskState::Pending && row.depends_on.is_some())
                .cloned()
                .collect()
        };

        let mut blocked = Vec::new();
        for task in waiting {
            if blocked.len() == limit {
                break;
            }
            let Some(dependency) = &task.depends_on else {
                continue;
            };
            let dependency_state = self.dependency_state(dependency)?;
            let dead = match dependency_state {
                None => true,
                Some(s) => s.is_terminal() && s != TaskState::Succeeded,
            };
            if dead {
                blocked.push(BlockedTask {
                    task,
                    dependency_state,
                });
            }
        }
        Ok(blocked)
    }

    async fn counts(&self, partition: &PartitionId) -> Result<StateCounts> {
        let Some(shard) = self.shard(partition)? else {
            return Ok(StateCounts::default());
        };
        let state = shard.state.lock().map_err(poison_err)?;
        let mut counts = StateCounts::default();
        for row in state.rows.values() {
            counts.record(row.state);
        }
        Ok(counts)
    }

    async fn transitions(&self, task: &TaskRef) -> Result<Vec<TransitionRecord>> {
        let Some(shard) = self.shard(&task.partition)? else {
            return Ok(Vec::new());
        };
        let state = shard.state.lock().map_err(poison_err)?;
        Ok(state.transitions.get(&task.id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl PartitionCatalog for InMemoryTaskStore {
    async fn create_partition(&self, partition: &PartitionId) -> Result<bool> {
        let mut shards = self.shards.write().map_err(poison_err)?;
        if shards.contains_key(partition) {
            return Ok(false);
        }
        shards.insert(partition.clone(), Arc::new(Shard::default()));
        Ok(true)
    }

    async fn partitions(&self) -> Result<Vec<PartitionId>> {
        self.partitions_where(false)
    }

    async fn detached_partitions(&self) -> Result<Vec<PartitionId>> {
        self.partitions_where(true)
    }

    async fn is_attached(&self, partition: &PartitionId) -> Result<bool> {
        match self.shard(partition)? {
            Some(shard) => Ok(!shard.state.lock().map_err(poison_err)?.detached),
            None => Ok(false),
        }
    }

    async fn is_empty(&self, partition: &PartitionId) -> Result<bool> {
        match self.shard(partition)? {
            Some(shard) => Ok(shard.state.lock().map_err(poison_err)?.rows.is_empty()),
            None => Ok(true),
        }
    }

    async fn detach_partition(&self, partition: &PartitionId) -> Result<bool> {
        let Some(shard) = self.shard(partition)? else {
            return Ok(false);
        };
        let mut state = shard.state.lock().map_err(poison_err)?;
        let was_attached = !state.detached;
        state.detached = true;
        Ok(was_attached)
    }
}
