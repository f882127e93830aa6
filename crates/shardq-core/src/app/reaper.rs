use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::ReaperConfig;
use crate::domain::TaskState;
use crate::error::Result;
use crate::lifecycle::{self, Decider};
use crate::partition::PartitionCatalog;
use crate::ports::{Clock, TaskStore};

/// Recovers tasks whose worker stopped heartbeating.
///
/// An expired lease is a recoverable failure: it consumes one retry and the
/// task goes back to `pending`, or to `failed` when that was the last retry.
#[derive(Clone)]
pub struct LeaseReaper {
    store: Arc<dyn TaskStore>,
    catalog: Arc<dyn PartitionCatalog>,
    clock: Arc<dyn Clock>,
    decider: Arc<dyn Decider>,
    config: ReaperConfig,
}

impl LeaseReaper {
    pub fn new(
        store: Arc<dyn TaskStore>,
        catalog: Arc<dyn PartitionCatalog>,
        clock: Arc<dyn Clock>,
        decider: Arc<dyn Decider>,
        config: ReaperConfig,
    ) -> Self {
        Self {
            store,
            catalog,
            clock,
            decider,
            config,
        }
    }

    /// One sweep over every partition, detached ones included so that a task
    /// running when its partition was archived still reaches a settled state.
    /// Returns the number of tasks recovered.
    pub async fn reap_once(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut partitions = self.catalog.partitions().await?;
        partitions.extend(self.catalog.detached_partitions().await?);
        let mut reaped = 0;
        for partition in partitions {
            let expired = self
                .store
                .expired_leases(&partition, now, self.config.batch_limit)
                .await?;
            for task in expired {
                let update = lifecycle::reap_expired(&task, self.decider.as_ref(), now)?;
                match self
                    .store
                    .update_state(&task.task_ref(), TaskState::Running, update)
                    .await
                {
                    Ok(row) => {
                        warn!(
                            task = %row.id,
                            partition = %row.partition,
                            attempt = task.attempt,
                            state = %row.state,
                            retries_left = row.retries_left,
                            "lease expired, task recovered"
                        );
                        reaped += 1;
                    }
                    // heartbeat or completion got there first
                    Err(e) if e.is_stale() => debug!(task = %task.id, "reap lost race"),
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(reaped)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("lease reaper started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.reap_once().await {
                error!(error = %e, "lease sweep failed");
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.interval()) => {}
            }
        }
        info!("lease reaper stopped");
    }
}
