use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::dispatcher::{Dispatcher, PartitionScope};
use super::reaper::LeaseReaper;

/// Handle over a set of running dispatcher loops and a lease reaper.
/// - dropping the group drops `shutdown_tx`, which also stops every loop
/// - `shutdown_and_join()` waits for in-flight executions to finish
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawns one loop per dispatcher, all serving `scope`, plus the reaper
    /// if one is given.
    pub fn spawn(
        dispatchers: Vec<Dispatcher>,
        scope: PartitionScope,
        reaper: Option<LeaseReaper>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(dispatchers.len() + 1);
        for dispatcher in dispatchers {
            let rx = shutdown_rx.clone();
            let scope = scope.clone();
            joins.push(tokio::spawn(async move {
                dispatcher.run(scope, rx).await;
            }));
        }
        if let Some(reaper) = reaper {
            let rx = shutdown_rx.clone();
            joins.push(tokio::spawn(async move {
                reaper.run(rx).await;
            }));
        }

        Self { shutdown_tx, joins }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Stops polling. Tasks already claimed still run to their outcome.
    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            let _ = join.await;
        }
    }
}
