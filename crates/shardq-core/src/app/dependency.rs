//! Dependency-chain validation at enqueue time.
//!
//! Tasks have at most one predecessor, so the dependency structure is a set
//! of chains. A new task is rejected when its chain does not exist, revisits
//! the new task's id, or is deeper than [`MAX_CHAIN_DEPTH`].

use std::collections::HashSet;

use crate::domain::{TaskId, TaskRef};
use crate::error::{QueueError, Result};
use crate::ports::TaskStore;

pub const MAX_CHAIN_DEPTH: usize = 64;

/// Walks the chain starting at `depends_on` and returns the ids visited,
/// nearest first.
pub async fn check_chain(
    store: &dyn TaskStore,
    new_task: TaskId,
    depends_on: &TaskRef,
) -> Result<Vec<TaskId>> {
    let mut chain = vec![new_task];
    let mut seen: HashSet<TaskId> = HashSet::from([new_task]);
    let mut next = Some(depends_on.clone());

    while let Some(current) = next {
        if !seen.insert(current.id) {
            chain.push(current.id);
            return Err(QueueError::DependencyCycle { chain });
        }
        chain.push(current.id);
        if chain.len() > MAX_CHAIN_DEPTH + 1 {
            return Err(QueueError::InvalidTask(format!(
                "dependency chain of {new_task} is deeper than {MAX_CHAIN_DEPTH}"
            )));
        }

        let Some(record) = store.get(&current).await? else {
            if current == *depends_on {
                return Err(QueueError::DependencyNotFound {
                    task: current.id,
                    partition: current.partition,
                });
            }
            // an older link may have been archived; the chain ends here
            break;
        };
        next = record.depends_on;
    }

    chain.remove(0);
    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryTaskStore;
    use crate::lifecycle::fixtures::pending;
    use crate::partition::PartitionCatalog;

    async fn store_with_chain(len: u128) -> (InMemoryTaskStore, Vec<TaskRef>) {
        let store = InMemoryTaskStore::new();
        let mut refs: Vec<TaskRef> = Vec::new();
        for n in 1..=len {
            let mut task = pending(3);
            task.id = TaskId::from_u128(n);
            task.depends_on = refs.last().cloned();
            store.create_partition(&task.partition).await.unwrap();
            refs.push(task.task_ref());
            store.insert(task).await.unwrap();
        }
        (store, refs)
    }

    #[tokio::test]
    async fn existing_chain_is_accepted() {
        let (store, refs) = store_with_chain(3).await;
        let chain = check_chain(&store, TaskId::from_u128(99), &refs[2])
            .await
            .unwrap();
        assert_eq!(
            chain,
            vec![TaskId::from_u128(3), TaskId::from_u128(2), TaskId::from_u128(1)]
        );
    }

    #[tokio::test]
    async fn missing_dependency_is_rejected() {
        let (store, refs) = store_with_chain(1).await;
        let mut missing = refs[0].clone();
        missing.id = TaskId::from_u128(50);
        let err = check_chain(&store, TaskId::from_u128(99), &missing)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::DependencyNotFound { .. }));
    }

    #[tokio::test]
    async fn chain_revisiting_new_id_is_a_cycle() {
        let (store, refs) = store_with_chain(3).await;
        // new task reuses id 1, which sits at the root of the chain
        let err = check_chain(&store, TaskId::from_u128(1), &refs[2])
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::DependencyCycle { ref chain } if chain.len() == 4));
    }

    #[tokio::test]
    async fn self_dependency_is_a_cycle() {
        let (store, refs) = store_with_chain(1).await;
        let err = check_chain(&store, refs[0].id, &refs[0]).await.unwrap_err();
        assert!(matches!(err, QueueError::DependencyCycle { .. }));
    }

    #[tokio::test]
    async fn overly_deep_chain_is_rejected() {
        let (store, refs) = store_with_chain(MAX_CHAIN_DEPTH as u128 + 1).await;
        let err = check_chain(&store, TaskId::from_u128(10_000), refs.last().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidTask(_)));
    }
}
