//! Engine wiring.
//!
//! `EngineBuilder` collects handlers and adapters and validates them once, at
//! startup: a missing handler or a bad config is a build error, not a task
//! failure discovered hours later.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::dispatcher::{Dispatcher, PartitionScope};
use super::producer::Producer;
use super::reaper::LeaseReaper;
use super::status::StatusQuery;
use super::worker_group::WorkerGroup;
use crate::config::EngineConfig;
use crate::domain::{PartitionId, TaskKind};
use crate::error::{QueueError, Result};
use crate::impls::InMemoryTaskStore;
use crate::lifecycle::{Decider, DefaultDecider, RetryPolicy};
use crate::partition::{PartitionCatalog, PartitionRouter};
use crate::ports::{Clock, IdGenerator, SystemClock, TaskStore, UlidGenerator};
use crate::worker::{Handler, HandlerRegistry, KindPayload, RegistryError, Worker};

/// ```ignore
/// let engine = EngineBuilder::new(config)
///     .register::<VerifyPayload, _>(verify_handler)?
///     .expect_kinds(&[TaskKind::Verify])
///     .build()?;
/// engine.initialize().await?;
/// let group = engine.spawn_workers(2, PartitionScope::All);
/// ```
pub struct EngineBuilder {
    config: EngineConfig,
    registry: HandlerRegistry,
    worker: Option<Arc<dyn Worker>>,
    expected_kinds: Option<Vec<TaskKind>>,
    clock: Option<Arc<dyn Clock>>,
    storage: Option<(Arc<dyn TaskStore>, Arc<dyn PartitionCatalog>)>,
    decider: Option<Arc<dyn Decider>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no handler registered for expected task kinds: {0:?}")]
    MissingHandlers(Vec<TaskKind>),

    #[error(transparent)]
    Config(#[from] QueueError),
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            registry: HandlerRegistry::new(),
            worker: None,
            expected_kinds: None,
            clock: None,
            storage: None,
            decider: None,
        }
    }

    pub fn register<P, H>(mut self, handler: H) -> std::result::Result<Self, RegistryError>
    where
        P: KindPayload,
        H: Handler<P> + 'static,
    {
        self.registry.register::<P, H>(handler)?;
        Ok(self)
    }

    /// Kinds that must have a handler for `build()` to succeed.
    pub fn expect_kinds(mut self, kinds: &[TaskKind]) -> Self {
        self.expected_kinds = Some(kinds.to_vec());
        self
    }

    /// Uses `worker` instead of the handler registry.
    pub fn with_worker(mut self, worker: Arc<dyn Worker>) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_store(
        mut self,
        store: Arc<dyn TaskStore>,
        catalog: Arc<dyn PartitionCatalog>,
    ) -> Self {
        self.storage = Some((store, catalog));
        self
    }

    /// Shares one in-memory store between engines, e.g. to run several
    /// dispatcher processes in a test.
    pub fn with_memory_store(self, store: Arc<InMemoryTaskStore>) -> Self {
        let catalog: Arc<dyn PartitionCatalog> = store.clone();
        self.with_store(store, catalog)
    }

    pub fn with_decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub fn build(self) -> std::result::Result<Engine, BuildError> {
        self.config.validate()?;

        let worker: Arc<dyn Worker> = match self.worker {
            Some(worker) => worker,
            None => Arc::new(self.registry),
        };
        if let Some(expected) = &self.expected_kinds {
            let missing: Vec<TaskKind> = expected
                .iter()
                .copied()
                .filter(|kind| !worker.supports(*kind))
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingHandlers(missing));
            }
        }

        let (store, catalog) = match self.storage {
            Some(storage) => storage,
            None => {
                let store = Arc::new(InMemoryTaskStore::with_reservation_ttl(
                    self.config.dispatcher.reservation_ttl(),
                ));
                let catalog: Arc<dyn PartitionCatalog> = store.clone();
                let store: Arc<dyn TaskStore> = store;
                (store, catalog)
            }
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let decider = self.decider.unwrap_or_else(|| {
            Arc::new(DefaultDecider::new(RetryPolicy::from_config(&self.config.retry)))
        });
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        let router = Arc::new(PartitionRouter::new(
            &self.config.partition,
            Arc::clone(&catalog),
        ));

        Ok(Engine {
            config: self.config,
            store,
            catalog,
            router,
            clock,
            ids,
            decider,
            worker,
        })
    }
}

/// A wired engine. Cheap to clone; every component it hands out shares the
/// same store, clock and router.
#[derive(Clone)]
pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn TaskStore>,
    catalog: Arc<dyn PartitionCatalog>,
    router: Arc<PartitionRouter>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    decider: Arc<dyn Decider>,
    worker: Arc<dyn Worker>,
}

impl Engine {
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn catalog(&self) -> &Arc<dyn PartitionCatalog> {
        &self.catalog
    }

    pub fn router(&self) -> &Arc<PartitionRouter> {
        &self.router
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Creates the partitions the configured scheme needs right now.
    pub async fn initialize(&self) -> Result<Vec<PartitionId>> {
        self.maintain(self.clock.now()).await
    }

    pub async fn maintain(&self, now: DateTime<Utc>) -> Result<Vec<PartitionId>> {
        self.router.maintain(now).await
    }

    pub fn producer(&self) -> Producer {
        Producer::new(
            Arc::clone(&self.store),
            Arc::clone(&self.router),
            Arc::clone(&self.clock),
            Arc::clone(&self.ids),
            self.config.retry.default_retries,
        )
    }

    /// A dispatcher with a fresh id.
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            self.ids.generate_dispatcher_id(),
            Arc::clone(&self.store),
            Arc::clone(&self.catalog),
            Arc::clone(&self.clock),
            Arc::clone(&self.decider),
            Arc::clone(&self.worker),
            self.config.dispatcher.clone(),
        )
    }

    pub fn reaper(&self) -> LeaseReaper {
        LeaseReaper::new(
            Arc::clone(&self.store),
            Arc::clone(&self.catalog),
            Arc::clone(&self.clock),
            Arc::clone(&self.decider),
            self.config.reaper.clone(),
        )
    }

    pub fn status(&self) -> StatusQuery {
        StatusQuery::new(Arc::clone(&self.store), Arc::clone(&self.catalog))
    }

    /// Spawns `dispatchers` dispatcher loops and one lease reaper.
    pub fn spawn_workers(&self, dispatchers: usize, scope: PartitionScope) -> WorkerGroup {
        let dispatchers = (0..dispatchers).map(|_| self.dispatcher()).collect();
        WorkerGroup::spawn(dispatchers, scope, Some(self.reaper()))
    }
}
