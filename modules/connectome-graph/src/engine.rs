//! Owns the store handle, clock and maintenance pool for one process.

use std::sync::Arc;

use tracing::info;

use connectome_common::{Body, ConnectomeError, EngineConfig, LoadOptions};

use crate::classifier::DeltaClassifier;
use crate::clock::Clock;
use crate::delta::DeltaBatch;
use crate::loader::{load_connectome, LoadSummary};
use crate::maintainer::AggregateMaintainer;
use crate::memory::MemoryStore;
use crate::scheduler::{TriggerOutcome, TriggerScheduler};
use crate::schema::{label, prop};
use crate::store::{GraphStore, PropertyValue, StoreTxn};

pub struct Engine<S: GraphStore> {
    maintainer: Arc<AggregateMaintainer<S>>,
    scheduler: Arc<TriggerScheduler>,
}

impl<S: GraphStore> Engine<S> {
    /// Discover the partitions already in the store and start the pool.
    pub async fn start(
        store: S,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Result<Self, ConnectomeError> {
        let partitions = existing_partitions(&store).await?;
        info!(partitions = ?partitions, "Starting connectome engine");
        let maintainer = Arc::new(AggregateMaintainer::new(store, clock));
        let scheduler = TriggerScheduler::start(
            maintainer.clone(),
            DeltaClassifier::new(partitions),
            config,
        );
        Ok(Self {
            maintainer,
            scheduler,
        })
    }

    pub fn store(&self) -> &S {
        self.maintainer.store()
    }

    pub fn maintainer(&self) -> &Arc<AggregateMaintainer<S>> {
        &self.maintainer
    }

    pub fn scheduler(&self) -> &Arc<TriggerScheduler> {
        &self.scheduler
    }

    pub fn on_transaction_committed(&self, batch: &DeltaBatch) -> TriggerOutcome {
        self.scheduler.on_transaction_committed(batch)
    }

    /// Bulk-load `bodies` into `options.dataset`. The partition is
    /// registered first so the load's own commit schedules its Meta refresh.
    pub async fn load(
        &self,
        bodies: &[Body],
        options: &LoadOptions,
    ) -> Result<LoadSummary, ConnectomeError> {
        self.scheduler.register_partition(&options.dataset);
        load_connectome(self.store(), bodies, options, self.maintainer.clock().as_ref()).await
    }

    /// Drain the pool. Call before closing the store.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }
}

impl Engine<MemoryStore> {
    /// An engine over a fresh in-memory store, subscribed to its commits.
    pub async fn in_memory(clock: Arc<dyn Clock>, config: EngineConfig) -> Result<Self, ConnectomeError> {
        let store = MemoryStore::new();
        let engine = Self::start(store.clone(), clock, config).await?;
        store.subscribe(engine.scheduler.clone());
        Ok(engine)
    }
}

async fn existing_partitions<S: GraphStore>(store: &S) -> Result<Vec<String>, ConnectomeError> {
    let mut txn = store.begin().await?;
    let mut partitions = Vec::new();
    for meta in txn.nodes_with_label(label::META).await? {
        if let Some(PropertyValue::Str(ds)) = txn.node_property(meta, prop::DATASET).await? {
            partitions.push(ds);
        }
    }
    txn.rollback().await?;
    Ok(partitions)
}
