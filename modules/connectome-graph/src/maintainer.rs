//! Re-derives partition aggregates and refreshes timestamps.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::NaiveDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use connectome_common::{ConnectomeError, RoiFold, RoiInfo};

use crate::classifier::Classification;
use crate::clock::Clock;
use crate::schema::{label, prop};
use crate::store::{GraphStore, NodeId, PropertyValue, StoreTxn};

/// One unit of background work, captured from a classified batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenanceTask {
    pub id: Uuid,
    pub timestamp: BTreeSet<NodeId>,
    pub touched: BTreeSet<String>,
    pub stale: BTreeSet<String>,
}

impl MaintenanceTask {
    /// A task that only re-derives `dataset`'s Meta node.
    pub fn recompute(dataset: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: BTreeSet::new(),
            touched: BTreeSet::new(),
            stale: BTreeSet::from([dataset.into()]),
        }
    }

    pub fn partitions(&self) -> BTreeSet<String> {
        self.touched.union(&self.stale).cloned().collect()
    }
}

impl From<Classification> for MaintenanceTask {
    fn from(c: Classification) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: c.timestamp,
            touched: c.touched,
            stale: c.stale,
        }
    }
}

/// Values written onto a partition's Meta node by a full re-scan.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaAggregate {
    pub dataset: String,
    pub total_pre: u64,
    pub total_post: u64,
    pub roi_info: RoiInfo,
    pub last_database_edit: NaiveDateTime,
    /// Synapses left out of the counts because a tag was missing. Non-zero
    /// means the aggregate is incomplete.
    pub malformed: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaintenanceReport {
    pub timestamped: usize,
    pub skipped_missing: usize,
    pub refreshed: Vec<String>,
    pub recomputed: Vec<MetaAggregate>,
}

pub struct AggregateMaintainer<S: GraphStore> {
    store: S,
    clock: Arc<dyn Clock>,
}

impl<S: GraphStore> AggregateMaintainer<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Run one task in its own transaction. On error nothing is written.
    pub async fn run(&self, task: &MaintenanceTask) -> Result<MaintenanceReport, ConnectomeError> {
        let mut txn = self.store.begin().await?;
        match self.apply(&mut txn, task).await {
            Ok(report) => {
                txn.commit().await?;
                Ok(report)
            }
            Err(e) => {
                if let Err(rollback) = txn.rollback().await {
                    warn!(task_id = %task.id, error = %rollback, "Rollback after failed maintenance task failed");
                }
                Err(e)
            }
        }
    }

    /// Re-derive one partition's Meta node outside the trigger path.
    pub async fn recompute_partition(&self, dataset: &str) -> Result<MetaAggregate, ConnectomeError> {
        let report = self.run(&MaintenanceTask::recompute(dataset)).await?;
        report
            .recomputed
            .into_iter()
            .next()
            .ok_or_else(|| ConnectomeError::MissingPartitionAggregate(dataset.to_string()))
    }

    async fn apply(
        &self,
        txn: &mut S::Txn,
        task: &MaintenanceTask,
    ) -> Result<MaintenanceReport, ConnectomeError> {
        let now = self.clock.now();
        let mut report = MaintenanceReport::default();

        for &node in &task.timestamp {
            // Deleted by a transaction that committed after the trigger.
            if !txn.node_exists(node).await? {
                warn!(task_id = %task.id, node, "Skipping timestamp for missing node");
                report.skipped_missing += 1;
                continue;
            }
            txn.set_node_property(node, prop::TIME_STAMP, now.into())
                .await?;
            report.timestamped += 1;
        }

        for dataset in task.partitions() {
            let meta = find_meta(txn, &dataset).await?;
            txn.lock_node(meta).await?;
            if task.stale.contains(&dataset) {
                let aggregate = recompute_meta(txn, meta, &dataset, now).await?;
                report.recomputed.push(aggregate);
            } else {
                txn.set_node_property(meta, prop::LAST_DATABASE_EDIT, now.into())
                    .await?;
                report.refreshed.push(dataset);
            }
        }

        debug!(
            task_id = %task.id,
            timestamped = report.timestamped,
            skipped = report.skipped_missing,
            recomputed = report.recomputed.len(),
            "Maintenance task applied"
        );
        Ok(report)
    }
}

pub(crate) async fn find_meta<T: StoreTxn>(txn: &mut T, dataset: &str) -> Result<NodeId, ConnectomeError> {
    txn.find_node(label::META, prop::DATASET, dataset.into())
        .await?
        .ok_or_else(|| ConnectomeError::MissingPartitionAggregate(dataset.to_string()))
}

/// HP thresholds stored on the Meta node, 0.0 when absent.
pub(crate) async fn meta_thresholds<T: StoreTxn>(
    txn: &mut T,
    meta: NodeId,
) -> Result<(f64, f64), ConnectomeError> {
    let read = |v: Option<PropertyValue>| v.as_ref().and_then(PropertyValue::as_f64).unwrap_or(0.0);
    let pre = read(txn.node_property(meta, prop::PRE_HP_THRESHOLD).await?);
    let post = read(txn.node_property(meta, prop::POST_HP_THRESHOLD).await?);
    Ok((pre, post))
}

/// Full re-scan of a partition's synapses, written back onto its Meta node.
/// The caller holds the Meta lock.
pub(crate) async fn recompute_meta<T: StoreTxn>(
    txn: &mut T,
    meta: NodeId,
    dataset: &str,
    now: NaiveDateTime,
) -> Result<MetaAggregate, ConnectomeError> {
    let (pre_hp, post_hp) = meta_thresholds(txn, meta).await?;
    let records = txn.synapses_in_partition(dataset).await?;
    let fold = RoiFold::collect(records.iter(), pre_hp, post_hp);
    if !fold.is_complete() {
        warn!(dataset, malformed = fold.malformed, "Meta counts exclude malformed synapses");
    }

    txn.set_node_property(meta, prop::TOTAL_PRE_COUNT, fold.pre.into())
        .await?;
    txn.set_node_property(meta, prop::TOTAL_POST_COUNT, fold.post.into())
        .await?;
    txn.set_node_property(meta, prop::ROI_INFO, fold.roi_info.to_json().into())
        .await?;
    txn.set_node_property(meta, prop::LAST_DATABASE_EDIT, now.into())
        .await?;

    info!(
        dataset,
        total_pre = fold.pre,
        total_post = fold.post,
        rois = fold.roi_info.len(),
        "Meta recomputed"
    );
    Ok(MetaAggregate {
        dataset: dataset.to_string(),
        total_pre: fold.pre,
        total_post: fold.post,
        roi_info: fold.roi_info,
        last_database_edit: now,
        malformed: fold.malformed,
    })
}
