//! Trigger path end to end: commits on the in-memory store feed the
//! scheduler, whose workers refresh timestamps and Meta aggregates.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime};

use connectome_common::{Body, ConnectomeError, EngineConfig, LoadOptions, Location, Synapse};
use connectome_graph::{
    load_connectome, Clock, DeltaBatch, Engine, GraphDelta, GraphStore, MaintenanceTask, MemoryStore, NodeId,
    NodeRef, PropertyValue, StoreTxn, TriggerOutcome,
};

/// Advances one second per reading so each write is distinguishable.
struct SteppingClock(AtomicI64);

impl SteppingClock {
    fn new() -> Arc<Self> {
        Arc::new(Self(AtomicI64::new(1_530_000_000)))
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> NaiveDateTime {
        let secs = self.0.fetch_add(1, Ordering::SeqCst);
        DateTime::from_timestamp(secs, 0).unwrap().naive_utc()
    }
}

fn fixture() -> Vec<Body> {
    vec![
        Body::new(
            1,
            vec![Synapse::pre(Location::new(0, 0, 0), 0.9)
                .with_rois(["roiA"])
                .with_partners([Location::new(1, 0, 0), Location::new(2, 0, 0)])],
        ),
        Body::new(
            2,
            vec![
                Synapse::post(Location::new(1, 0, 0), 0.95).with_rois(["roiA"]),
                Synapse::post(Location::new(2, 0, 0), 0.4).with_rois(["roiA", "roiB"]),
            ],
        ),
    ]
}

fn options() -> LoadOptions {
    let mut options = LoadOptions::new("mb6").with_thresholds(0.5, 0.5);
    options.neuron_threshold = 5;
    options
}

async fn engine(workers: usize) -> Engine<MemoryStore> {
    let config = EngineConfig {
        workers,
        queue_capacity: 64,
    };
    Engine::in_memory(SteppingClock::new(), config).await.unwrap()
}

async fn meta_property(store: &MemoryStore, key: &str) -> Option<PropertyValue> {
    let mut txn = store.begin().await.unwrap();
    let meta = txn
        .find_node("Meta", "dataset", "mb6".into())
        .await
        .unwrap()
        .expect("Meta node exists");
    txn.node_property(meta, key).await.unwrap()
}

async fn synapse_at(store: &MemoryStore, key: &str) -> NodeId {
    let mut txn = store.begin().await.unwrap();
    txn.find_node("Synapse", "location", key.into())
        .await
        .unwrap()
        .expect("synapse exists")
}

async fn node_property(store: &MemoryStore, node: NodeId, key: &str) -> Option<PropertyValue> {
    let mut txn = store.begin().await.unwrap();
    txn.node_property(node, key).await.unwrap()
}

const LOADED_ROI_INFO: &str =
    r#"{"roiA":{"preHP":1,"postHP":1,"pre":1,"post":2},"roiB":{"preHP":0,"postHP":0,"pre":0,"post":1}}"#;

#[tokio::test]
async fn bulk_load_writes_graph_and_meta() {
    let engine = engine(1).await;
    let summary = engine.load(&fixture(), &options()).await.unwrap();
    assert_eq!(summary.segments, 2);
    assert_eq!(summary.neurons, 1);
    assert_eq!(summary.synapses, 3);
    assert_eq!(summary.synapses_to, 2);
    assert_eq!(summary.connects_to, 1);
    assert_eq!(summary.connection_sets, 1);

    let meta = summary.meta.expect("meta recomputed during load");
    assert_eq!((meta.total_pre, meta.total_post), (1, 2));
    assert_eq!(meta.roi_info.to_json(), LOADED_ROI_INFO);

    engine.shutdown().await;
    let stats = engine.scheduler().stats();
    assert_eq!(stats.failed, 0);
    assert!(stats.scheduled >= 1);

    let store = engine.store();
    assert_eq!(
        meta_property(store, "totalPostCount").await,
        Some(PropertyValue::Int(2))
    );
    assert_eq!(
        meta_property(store, "roiInfo").await,
        Some(PropertyValue::Str(LOADED_ROI_INFO.to_string()))
    );
}

#[tokio::test]
async fn roi_named_like_a_node_property_is_rejected() {
    let engine = engine(1).await;
    let mut bodies = fixture();
    bodies.push(Body::new(
        3,
        vec![Synapse::post(Location::new(9, 9, 9), 0.9).with_rois(["roiA", "confidence"])],
    ));

    let err = engine.load(&bodies, &options()).await.unwrap_err();
    assert!(matches!(err, ConnectomeError::Validation(ref msg) if msg.contains("confidence")));
    assert_eq!(engine.store().node_count(), 0);

    engine.shutdown().await;
    assert_eq!(engine.scheduler().stats().scheduled, 0);
}

#[tokio::test]
async fn roi_added_to_synapse_refreshes_meta_and_timestamp() {
    let engine = engine(1).await;
    engine.load(&fixture(), &options()).await.unwrap();
    let store = engine.store().clone();
    let post = synapse_at(&store, "1:0:0").await;
    let stamped_at_load = node_property(&store, post, "timeStamp").await;

    let mut txn = store.begin().await.unwrap();
    txn.set_node_property(post, "roiC", true.into()).await.unwrap();
    txn.commit().await.unwrap();

    engine.shutdown().await;
    assert_eq!(engine.scheduler().stats().failed, 0);

    let roi_info = meta_property(&store, "roiInfo").await.unwrap();
    assert!(roi_info.as_str().unwrap().contains(r#""roiC":{"preHP":0,"postHP":1,"pre":0,"post":1}"#));

    let restamped = node_property(&store, post, "timeStamp").await;
    assert!(restamped.is_some());
    assert_ne!(restamped, stamped_at_load);
}

#[tokio::test]
async fn partition_loaded_outside_the_engine_is_still_maintained() {
    let engine = engine(1).await;
    assert_eq!(engine.scheduler().stats().scheduled, 0);
    load_connectome(
        engine.store(),
        &fixture(),
        &options(),
        engine.maintainer().clock().as_ref(),
    )
    .await
    .unwrap();
    let store = engine.store().clone();
    let post = synapse_at(&store, "1:0:0").await;

    let mut txn = store.begin().await.unwrap();
    txn.set_node_property(post, "roiC", true.into()).await.unwrap();
    txn.commit().await.unwrap();

    engine.shutdown().await;
    assert_eq!(engine.scheduler().stats().failed, 0);

    let roi_info = meta_property(&store, "roiInfo").await.unwrap();
    assert!(roi_info.as_str().unwrap().contains(r#""roiC":{"preHP":0,"postHP":1,"pre":0,"post":1}"#));
    assert!(matches!(
        meta_property(&store, "lastDatabaseEdit").await,
        Some(PropertyValue::DateTime(_))
    ));
}

#[tokio::test]
async fn timestamp_only_transaction_schedules_nothing() {
    let engine = engine(1).await;
    engine.load(&fixture(), &options()).await.unwrap();
    let store = engine.store().clone();
    let post = synapse_at(&store, "2:0:0").await;

    // Direct classification of the batch such a commit produces.
    let batch: DeltaBatch = [GraphDelta::NodePropertyAssigned {
        node: NodeRef::new(post, ["mb6", "Synapse", "PostSyn"]),
        key: "timeStamp".into(),
    }]
    .into_iter()
    .collect();
    assert_eq!(engine.on_transaction_committed(&batch), TriggerOutcome::NoOp);
    assert_eq!(engine.on_transaction_committed(&DeltaBatch::new()), TriggerOutcome::NoOp);

    engine.shutdown().await;
    let before = engine.scheduler().stats();

    let mut txn = store.begin().await.unwrap();
    txn.set_node_property(post, "timeStamp", PropertyValue::Int(0))
        .await
        .unwrap();
    txn.commit().await.unwrap();

    // Nothing was scheduled or rejected: the batch classified as empty.
    assert_eq!(engine.scheduler().stats(), before);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn back_to_back_recomputes_converge() {
    let engine = engine(2).await;
    engine.load(&fixture(), &options()).await.unwrap();
    let store = engine.store().clone();

    let first = engine.scheduler().submit(MaintenanceTask::recompute("mb6"));
    let second = engine.scheduler().submit(MaintenanceTask::recompute("mb6"));
    assert!(matches!(first, TriggerOutcome::Scheduled(_)));
    assert!(matches!(second, TriggerOutcome::Scheduled(_)));

    engine.shutdown().await;
    let stats = engine.scheduler().stats();
    assert_eq!(stats.failed, 0);
    assert!(stats.completed >= 2);

    let after_tasks = (
        meta_property(&store, "totalPreCount").await,
        meta_property(&store, "totalPostCount").await,
        meta_property(&store, "roiInfo").await,
    );

    let fresh = engine.maintainer().recompute_partition("mb6").await.unwrap();
    assert_eq!(after_tasks.0, Some(PropertyValue::Int(fresh.total_pre as i64)));
    assert_eq!(after_tasks.1, Some(PropertyValue::Int(fresh.total_post as i64)));
    assert_eq!(after_tasks.2, Some(PropertyValue::Str(fresh.roi_info.to_json())));
    assert_eq!(fresh.roi_info.to_json(), LOADED_ROI_INFO);
}

#[tokio::test]
async fn failing_task_does_not_stop_the_pool() {
    let engine = engine(1).await;
    engine.load(&fixture(), &options()).await.unwrap();

    let ghost = engine.scheduler().submit(MaintenanceTask::recompute("no-such-dataset"));
    let real = engine.scheduler().submit(MaintenanceTask::recompute("mb6"));
    assert!(matches!(ghost, TriggerOutcome::Scheduled(_)));
    assert!(matches!(real, TriggerOutcome::Scheduled(_)));

    engine.shutdown().await;
    let stats = engine.scheduler().stats();
    assert_eq!(stats.failed, 1);
    assert!(stats.completed >= 2);
}

#[tokio::test]
async fn nodes_deleted_before_maintenance_are_skipped() {
    let engine = engine(1).await;
    engine.load(&fixture(), &options()).await.unwrap();
    let store = engine.store().clone();
    let gone = synapse_at(&store, "2:0:0").await;

    let mut task = MaintenanceTask::recompute("mb6");
    task.timestamp.insert(gone);

    let mut txn = store.begin().await.unwrap();
    txn.delete_node(gone).await.unwrap();
    txn.commit().await.unwrap();

    let report = engine.maintainer().run(&task).await.unwrap();
    assert_eq!(report.skipped_missing, 1);
    assert_eq!(report.timestamped, 0);
    assert_eq!(report.recomputed[0].total_post, 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn shutdown_rejects_new_work() {
    let engine = engine(1).await;
    engine.shutdown().await;
    assert_eq!(
        engine.scheduler().submit(MaintenanceTask::recompute("mb6")),
        TriggerOutcome::Rejected(connectome_graph::RejectReason::ShutDown)
    );
}
