//! Loader and maintainer against a real Neo4j.
//!
//! Requirements: Docker (for Neo4j via testcontainers)
//!
//! Run with: cargo test -p connectome-graph --features test-utils --test neo4j_store_test

#![cfg(feature = "test-utils")]

use std::sync::Arc;

use connectome_common::{BodyId, LoadOptions, Location, SynapseKind};
use connectome_graph::testutil::{neo4j_container, two_body_fixture};
use connectome_graph::{
    load_connectome, migrate::migrate, set_connection_set_roi_info_and_weight_hp,
    AggregateMaintainer, GraphStore, MaintenanceTask, Neo4jStore, PropertyValue, Props, StoreTxn,
    SystemClock,
};

async fn setup() -> (impl std::any::Any, Neo4jStore) {
    let (container, client) = neo4j_container().await;
    migrate(&client).await.expect("migration failed");
    (container, Neo4jStore::new(client))
}

#[tokio::test]
async fn load_then_recompute_meta_round_trips_through_neo4j() {
    let (_container, store) = setup().await;
    let options = LoadOptions::new("mb6").with_thresholds(0.0, 0.9);

    let summary = load_connectome(&store, &two_body_fixture(), &options, &SystemClock)
        .await
        .expect("load");
    assert_eq!(summary.connects_to, 1);
    let meta = summary.meta.expect("meta");
    assert_eq!((meta.total_pre, meta.total_post), (1, 1));

    let maintainer = AggregateMaintainer::new(store.clone(), Arc::new(SystemClock));
    let report = maintainer
        .run(&MaintenanceTask::recompute("mb6"))
        .await
        .expect("maintenance");
    assert_eq!(report.recomputed[0].roi_info, meta.roi_info);

    let mut txn = store.begin().await.unwrap();
    let meta_node = txn
        .find_node("Meta", "dataset", "mb6".into())
        .await
        .unwrap()
        .expect("Meta node");
    assert_eq!(
        txn.node_property(meta_node, "totalPreCount").await.unwrap(),
        Some(PropertyValue::Int(1))
    );
    txn.rollback().await.unwrap();

    let stats = set_connection_set_roi_info_and_weight_hp(
        &store,
        "mb6",
        &BodyId::from(8426959),
        &BodyId::from(26311),
    )
    .await
    .expect("procedure");
    assert_eq!((stats.weight, stats.weight_hp), (1, 0));
}

#[tokio::test]
async fn partition_scan_reads_direction_from_labels_when_type_is_missing() {
    let (_container, store) = setup().await;

    let mut txn = store.begin().await.unwrap();
    let labels: Vec<String> = ["Synapse", "PostSyn", "fib25"].map(String::from).to_vec();
    let mut props = Props::new();
    props.insert("location".to_string(), "4:5:6".into());
    props.insert("confidence".to_string(), 0.9.into());
    props.insert("roiA".to_string(), true.into());
    let node = txn.create_node(&labels, props).await.unwrap();

    let records = txn.synapses_in_partition("fib25").await.unwrap();
    txn.rollback().await.unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].node, node);
    assert_eq!(records[0].kind, Some(SynapseKind::Post));
    assert_eq!(records[0].location, Some(Location::new(4, 5, 6)));
    assert!(records[0].rois.contains("roiA"));
}
