//! ConnectionSet procedures against a loaded in-memory graph.

use chrono::NaiveDate;

use connectome_common::{Body, BodyId, ConnectomeError, LoadOptions, Location, Synapse};
use connectome_graph::{
    load_connectome, remove_synapse_from_connection_set,
    set_connection_set_roi_info_and_weight_hp, Direction, FixedClock, GraphStore, MemoryStore,
    NodeId, PropertyValue, StoreTxn,
};

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

async fn loaded() -> MemoryStore {
    let store = MemoryStore::new();
    let clock = FixedClock(
        NaiveDate::from_ymd_opt(2018, 7, 4)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap(),
    );
    let options = LoadOptions::new("mb6").with_thresholds(0.5, 0.5);
    load_connectome(&store, &fixture(), &options, &clock)
        .await
        .unwrap();
    store
}

async fn synapse_at(store: &MemoryStore, key: &str) -> NodeId {
    let mut txn = store.begin().await.unwrap();
    txn.find_node("Synapse", "location", key.into())
        .await
        .unwrap()
        .unwrap()
}

/// (weight, weightHP) of the 1 -> 2 ConnectsTo edge, if it still exists.
async fn connects_to(store: &MemoryStore) -> Option<(i64, i64)> {
    let mut txn = store.begin().await.unwrap();
    let from = txn
        .find_node("Segment", "bodyId", 1i64.into())
        .await
        .unwrap()
        .unwrap();
    let edge = txn
        .relationships(from, "ConnectsTo", Direction::Outgoing)
        .await
        .unwrap()
        .into_iter()
        .next()?;
    let weight = txn.relationship_property(edge.id, "weight").await.unwrap();
    let weight_hp = txn.relationship_property(edge.id, "weightHP").await.unwrap();
    Some((weight?.as_i64()?, weight_hp?.as_i64()?))
}

#[tokio::test]
async fn load_writes_connection_set_aggregate() {
    let store = loaded().await;
    assert_eq!(connects_to(&store).await, Some((2, 1)));

    let mut txn = store.begin().await.unwrap();
    let cs = txn
        .find_node("ConnectionSet", "datasetBodyIds", "mb6:1:2".into())
        .await
        .unwrap()
        .expect("ConnectionSet created");
    assert_eq!(
        txn.node_property(cs, "roiInfo").await.unwrap(),
        Some(PropertyValue::Str(
            r#"{"roiA":{"preHP":1,"postHP":1,"pre":1,"post":2},"roiB":{"preHP":0,"postHP":0,"pre":0,"post":1}}"#
                .to_string()
        ))
    );
    assert_eq!(
        txn.relationships(cs, "Contains", Direction::Outgoing)
            .await
            .unwrap()
            .len(),
        3
    );
}

#[tokio::test]
async fn recompute_picks_up_confidence_change() {
    let store = loaded().await;
    let weak = synapse_at(&store, "2:0:0").await;
    let mut txn = store.begin().await.unwrap();
    txn.set_node_property(weak, "confidence", 0.8.into())
        .await
        .unwrap();
    txn.commit().await.unwrap();

    let stats =
        set_connection_set_roi_info_and_weight_hp(&store, "mb6", &BodyId::from(1), &BodyId::from(2))
            .await
            .unwrap();
    assert_eq!((stats.weight, stats.weight_hp), (2, 2));
    assert_eq!(stats.roi_info.get("roiB").unwrap().post_hp, 1);
    assert_eq!(connects_to(&store).await, Some((2, 2)));
}

#[tokio::test]
async fn removing_synapses_decrements_until_edge_disappears() {
    let store = loaded().await;
    let strong = synapse_at(&store, "1:0:0").await;
    let weak = synapse_at(&store, "2:0:0").await;
    let (one, two) = (BodyId::from(1), BodyId::from(2));

    let stats = remove_synapse_from_connection_set(&store, "mb6", &one, &two, strong)
        .await
        .unwrap();
    assert_eq!((stats.weight, stats.weight_hp), (1, 0));
    let roi_a = stats.roi_info.get("roiA").copied().unwrap();
    assert_eq!((roi_a.pre, roi_a.pre_hp, roi_a.post, roi_a.post_hp), (1, 1, 1, 0));
    assert_eq!(connects_to(&store).await, Some((1, 0)));

    let stats = remove_synapse_from_connection_set(&store, "mb6", &one, &two, weak)
        .await
        .unwrap();
    assert_eq!(stats.weight, 0);
    assert!(stats.roi_info.get("roiB").is_none());
    assert_eq!(
        stats.roi_info.to_json(),
        r#"{"roiA":{"preHP":1,"postHP":0,"pre":1,"post":0}}"#
    );
    assert_eq!(connects_to(&store).await, None);
}

#[tokio::test]
async fn missing_connection_set_is_reported_without_writes() {
    let store = loaded().await;
    let before = store.node_count();
    let err = set_connection_set_roi_info_and_weight_hp(&store, "mb6", &BodyId::from(2), &BodyId::from(1))
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectomeError::MissingConnectionSet { .. }));
    assert_eq!(store.node_count(), before);

    let err = set_connection_set_roi_info_and_weight_hp(&store, "other", &BodyId::from(1), &BodyId::from(2))
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectomeError::MissingConnectionSet { .. }));
}

#[tokio::test]
async fn removal_waits_for_a_concurrent_editor_of_the_set() {
    let store = loaded().await;
    let strong = synapse_at(&store, "1:0:0").await;

    let mut editor = store.begin().await.unwrap();
    let cs = editor
        .find_node("ConnectionSet", "datasetBodyIds", "mb6:1:2".into())
        .await
        .unwrap()
        .unwrap();
    editor.lock_node(cs).await.unwrap();
    let seen = editor.node_property(cs, "roiInfo").await.unwrap().unwrap();

    let remover = store.clone();
    let removal = tokio::spawn(async move {
        remove_synapse_from_connection_set(&remover, "mb6", &BodyId::from(1), &BodyId::from(2), strong)
            .await
    });

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(!removal.is_finished());

    // The editor writes back what it read; the removal must apply on top.
    editor.set_node_property(cs, "roiInfo", seen).await.unwrap();
    editor.commit().await.unwrap();

    let stats = removal.await.unwrap().unwrap();
    assert_eq!((stats.weight, stats.weight_hp), (1, 0));

    let mut txn = store.begin().await.unwrap();
    assert_eq!(
        txn.node_property(cs, "roiInfo").await.unwrap(),
        Some(PropertyValue::Str(stats.roi_info.to_json()))
    );
    assert_eq!(stats.roi_info.get("roiA").unwrap().post, 1);
}
