//! On-demand recomputation of ConnectionSet aggregates.

use tracing::{debug, warn};

use connectome_common::{
    remove_synapse_from_roi_counters, BodyId, ConnectomeError, RoiFold, RoiInfo, SynapseKind,
};

use crate::connectivity::ConnectionSetStats;
use crate::maintainer::{find_meta, meta_thresholds};
use crate::schema::{connection_set_key, label, prop, rel};
use crate::store::{Direction, GraphStore, NodeId, PropertyValue, StoreTxn};

struct Located {
    set: NodeId,
    meta: NodeId,
    from: NodeId,
    to: NodeId,
    pre_hp: f64,
    post_hp: f64,
}

/// Refold the roiInfo of the `pre -> post` ConnectionSet from its current
/// synapses and write it back together with the `ConnectsTo` weight and
/// weightHP. The edge is deleted when no post terminal remains.
pub async fn set_connection_set_roi_info_and_weight_hp<S: GraphStore>(
    store: &S,
    dataset: &str,
    pre: &BodyId,
    post: &BodyId,
) -> Result<ConnectionSetStats, ConnectomeError> {
    let mut txn = store.begin().await?;
    let result = async {
        let located = locate(&mut txn, dataset, pre, post).await?;
        lock(&mut txn, &located).await?;
        let mut records = Vec::new();
        for r in txn
            .relationships(located.set, rel::CONTAINS, Direction::Outgoing)
            .await?
        {
            records.push(txn.synapse_record(r.end).await?);
        }
        let fold = RoiFold::collect(records.iter(), located.pre_hp, located.post_hp);
        let stats = ConnectionSetStats {
            weight: fold.post,
            weight_hp: fold.post_hp,
            roi_info: fold.roi_info,
        };
        write_stats(&mut txn, &located, &stats).await?;
        Ok::<_, ConnectomeError>(stats)
    }
    .await;
    finish(txn, result).await
}

/// Take one synapse out of the `pre -> post` ConnectionSet, decrementing
/// the stored aggregate instead of refolding the whole set.
pub async fn remove_synapse_from_connection_set<S: GraphStore>(
    store: &S,
    dataset: &str,
    pre: &BodyId,
    post: &BodyId,
    synapse: NodeId,
) -> Result<ConnectionSetStats, ConnectomeError> {
    let mut txn = store.begin().await?;
    let result = async {
        let located = locate(&mut txn, dataset, pre, post).await?;
        lock(&mut txn, &located).await?;
        let membership = txn
            .relationships(located.set, rel::CONTAINS, Direction::Outgoing)
            .await?
            .into_iter()
            .find(|r| r.end == synapse)
            .ok_or_else(|| {
                ConnectomeError::Validation(format!(
                    "synapse {synapse} is not part of ConnectionSet {}",
                    connection_set_key(dataset, pre, post)
                ))
            })?;

        let record = txn.synapse_record(synapse).await?;
        let mut roi_info = match txn.node_property(located.set, prop::ROI_INFO).await? {
            Some(PropertyValue::Str(json)) => RoiInfo::from_json(&json)?,
            _ => RoiInfo::new(),
        };
        let folded = remove_synapse_from_roi_counters(
            &mut roi_info,
            &record,
            located.pre_hp,
            located.post_hp,
        )?;

        let edge = connects_to(&mut txn, &located).await?;
        let (mut weight, mut weight_hp) = (0, 0);
        if let Some(edge) = edge {
            let read = |v: Option<PropertyValue>| v.and_then(|v| v.as_i64()).unwrap_or(0).max(0) as u64;
            weight = read(txn.relationship_property(edge, prop::WEIGHT).await?);
            weight_hp = read(txn.relationship_property(edge, prop::WEIGHT_HP).await?);
        }
        if folded.kind == SynapseKind::Post {
            weight = weight.saturating_sub(1);
            if folded.high_precision {
                weight_hp = weight_hp.saturating_sub(1);
            }
        }

        txn.delete_relationship(membership.id).await?;
        let stats = ConnectionSetStats {
            roi_info,
            weight,
            weight_hp,
        };
        write_stats(&mut txn, &located, &stats).await?;
        Ok::<_, ConnectomeError>(stats)
    }
    .await;
    finish(txn, result).await
}

async fn locate<T: StoreTxn>(
    txn: &mut T,
    dataset: &str,
    pre: &BodyId,
    post: &BodyId,
) -> Result<Located, ConnectomeError> {
    let missing = || ConnectomeError::MissingConnectionSet {
        dataset: dataset.to_string(),
        pre: pre.clone(),
        post: post.clone(),
    };
    let key = connection_set_key(dataset, pre, post);
    let set = txn
        .find_node(label::CONNECTION_SET, prop::DATASET_BODY_IDS, key.into())
        .await?
        .ok_or_else(missing)?;
    let meta = find_meta(txn, dataset).await?;
    let (pre_hp, post_hp) = meta_thresholds(txn, meta).await?;

    let endpoint = |rels: Vec<crate::store::Relationship>| rels.first().map(|r| r.end);
    let from = endpoint(txn.relationships(set, rel::FROM, Direction::Outgoing).await?)
        .ok_or_else(missing)?;
    let to = endpoint(txn.relationships(set, rel::TO, Direction::Outgoing).await?)
        .ok_or_else(missing)?;
    Ok(Located {
        set,
        meta,
        from,
        to,
        pre_hp,
        post_hp,
    })
}

/// Set first, then Meta. Held until commit, so concurrent edits of the same
/// set apply one after another against fresh reads.
async fn lock<T: StoreTxn>(txn: &mut T, located: &Located) -> Result<(), ConnectomeError> {
    txn.lock_node(located.set).await?;
    txn.lock_node(located.meta).await?;
    Ok(())
}

async fn connects_to<T: StoreTxn>(txn: &mut T, located: &Located) -> Result<Option<i64>, ConnectomeError> {
    Ok(txn
        .relationships(located.from, rel::CONNECTS_TO, Direction::Outgoing)
        .await?
        .into_iter()
        .find(|r| r.end == located.to)
        .map(|r| r.id))
}

async fn write_stats<T: StoreTxn>(
    txn: &mut T,
    located: &Located,
    stats: &ConnectionSetStats,
) -> Result<(), ConnectomeError> {
    txn.set_node_property(located.set, prop::ROI_INFO, stats.roi_info.to_json().into())
        .await?;
    let edge = connects_to(txn, located).await?;
    match edge {
        Some(edge) if stats.weight == 0 => {
            debug!(edge, "Deleting ConnectsTo with no remaining post terminals");
            txn.delete_relationship(edge).await?;
        }
        Some(edge) => {
            txn.set_relationship_property(edge, prop::WEIGHT, stats.weight.into())
                .await?;
            txn.set_relationship_property(edge, prop::WEIGHT_HP, stats.weight_hp.into())
                .await?;
        }
        None if stats.weight > 0 => {
            warn!(set = located.set, "ConnectionSet has post terminals but no ConnectsTo edge");
        }
        None => {}
    }
    Ok(())
}

async fn finish<T: StoreTxn>(
    txn: T,
    result: Result<ConnectionSetStats, ConnectomeError>,
) -> Result<ConnectionSetStats, ConnectomeError> {
    match result {
        Ok(stats) => {
            txn.commit().await?;
            Ok(stats)
        }
        Err(e) => {
            if let Err(rollback) = txn.rollback().await {
                warn!(error = %rollback, "Rollback after failed procedure failed");
            }
            Err(e)
        }
    }
}
