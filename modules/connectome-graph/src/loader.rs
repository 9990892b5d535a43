//! Bulk write of a resolved connectome into a store.
//!
//! Everything goes into one transaction: a load either lands completely or
//! not at all. Every node created here carries `timeStamp`, and the Meta
//! node is derived by the same full re-scan the maintainer uses.

use std::collections::{BTreeSet, HashMap};

use chrono::NaiveDateTime;
use tracing::{info, warn};

use connectome_common::{
    body_roi_info, cluster_name, is_neuron, Body, BodyId, ConnectomeError, LoadOptions, Location,
    Synapse, SynapseKind,
};

use crate::clock::Clock;
use crate::connectivity::{resolve_connectivity, ConnectivityReport};
use crate::maintainer::{recompute_meta, MetaAggregate};
use crate::schema::{connection_set_key, label, labels_for, prop, rel};
use crate::store::{GraphStore, NodeId, PropertyValue, Props, StoreTxn};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadSummary {
    pub dataset: String,
    pub segments: usize,
    pub neurons: usize,
    pub synapses: usize,
    pub synapses_to: usize,
    pub connects_to: usize,
    pub connection_sets: usize,
    pub unresolved: usize,
    pub meta: Option<MetaAggregate>,
}

/// Resolve `bodies` and write them into `options.dataset`. A duplicate
/// location or an ROI named like a node property aborts before anything
/// is written.
pub async fn load_connectome<S: GraphStore>(
    store: &S,
    bodies: &[Body],
    options: &LoadOptions,
    clock: &dyn Clock,
) -> Result<LoadSummary, ConnectomeError> {
    info!(dataset = %options.dataset, bodies = bodies.len(), "Loading connectome");
    check_roi_names(bodies)?;
    let report = resolve_connectivity(bodies)?;
    if !report.unresolved.is_empty() {
        warn!(
            dataset = %options.dataset,
            unresolved = report.unresolved.len(),
            "Some partner locations are not owned by any loaded body"
        );
    }

    let mut txn = store.begin().await?;
    match write_connectome(&mut txn, bodies, &report, options, clock.now()).await {
        Ok(summary) => {
            txn.commit().await?;
            info!(
                dataset = %summary.dataset,
                segments = summary.segments,
                neurons = summary.neurons,
                synapses = summary.synapses,
                connects_to = summary.connects_to,
                "Connectome loaded"
            );
            Ok(summary)
        }
        Err(e) => {
            if let Err(rollback) = txn.rollback().await {
                warn!(error = %rollback, "Rollback after failed load failed");
            }
            Err(e)
        }
    }
}

fn check_roi_names(bodies: &[Body]) -> Result<(), ConnectomeError> {
    for body in bodies {
        for synapse in body.synapses() {
            if let Some(roi) = synapse.rois.iter().find(|r| prop::is_reserved(r)) {
                return Err(ConnectomeError::Validation(format!(
                    "body {} synapse at {}: ROI name {roi:?} collides with a node property",
                    body.id, synapse.location
                )));
            }
        }
    }
    Ok(())
}

fn props<const N: usize>(pairs: [(&str, PropertyValue); N]) -> Props {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

pub fn body_id_value(id: &BodyId) -> PropertyValue {
    match id {
        BodyId::Numeric(n) => PropertyValue::Int(*n),
        BodyId::Named(s) => PropertyValue::Str(s.clone()),
    }
}

fn with_roi_flags<'a>(mut props: Props, rois: impl IntoIterator<Item = &'a String>) -> Props {
    for roi in rois {
        props.insert(roi.clone(), PropertyValue::Bool(true));
    }
    props
}

async fn write_connectome<T: StoreTxn>(
    txn: &mut T,
    bodies: &[Body],
    report: &ConnectivityReport,
    options: &LoadOptions,
    now: NaiveDateTime,
) -> Result<LoadSummary, ConnectomeError> {
    let ds = options.dataset.as_str();
    let mut summary = LoadSummary {
        dataset: ds.to_string(),
        unresolved: report.unresolved.len(),
        ..Default::default()
    };

    let meta = upsert_meta(txn, options, now).await?;
    txn.lock_node(meta).await?;

    // --- Segments, synapse sets and synapses ---

    let mut segments: HashMap<BodyId, NodeId> = HashMap::with_capacity(bodies.len());
    let mut synapse_nodes: HashMap<(SynapseKind, Location), NodeId> = HashMap::new();

    for body in bodies {
        let pre = body.pre_count() as u64;
        let post = body.post_count() as u64;
        let neuron = is_neuron(pre, post, options.neuron_threshold);
        let roi_info = body_roi_info(body);

        let mut kinds = vec![label::SEGMENT];
        if neuron {
            kinds.push(label::NEURON);
        }

        let mut segment_props = props([
            (prop::BODY_ID, body_id_value(&body.id)),
            (prop::PRE, pre.into()),
            (prop::POST, post.into()),
            (prop::ROI_INFO, roi_info.to_json().into()),
            (prop::TIME_STAMP, now.into()),
        ]);
        let attributes = &body.attributes;
        for (key, value) in [
            (prop::NAME, &attributes.name),
            (prop::TYPE, &attributes.cell_type),
            (prop::STATUS, &attributes.status),
        ] {
            if let Some(v) = value {
                segment_props.insert(key.to_string(), v.as_str().into());
            }
        }
        if neuron {
            let supers = if options.super_rois.is_empty() {
                roi_info.roi_set()
            } else {
                options.super_rois.clone()
            };
            segment_props.insert(
                prop::CLUSTER_NAME.to_string(),
                cluster_name(&roi_info, pre, post, &supers).into(),
            );
        }
        let segment_props = with_roi_flags(segment_props, roi_info.roi_set().iter());

        let segment = txn
            .create_node(&labels_for(ds, &kinds), segment_props)
            .await?;
        segments.insert(body.id.clone(), segment);
        summary.segments += 1;
        summary.neurons += neuron as usize;

        let synapse_set = txn
            .create_node(
                &labels_for(ds, &[label::SYNAPSE_SET]),
                props([
                    (prop::DATASET_BODY_ID, format!("{ds}:{}", body.id).into()),
                    (prop::TIME_STAMP, now.into()),
                ]),
            )
            .await?;
        txn.create_relationship(segment, synapse_set, rel::CONTAINS, Props::new())
            .await?;

        for synapse in body.synapses() {
            let node = create_synapse(txn, ds, synapse, now).await?;
            txn.create_relationship(synapse_set, node, rel::CONTAINS, Props::new())
                .await?;
            synapse_nodes.insert((synapse.kind, synapse.location), node);
            summary.synapses += 1;
        }
    }

    // --- Synapse-level links ---

    for (pre_location, partners) in &report.synapses_to {
        let Some(&pre_node) = synapse_nodes.get(&(SynapseKind::Pre, *pre_location)) else {
            continue;
        };
        let distinct: BTreeSet<&Location> = partners.iter().collect();
        for partner in distinct {
            if let Some(&post_node) = synapse_nodes.get(&(SynapseKind::Post, *partner)) {
                txn.create_relationship(pre_node, post_node, rel::SYNAPSES_TO, Props::new())
                    .await?;
                summary.synapses_to += 1;
            }
        }
    }

    // --- Body-level edges and connection sets ---

    for ((pre_body, post_body), weight) in &report.edges {
        let (Some(&from), Some(&to)) = (segments.get(pre_body), segments.get(post_body)) else {
            continue;
        };
        let Some(set) = report.connection_sets.get(&(pre_body.clone(), post_body.clone())) else {
            continue;
        };
        let stats = set.stats(options.pre_hp_threshold, options.post_hp_threshold);

        txn.create_relationship(
            from,
            to,
            rel::CONNECTS_TO,
            props([
                (prop::WEIGHT, (*weight).into()),
                (prop::WEIGHT_HP, stats.weight_hp.into()),
            ]),
        )
        .await?;
        summary.connects_to += 1;

        let cs = txn
            .create_node(
                &labels_for(ds, &[label::CONNECTION_SET]),
                props([
                    (
                        prop::DATASET_BODY_IDS,
                        connection_set_key(ds, pre_body, post_body).into(),
                    ),
                    (prop::ROI_INFO, stats.roi_info.to_json().into()),
                    (prop::TIME_STAMP, now.into()),
                ]),
            )
            .await?;
        txn.create_relationship(cs, from, rel::FROM, Props::new()).await?;
        txn.create_relationship(cs, to, rel::TO, Props::new()).await?;
        for synapse in set.synapses() {
            if let Some(&node) = synapse_nodes.get(&(synapse.kind, synapse.location)) {
                txn.create_relationship(cs, node, rel::CONTAINS, Props::new())
                    .await?;
            }
        }
        summary.connection_sets += 1;
    }

    summary.meta = Some(recompute_meta(txn, meta, ds, now).await?);
    Ok(summary)
}

async fn upsert_meta<T: StoreTxn>(
    txn: &mut T,
    options: &LoadOptions,
    now: NaiveDateTime,
) -> Result<NodeId, ConnectomeError> {
    let ds = options.dataset.as_str();
    let thresholds = [
        (prop::PRE_HP_THRESHOLD, options.pre_hp_threshold),
        (prop::POST_HP_THRESHOLD, options.post_hp_threshold),
    ];

    if let Some(meta) = txn
        .find_node(label::META, prop::DATASET, ds.into())
        .await?
    {
        for (key, value) in thresholds {
            txn.set_node_property(meta, key, value.into()).await?;
        }
        return Ok(meta);
    }

    let mut meta_props = props([
        (prop::DATASET, ds.into()),
        (prop::TOTAL_PRE_COUNT, 0i64.into()),
        (prop::TOTAL_POST_COUNT, 0i64.into()),
        (prop::ROI_INFO, "{}".into()),
        (prop::LAST_DATABASE_EDIT, now.into()),
    ]);
    for (key, value) in thresholds {
        meta_props.insert(key.to_string(), value.into());
    }
    if !options.super_rois.is_empty() {
        meta_props.insert(
            prop::SUPER_LEVEL_ROIS.to_string(),
            options.super_rois.iter().cloned().collect::<Vec<_>>().into(),
        );
    }
    let labels = vec![label::META.to_string(), ds.to_string()];
    Ok(txn.create_node(&labels, meta_props).await?)
}

async fn create_synapse<T: StoreTxn>(
    txn: &mut T,
    ds: &str,
    synapse: &Synapse,
    now: NaiveDateTime,
) -> Result<NodeId, ConnectomeError> {
    let direction = match synapse.kind {
        SynapseKind::Pre => label::PRE_SYN,
        SynapseKind::Post => label::POST_SYN,
    };
    let mut synapse_props = props([
        (prop::TYPE, synapse.kind.as_str().into()),
        (prop::LOCATION, synapse.location.key().into()),
        (prop::TIME_STAMP, now.into()),
    ]);
    if let Some(confidence) = synapse.confidence {
        synapse_props.insert(prop::CONFIDENCE.to_string(), confidence.into());
    }
    let synapse_props = with_roi_flags(synapse_props, &synapse.rois);
    Ok(txn
        .create_node(&labels_for(ds, &[label::SYNAPSE, direction]), synapse_props)
        .await?)
}
