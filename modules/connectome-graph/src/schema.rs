//! Labels, relationship types and property keys shared by the loader, the
//! maintainer and both stores.

use connectome_common::BodyId;

pub mod label {
    pub const META: &str = "Meta";
    pub const SEGMENT: &str = "Segment";
    pub const NEURON: &str = "Neuron";
    pub const SYNAPSE_SET: &str = "SynapseSet";
    pub const SYNAPSE: &str = "Synapse";
    pub const PRE_SYN: &str = "PreSyn";
    pub const POST_SYN: &str = "PostSyn";
    pub const CONNECTION_SET: &str = "ConnectionSet";
}

pub mod rel {
    pub const CONTAINS: &str = "Contains";
    pub const SYNAPSES_TO: &str = "SynapsesTo";
    pub const CONNECTS_TO: &str = "ConnectsTo";
    pub const FROM: &str = "From";
    pub const TO: &str = "To";
}

pub mod prop {
    pub const TIME_STAMP: &str = "timeStamp";
    pub const LAST_DATABASE_EDIT: &str = "lastDatabaseEdit";
    pub const TOTAL_PRE_COUNT: &str = "totalPreCount";
    pub const TOTAL_POST_COUNT: &str = "totalPostCount";
    pub const ROI_INFO: &str = "roiInfo";
    pub const PRE_HP_THRESHOLD: &str = "preHPThreshold";
    pub const POST_HP_THRESHOLD: &str = "postHPThreshold";
    pub const SUPER_LEVEL_ROIS: &str = "superLevelRois";
    pub const DATASET: &str = "dataset";
    pub const BODY_ID: &str = "bodyId";
    pub const NAME: &str = "name";
    pub const TYPE: &str = "type";
    pub const STATUS: &str = "status";
    pub const PRE: &str = "pre";
    pub const POST: &str = "post";
    pub const CONFIDENCE: &str = "confidence";
    pub const LOCATION: &str = "location";
    pub const CLUSTER_NAME: &str = "clusterName";
    pub const DATASET_BODY_ID: &str = "datasetBodyId";
    pub const DATASET_BODY_IDS: &str = "datasetBodyIds";
    pub const WEIGHT: &str = "weight";
    pub const WEIGHT_HP: &str = "weightHP";

    /// Keys written on Segment and Synapse nodes next to their boolean ROI
    /// flags. An ROI with one of these names would overwrite the property.
    pub const NODE_KEYS: &[&str] = &[
        BODY_ID,
        PRE,
        POST,
        ROI_INFO,
        TIME_STAMP,
        NAME,
        TYPE,
        STATUS,
        CLUSTER_NAME,
        LOCATION,
        CONFIDENCE,
    ];

    pub fn is_reserved(key: &str) -> bool {
        NODE_KEYS.contains(&key)
    }
}

/// `<dataset>-<Label>`, the per-dataset copy of a structural label.
pub fn dataset_label(dataset: &str, label: &str) -> String {
    format!("{dataset}-{label}")
}

/// Label set for a node of kind `label` inside `dataset`.
pub fn labels_for(dataset: &str, extra: &[&str]) -> Vec<String> {
    let mut labels = Vec::with_capacity(extra.len() * 2 + 1);
    labels.push(dataset.to_string());
    for l in extra {
        labels.push(l.to_string());
        labels.push(dataset_label(dataset, l));
    }
    labels
}

/// Key of a ConnectionSet node: `dataset:pre:post`.
pub fn connection_set_key(dataset: &str, pre: &BodyId, post: &BodyId) -> String {
    format!("{dataset}:{pre}:{post}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_carry_dataset_copies() {
        assert_eq!(
            labels_for("mb6", &[label::SYNAPSE, label::PRE_SYN]),
            vec!["mb6", "Synapse", "mb6-Synapse", "PreSyn", "mb6-PreSyn"]
        );
        assert_eq!(
            connection_set_key("mb6", &BodyId::from(8426959), &BodyId::from(26311)),
            "mb6:8426959:26311"
        );
    }
}
