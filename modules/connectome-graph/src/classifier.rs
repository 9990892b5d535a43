//! Decides what a committed delta batch invalidates.

use std::collections::{BTreeSet, HashSet};

use crate::delta::{DeltaBatch, GraphDelta, NodeRef};
use crate::schema::{label, prop};
use crate::store::NodeId;

/// What one batch requires of the maintainer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    /// Nodes whose `timeStamp` must be refreshed.
    pub timestamp: BTreeSet<NodeId>,
    /// Partitions with at least one timestamped node; their Meta
    /// `lastDatabaseEdit` is refreshed.
    pub touched: BTreeSet<String>,
    /// Partitions whose Meta counts must be re-derived.
    pub stale: BTreeSet<String>,
}

impl Classification {
    pub fn is_empty(&self) -> bool {
        self.timestamp.is_empty() && self.stale.is_empty()
    }

    /// Partitions whose Meta node the maintainer will write.
    pub fn partitions(&self) -> BTreeSet<String> {
        self.touched.union(&self.stale).cloned().collect()
    }
}

/// Classifies delta batches against the set of partitions that exist in the
/// store. A node belongs to a partition when it carries the dataset label.
#[derive(Debug, Clone, Default)]
pub struct DeltaClassifier {
    partitions: BTreeSet<String>,
}

impl DeltaClassifier {
    pub fn new<I, S>(partitions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            partitions: partitions.into_iter().map(Into::into).collect(),
        }
    }

    pub fn add_partition(&mut self, dataset: impl Into<String>) -> bool {
        self.partitions.insert(dataset.into())
    }

    pub fn partitions(&self) -> &BTreeSet<String> {
        &self.partitions
    }

    /// Datasets whose Meta node is created, or gains a label, in `batch`.
    /// A Meta node carries its dataset as a second label.
    pub fn announced_partitions(batch: &DeltaBatch) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        for delta in batch {
            let node = match delta {
                GraphDelta::NodeCreated(node) | GraphDelta::LabelAssigned { node, .. } => node,
                _ => continue,
            };
            if node.has_label(label::META) {
                found.extend(node.labels.iter().filter(|l| *l != label::META).cloned());
            }
        }
        found
    }

    pub fn classify(&self, batch: &DeltaBatch) -> Classification {
        let deleted = batch.deleted_nodes();
        let mut pass = Pass {
            partitions: &self.partitions,
            deleted: &deleted,
            out: Classification::default(),
        };

        for delta in batch {
            match delta {
                GraphDelta::NodeCreated(node) => {
                    pass.timestamp(node);
                    pass.check_stale(node);
                }
                GraphDelta::NodeDeleted(_) => {}
                GraphDelta::LabelAssigned { node, .. } | GraphDelta::LabelRemoved { node, .. } => {
                    pass.timestamp(node);
                }
                GraphDelta::NodePropertyAssigned { node, key }
                | GraphDelta::NodePropertyRemoved { node, key } => {
                    // Writing timeStamp is what maintenance itself does.
                    if key != prop::TIME_STAMP {
                        pass.timestamp(node);
                        pass.check_stale(node);
                    }
                }
                GraphDelta::RelationshipCreated(rel)
                | GraphDelta::RelationshipDeleted(rel)
                | GraphDelta::RelationshipPropertyAssigned { rel, .. }
                | GraphDelta::RelationshipPropertyRemoved { rel, .. } => {
                    pass.timestamp(&rel.start);
                    pass.timestamp(&rel.end);
                }
            }
        }

        if !pass.out.is_empty() {
            tracing::debug!(
                deltas = batch.len(),
                timestamp = pass.out.timestamp.len(),
                touched = ?pass.out.touched,
                stale = ?pass.out.stale,
                "Classified delta batch"
            );
        }
        pass.out
    }
}

struct Pass<'a> {
    partitions: &'a BTreeSet<String>,
    deleted: &'a HashSet<NodeId>,
    out: Classification,
}

impl Pass<'_> {
    fn timestamp(&mut self, node: &NodeRef) {
        if node.has_label(label::META) || self.deleted.contains(&node.id) {
            return;
        }
        self.out.timestamp.insert(node.id);
        for ds in self.partitions_of(node) {
            self.out.touched.insert(ds);
        }
    }

    fn check_stale(&mut self, node: &NodeRef) {
        if !node.has_label(label::SYNAPSE) || self.deleted.contains(&node.id) {
            return;
        }
        for ds in self.partitions_of(node) {
            self.out.stale.insert(ds);
        }
    }

    fn partitions_of(&self, node: &NodeRef) -> Vec<String> {
        self.partitions
            .iter()
            .filter(|ds| node.has_label(ds))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::RelRef;

    fn synapse(id: NodeId) -> NodeRef {
        NodeRef::new(id, ["mb6", "Synapse", "PreSyn"])
    }

    fn segment(id: NodeId) -> NodeRef {
        NodeRef::new(id, ["mb6", "Segment"])
    }

    fn meta(id: NodeId) -> NodeRef {
        NodeRef::new(id, ["Meta"])
    }

    fn classifier() -> DeltaClassifier {
        DeltaClassifier::new(["mb6", "other"])
    }

    fn ids(c: &Classification) -> Vec<NodeId> {
        c.timestamp.iter().copied().collect()
    }

    #[test]
    fn empty_batch_needs_no_work() {
        let c = classifier().classify(&DeltaBatch::new());
        assert!(c.is_empty());
        assert!(c.touched.is_empty());
        assert!(c.stale.is_empty());
    }

    #[test]
    fn created_synapse_is_timestamped_and_marks_partition_stale() {
        let batch: DeltaBatch = [GraphDelta::NodeCreated(synapse(1))].into_iter().collect();
        let c = classifier().classify(&batch);
        assert_eq!(ids(&c), vec![1]);
        assert_eq!(c.stale, BTreeSet::from(["mb6".to_string()]));
        assert_eq!(c.touched, BTreeSet::from(["mb6".to_string()]));
    }

    #[test]
    fn synapse_property_change_marks_stale_but_segment_change_does_not() {
        let batch: DeltaBatch = [GraphDelta::NodePropertyAssigned {
            node: segment(2),
            key: "name".into(),
        }]
        .into_iter()
        .collect();
        let c = classifier().classify(&batch);
        assert_eq!(ids(&c), vec![2]);
        assert!(c.stale.is_empty());

        let batch: DeltaBatch = [GraphDelta::NodePropertyRemoved {
            node: synapse(3),
            key: "roiA".into(),
        }]
        .into_iter()
        .collect();
        let c = classifier().classify(&batch);
        assert_eq!(ids(&c), vec![3]);
        assert_eq!(c.stale.len(), 1);
    }

    #[test]
    fn timestamp_only_change_is_suppressed() {
        let batch: DeltaBatch = [
            GraphDelta::NodePropertyAssigned {
                node: synapse(1),
                key: "timeStamp".into(),
            },
            GraphDelta::NodePropertyAssigned {
                node: segment(2),
                key: "timeStamp".into(),
            },
        ]
        .into_iter()
        .collect();
        let c = classifier().classify(&batch);
        assert!(c.is_empty());
        assert!(c.stale.is_empty());
    }

    #[test]
    fn meta_node_changes_never_trigger() {
        let batch: DeltaBatch = [
            GraphDelta::NodePropertyAssigned {
                node: meta(9),
                key: "totalPreCount".into(),
            },
            GraphDelta::LabelAssigned {
                node: meta(9),
                label: "mb6".into(),
            },
        ]
        .into_iter()
        .collect();
        assert!(classifier().classify(&batch).is_empty());
    }

    #[test]
    fn relationship_changes_timestamp_both_endpoints() {
        let rel = RelRef {
            id: 100,
            rel_type: "ConnectsTo".into(),
            start: segment(1),
            end: segment(2),
        };
        let batch: DeltaBatch = [GraphDelta::RelationshipPropertyAssigned {
            rel,
            key: "weight".into(),
        }]
        .into_iter()
        .collect();
        let c = classifier().classify(&batch);
        assert_eq!(ids(&c), vec![1, 2]);
        assert!(c.stale.is_empty());
    }

    #[test]
    fn nodes_deleted_in_the_same_batch_are_ignored() {
        let batch: DeltaBatch = [
            GraphDelta::NodeCreated(synapse(5)),
            GraphDelta::NodePropertyAssigned {
                node: synapse(5),
                key: "confidence".into(),
            },
            GraphDelta::NodeDeleted(synapse(5)),
        ]
        .into_iter()
        .collect();
        let c = classifier().classify(&batch);
        assert!(c.is_empty());
        assert!(c.stale.is_empty());
    }

    #[test]
    fn label_change_timestamps_without_staleness() {
        let batch: DeltaBatch = [GraphDelta::LabelAssigned {
            node: synapse(4),
            label: "Flagged".into(),
        }]
        .into_iter()
        .collect();
        let c = classifier().classify(&batch);
        assert_eq!(ids(&c), vec![4]);
        assert!(c.stale.is_empty());
    }

    #[test]
    fn meta_creation_announces_its_dataset() {
        let batch: DeltaBatch = [
            GraphDelta::NodeCreated(NodeRef::new(1, ["Meta", "fib25"])),
            GraphDelta::NodeCreated(segment(2)),
            GraphDelta::LabelAssigned {
                node: NodeRef::new(3, ["Meta", "hemibrain"]),
                label: "Meta".into(),
            },
        ]
        .into_iter()
        .collect();
        assert_eq!(
            DeltaClassifier::announced_partitions(&batch),
            BTreeSet::from(["fib25".to_string(), "hemibrain".to_string()])
        );
        assert!(DeltaClassifier::announced_partitions(&DeltaBatch::new()).is_empty());
    }

    #[test]
    fn unknown_partitions_are_not_reported() {
        let batch: DeltaBatch = [GraphDelta::NodeCreated(NodeRef::new(
            7,
            ["unregistered", "Synapse"],
        ))]
        .into_iter()
        .collect();
        let c = classifier().classify(&batch);
        assert_eq!(ids(&c), vec![7]);
        assert!(c.touched.is_empty());
        assert!(c.stale.is_empty());
    }
}
