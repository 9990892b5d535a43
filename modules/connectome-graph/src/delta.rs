//! Post-commit change records.

use std::collections::{BTreeSet, HashSet};

use crate::store::{NodeId, RelId};

/// A node as seen by a delta: its id and labels. For deleted nodes the
/// labels are the ones it had before deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRef {
    pub id: NodeId,
    pub labels: BTreeSet<String>,
}

impl NodeRef {
    pub fn new<I, S>(id: NodeId, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id,
            labels: labels.into_iter().map(Into::into).collect(),
        }
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelRef {
    pub id: RelId,
    pub rel_type: String,
    pub start: NodeRef,
    pub end: NodeRef,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphDelta {
    NodeCreated(NodeRef),
    NodeDeleted(NodeRef),
    LabelAssigned { node: NodeRef, label: String },
    LabelRemoved { node: NodeRef, label: String },
    NodePropertyAssigned { node: NodeRef, key: String },
    NodePropertyRemoved { node: NodeRef, key: String },
    RelationshipCreated(RelRef),
    RelationshipDeleted(RelRef),
    RelationshipPropertyAssigned { rel: RelRef, key: String },
    RelationshipPropertyRemoved { rel: RelRef, key: String },
}

/// Every change made by one committed transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaBatch {
    deltas: Vec<GraphDelta>,
}

impl DeltaBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, delta: GraphDelta) {
        self.deltas.push(delta);
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, GraphDelta> {
        self.deltas.iter()
    }

    pub fn deleted_nodes(&self) -> HashSet<NodeId> {
        self.deltas
            .iter()
            .filter_map(|d| match d {
                GraphDelta::NodeDeleted(n) => Some(n.id),
                _ => None,
            })
            .collect()
    }
}

impl FromIterator<GraphDelta> for DeltaBatch {
    fn from_iter<T: IntoIterator<Item = GraphDelta>>(iter: T) -> Self {
        Self {
            deltas: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a DeltaBatch {
    type Item = &'a GraphDelta;
    type IntoIter = std::slice::Iter<'a, GraphDelta>;

    fn into_iter(self) -> Self::IntoIter {
        self.deltas.iter()
    }
}
