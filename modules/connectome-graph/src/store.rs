//! Minimal graph-store capability set the engine is written against.
//!
//! Everything the loader, the maintainer and the ConnectionSet procedure
//! need from a store goes through [`GraphStore`] / [`StoreTxn`]. Two
//! implementations ship: [`crate::memory::MemoryStore`] for tests and
//! embedded use, and [`crate::neo4j::Neo4jStore`] over Bolt.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use thiserror::Error;

use connectome_common::{ConnectomeError, Location, RoiTagged, SynapseKind};

use crate::delta::DeltaBatch;
use crate::schema::{label, prop};

pub type NodeId = i64;
pub type RelId = i64;
pub type Props = BTreeMap<String, PropertyValue>;

// --- Values ---

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    StrList(Vec<String>),
    DateTime(NaiveDateTime),
}

impl PropertyValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Integers widen to floats; confidences are sometimes stored as `1`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Float(f) => Some(*f),
            PropertyValue::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            PropertyValue::DateTime(t) => Some(*t),
            _ => None,
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<u64> for PropertyValue {
    fn from(v: u64) -> Self {
        PropertyValue::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Float(v)
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::Str(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::Str(v.to_string())
    }
}

impl From<Vec<String>> for PropertyValue {
    fn from(v: Vec<String>) -> Self {
        PropertyValue::StrList(v)
    }
}

impl From<NaiveDateTime> for PropertyValue {
    fn from(v: NaiveDateTime) -> Self {
        PropertyValue::DateTime(v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    pub id: RelId,
    pub rel_type: String,
    pub start: NodeId,
    pub end: NodeId,
}

impl Relationship {
    pub fn other(&self, node: NodeId) -> NodeId {
        if self.start == node {
            self.end
        } else {
            self.start
        }
    }
}

/// A synapse node as read back from the store. Either tag may be missing on
/// hand-edited data, which is why this is not a [`connectome_common::Synapse`].
#[derive(Debug, Clone, PartialEq)]
pub struct SynapseRecord {
    pub node: NodeId,
    pub kind: Option<SynapseKind>,
    pub confidence: Option<f64>,
    pub location: Option<Location>,
    pub rois: BTreeSet<String>,
}

impl SynapseRecord {
    /// Decode a record from a node's labels and properties. ROIs are the
    /// boolean `true` properties; the direction comes from `type` and falls
    /// back to the `PreSyn`/`PostSyn` labels.
    pub fn from_node(node: NodeId, labels: &BTreeSet<String>, props: &Props) -> Self {
        let kind = props
            .get(prop::TYPE)
            .and_then(PropertyValue::as_str)
            .and_then(SynapseKind::parse)
            .or_else(|| {
                if labels.contains(label::PRE_SYN) {
                    Some(SynapseKind::Pre)
                } else if labels.contains(label::POST_SYN) {
                    Some(SynapseKind::Post)
                } else {
                    None
                }
            });
        let rois = props
            .iter()
            .filter(|(_, v)| matches!(v, PropertyValue::Bool(true)))
            .map(|(k, _)| k.clone())
            .collect();
        Self {
            node,
            kind,
            confidence: props.get(prop::CONFIDENCE).and_then(PropertyValue::as_f64),
            location: props
                .get(prop::LOCATION)
                .and_then(PropertyValue::as_str)
                .and_then(|s| s.parse().ok()),
            rois,
        }
    }
}

impl RoiTagged for SynapseRecord {
    fn kind(&self) -> Option<SynapseKind> {
        self.kind
    }

    fn confidence(&self) -> Option<f64> {
        self.confidence
    }

    fn rois(&self) -> &BTreeSet<String> {
        &self.rois
    }

    fn location(&self) -> Option<Location> {
        self.location
    }
}

// --- Errors ---

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("node {0} not found")]
    NodeNotFound(NodeId),

    #[error("relationship {0} not found")]
    RelationshipNotFound(RelId),

    #[error("Neo4j error: {0}")]
    Neo4j(#[from] neo4rs::Error),

    #[error("cannot decode {0}")]
    Decode(String),

    #[error("store is closed")]
    Closed,
}

impl From<StoreError> for ConnectomeError {
    fn from(e: StoreError) -> Self {
        ConnectomeError::Database(e.to_string())
    }
}

// --- Capabilities ---

#[async_trait]
pub trait GraphStore: Send + Sync + 'static {
    type Txn: StoreTxn;

    async fn begin(&self) -> Result<Self::Txn, StoreError>;
}

/// One store transaction. Writes become visible to other transactions at
/// `commit`; a transaction always reads its own writes.
#[async_trait]
pub trait StoreTxn: Send + Sized {
    async fn find_node(
        &mut self,
        label: &str,
        key: &str,
        value: PropertyValue,
    ) -> Result<Option<NodeId>, StoreError>;

    async fn nodes_with_label(&mut self, label: &str) -> Result<Vec<NodeId>, StoreError>;

    async fn node_exists(&mut self, node: NodeId) -> Result<bool, StoreError>;

    async fn node_labels(&mut self, node: NodeId) -> Result<BTreeSet<String>, StoreError>;

    async fn node_properties(&mut self, node: NodeId) -> Result<Props, StoreError>;

    async fn node_property(
        &mut self,
        node: NodeId,
        key: &str,
    ) -> Result<Option<PropertyValue>, StoreError> {
        Ok(self.node_properties(node).await?.remove(key))
    }

    async fn set_node_property(
        &mut self,
        node: NodeId,
        key: &str,
        value: PropertyValue,
    ) -> Result<(), StoreError>;

    async fn remove_node_property(&mut self, node: NodeId, key: &str) -> Result<(), StoreError>;

    async fn add_label(&mut self, node: NodeId, label: &str) -> Result<(), StoreError>;

    async fn remove_label(&mut self, node: NodeId, label: &str) -> Result<(), StoreError>;

    async fn create_node(&mut self, labels: &[String], props: Props) -> Result<NodeId, StoreError>;

    /// Deletes the node together with its relationships.
    async fn delete_node(&mut self, node: NodeId) -> Result<(), StoreError>;

    async fn create_relationship(
        &mut self,
        start: NodeId,
        end: NodeId,
        rel_type: &str,
        props: Props,
    ) -> Result<RelId, StoreError>;

    async fn relationship_property(
        &mut self,
        rel: RelId,
        key: &str,
    ) -> Result<Option<PropertyValue>, StoreError>;

    async fn set_relationship_property(
        &mut self,
        rel: RelId,
        key: &str,
        value: PropertyValue,
    ) -> Result<(), StoreError>;

    async fn delete_relationship(&mut self, rel: RelId) -> Result<(), StoreError>;

    async fn relationships(
        &mut self,
        node: NodeId,
        rel_type: &str,
        direction: Direction,
    ) -> Result<Vec<Relationship>, StoreError>;

    /// Take the write lock on `node`, held until commit or rollback.
    async fn lock_node(&mut self, node: NodeId) -> Result<(), StoreError>;

    async fn synapse_record(&mut self, node: NodeId) -> Result<SynapseRecord, StoreError> {
        let labels = self.node_labels(node).await?;
        let props = self.node_properties(node).await?;
        Ok(SynapseRecord::from_node(node, &labels, &props))
    }

    /// Every Synapse node carrying the dataset label.
    async fn synapses_in_partition(
        &mut self,
        dataset: &str,
    ) -> Result<Vec<SynapseRecord>, StoreError> {
        let mut records = Vec::new();
        for node in self.nodes_with_label(label::SYNAPSE).await? {
            if self.node_labels(node).await?.contains(dataset) {
                records.push(self.synapse_record(node).await?);
            }
        }
        Ok(records)
    }

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

/// Receives the delta batch of every committed transaction. Called on the
/// committing task, so implementations must return quickly and must not
/// write to the store.
pub trait CommitListener: Send + Sync {
    fn after_commit(&self, batch: &DeltaBatch);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn synapse_direction_falls_back_to_labels() {
        let mut props = Props::new();
        props.insert(prop::CONFIDENCE.to_string(), 0.8.into());
        props.insert(prop::LOCATION.to_string(), "1:2:3".into());
        props.insert("roiA".to_string(), true.into());
        props.insert("roiB".to_string(), false.into());

        let post = SynapseRecord::from_node(7, &labels(&["Synapse", "PostSyn", "mb6"]), &props);
        assert_eq!(post.kind, Some(SynapseKind::Post));
        assert_eq!(post.location, Some(Location::new(1, 2, 3)));
        assert_eq!(post.confidence, Some(0.8));
        assert_eq!(post.rois, labels(&["roiA"]));

        let untyped = SynapseRecord::from_node(8, &labels(&["Synapse", "mb6"]), &props);
        assert_eq!(untyped.kind, None);

        // `type` wins over the label when both are present.
        props.insert(prop::TYPE.to_string(), "pre".into());
        let typed = SynapseRecord::from_node(9, &labels(&["Synapse", "PostSyn", "mb6"]), &props);
        assert_eq!(typed.kind, Some(SynapseKind::Pre));
    }
}
