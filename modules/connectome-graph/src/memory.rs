//! In-process graph store.
//!
//! Transactions stage their writes in an overlay that only they can see and
//! replay them onto the shared graph at commit. Replay produces the
//! [`DeltaBatch`] handed to every registered [`CommitListener`], the same
//! post-commit hook a server-side store offers.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;
use tracing::warn;

use crate::delta::{DeltaBatch, GraphDelta, NodeRef, RelRef};
use crate::store::{
    CommitListener, Direction, GraphStore, NodeId, PropertyValue, Props, RelId, Relationship,
    StoreError, StoreTxn,
};

#[derive(Debug, Clone, Default)]
struct NodeData {
    labels: BTreeSet<String>,
    props: Props,
}

#[derive(Debug, Clone)]
struct RelData {
    rel_type: String,
    start: NodeId,
    end: NodeId,
    props: Props,
}

#[derive(Debug, Default)]
struct Graph {
    nodes: HashMap<NodeId, NodeData>,
    rels: HashMap<RelId, RelData>,
}

#[derive(Default)]
struct Inner {
    graph: RwLock<Graph>,
    locks: Mutex<HashMap<NodeId, Arc<tokio::sync::Mutex<()>>>>,
    listeners: RwLock<Vec<Arc<dyn CommitListener>>>,
    next_id: AtomicI64,
    closed: AtomicBool,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for the delta batch of every later commit.
    pub fn subscribe(&self, listener: Arc<dyn CommitListener>) {
        if let Ok(mut listeners) = self.inner.listeners.write() {
            listeners.push(listener);
        }
    }

    /// Refuse new transactions and commits.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn node_count(&self) -> usize {
        self.inner.graph.read().map(|g| g.nodes.len()).unwrap_or(0)
    }

    fn lock_handle(&self, node: NodeId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.inner.locks.lock() {
            Ok(l) => l,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(node).or_default().clone()
    }
}

#[async_trait]
impl GraphStore for MemoryStore {
    type Txn = MemoryTxn;

    async fn begin(&self) -> Result<MemoryTxn, StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(MemoryTxn {
            store: self.clone(),
            nodes: HashMap::new(),
            rels: HashMap::new(),
            ops: Vec::new(),
            held: HashMap::new(),
        })
    }
}

// --- Transactions ---

#[derive(Debug)]
enum Op {
    CreateNode { id: NodeId, data: NodeData },
    DeleteNode(NodeId),
    SetProp { id: NodeId, key: String, value: PropertyValue },
    RemoveProp { id: NodeId, key: String },
    AddLabel { id: NodeId, label: String },
    RemoveLabel { id: NodeId, label: String },
    CreateRel { id: RelId, data: RelData },
    DeleteRel(RelId),
    SetRelProp { id: RelId, key: String, value: PropertyValue },
}

pub struct MemoryTxn {
    store: MemoryStore,
    // Staged versions; `None` marks a deletion.
    nodes: HashMap<NodeId, Option<NodeData>>,
    rels: HashMap<RelId, Option<RelData>>,
    ops: Vec<Op>,
    held: HashMap<NodeId, OwnedMutexGuard<()>>,
}

impl MemoryTxn {
    fn graph(&self) -> Result<std::sync::RwLockReadGuard<'_, Graph>, StoreError> {
        self.store
            .inner
            .graph
            .read()
            .map_err(|_| StoreError::Decode("memory store lock poisoned".into()))
    }

    fn read_node(&self, id: NodeId) -> Result<Option<NodeData>, StoreError> {
        if let Some(staged) = self.nodes.get(&id) {
            return Ok(staged.clone());
        }
        Ok(self.graph()?.nodes.get(&id).cloned())
    }

    fn read_rel(&self, id: RelId) -> Result<Option<RelData>, StoreError> {
        if let Some(staged) = self.rels.get(&id) {
            return Ok(staged.clone());
        }
        Ok(self.graph()?.rels.get(&id).cloned())
    }

    fn existing_node(&self, id: NodeId) -> Result<NodeData, StoreError> {
        self.read_node(id)?.ok_or(StoreError::NodeNotFound(id))
    }

    fn visible_nodes(&self) -> Result<Vec<(NodeId, NodeData)>, StoreError> {
        let graph = self.graph()?;
        let mut out: Vec<(NodeId, NodeData)> = graph
            .nodes
            .iter()
            .filter(|(id, _)| !self.nodes.contains_key(id))
            .map(|(id, n)| (*id, n.clone()))
            .collect();
        out.extend(
            self.nodes
                .iter()
                .filter_map(|(id, n)| n.as_ref().map(|n| (*id, n.clone()))),
        );
        out.sort_by_key(|(id, _)| *id);
        Ok(out)
    }

    fn visible_rels(&self) -> Result<Vec<(RelId, RelData)>, StoreError> {
        let graph = self.graph()?;
        let mut out: Vec<(RelId, RelData)> = graph
            .rels
            .iter()
            .filter(|(id, _)| !self.rels.contains_key(id))
            .map(|(id, r)| (*id, r.clone()))
            .collect();
        out.extend(
            self.rels
                .iter()
                .filter_map(|(id, r)| r.as_ref().map(|r| (*id, r.clone()))),
        );
        out.sort_by_key(|(id, _)| *id);
        Ok(out)
    }

    fn stage_node(&mut self, id: NodeId, data: NodeData) {
        self.nodes.insert(id, Some(data));
    }

    fn next_id(&self) -> i64 {
        self.store.inner.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn release(&mut self) {
        self.held.clear();
    }
}

#[async_trait]
impl StoreTxn for MemoryTxn {
    async fn find_node(
        &mut self,
        label: &str,
        key: &str,
        value: PropertyValue,
    ) -> Result<Option<NodeId>, StoreError> {
        Ok(self
            .visible_nodes()?
            .into_iter()
            .find(|(_, n)| n.labels.contains(label) && n.props.get(key) == Some(&value))
            .map(|(id, _)| id))
    }

    async fn nodes_with_label(&mut self, label: &str) -> Result<Vec<NodeId>, StoreError> {
        Ok(self
            .visible_nodes()?
            .into_iter()
            .filter(|(_, n)| n.labels.contains(label))
            .map(|(id, _)| id)
            .collect())
    }

    async fn node_exists(&mut self, node: NodeId) -> Result<bool, StoreError> {
        Ok(self.read_node(node)?.is_some())
    }

    async fn node_labels(&mut self, node: NodeId) -> Result<BTreeSet<String>, StoreError> {
        Ok(self.existing_node(node)?.labels)
    }

    async fn node_properties(&mut self, node: NodeId) -> Result<Props, StoreError> {
        Ok(self.existing_node(node)?.props)
    }

    async fn set_node_property(
        &mut self,
        node: NodeId,
        key: &str,
        value: PropertyValue,
    ) -> Result<(), StoreError> {
        let mut data = self.existing_node(node)?;
        data.props.insert(key.to_string(), value.clone());
        self.stage_node(node, data);
        self.ops.push(Op::SetProp {
            id: node,
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    async fn remove_node_property(&mut self, node: NodeId, key: &str) -> Result<(), StoreError> {
        let mut data = self.existing_node(node)?;
        if data.props.remove(key).is_some() {
            self.stage_node(node, data);
            self.ops.push(Op::RemoveProp {
                id: node,
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn add_label(&mut self, node: NodeId, label: &str) -> Result<(), StoreError> {
        let mut data = self.existing_node(node)?;
        if data.labels.insert(label.to_string()) {
            self.stage_node(node, data);
            self.ops.push(Op::AddLabel {
                id: node,
                label: label.to_string(),
            });
        }
        Ok(())
    }

    async fn remove_label(&mut self, node: NodeId, label: &str) -> Result<(), StoreError> {
        let mut data = self.existing_node(node)?;
        if data.labels.remove(label) {
            self.stage_node(node, data);
            self.ops.push(Op::RemoveLabel {
                id: node,
                label: label.to_string(),
            });
        }
        Ok(())
    }

    async fn create_node(&mut self, labels: &[String], props: Props) -> Result<NodeId, StoreError> {
        let id = self.next_id();
        let data = NodeData {
            labels: labels.iter().cloned().collect(),
            props,
        };
        self.stage_node(id, data.clone());
        self.ops.push(Op::CreateNode { id, data });
        Ok(id)
    }

    async fn delete_node(&mut self, node: NodeId) -> Result<(), StoreError> {
        self.existing_node(node)?;
        let attached: Vec<RelId> = self
            .visible_rels()?
            .into_iter()
            .filter(|(_, r)| r.start == node || r.end == node)
            .map(|(id, _)| id)
            .collect();
        for rel in attached {
            self.rels.insert(rel, None);
            self.ops.push(Op::DeleteRel(rel));
        }
        self.nodes.insert(node, None);
        self.ops.push(Op::DeleteNode(node));
        Ok(())
    }

    async fn create_relationship(
        &mut self,
        start: NodeId,
        end: NodeId,
        rel_type: &str,
        props: Props,
    ) -> Result<RelId, StoreError> {
        self.existing_node(start)?;
        self.existing_node(end)?;
        let id = self.next_id();
        let data = RelData {
            rel_type: rel_type.to_string(),
            start,
            end,
            props,
        };
        self.rels.insert(id, Some(data.clone()));
        self.ops.push(Op::CreateRel { id, data });
        Ok(id)
    }

    async fn relationship_property(
        &mut self,
        rel: RelId,
        key: &str,
    ) -> Result<Option<PropertyValue>, StoreError> {
        let data = self.read_rel(rel)?.ok_or(StoreError::RelationshipNotFound(rel))?;
        Ok(data.props.get(key).cloned())
    }

    async fn set_relationship_property(
        &mut self,
        rel: RelId,
        key: &str,
        value: PropertyValue,
    ) -> Result<(), StoreError> {
        let mut data = self.read_rel(rel)?.ok_or(StoreError::RelationshipNotFound(rel))?;
        data.props.insert(key.to_string(), value.clone());
        self.rels.insert(rel, Some(data));
        self.ops.push(Op::SetRelProp {
            id: rel,
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    async fn delete_relationship(&mut self, rel: RelId) -> Result<(), StoreError> {
        self.read_rel(rel)?.ok_or(StoreError::RelationshipNotFound(rel))?;
        self.rels.insert(rel, None);
        self.ops.push(Op::DeleteRel(rel));
        Ok(())
    }

    async fn relationships(
        &mut self,
        node: NodeId,
        rel_type: &str,
        direction: Direction,
    ) -> Result<Vec<Relationship>, StoreError> {
        Ok(self
            .visible_rels()?
            .into_iter()
            .filter(|(_, r)| r.rel_type == rel_type)
            .filter(|(_, r)| match direction {
                Direction::Outgoing => r.start == node,
                Direction::Incoming => r.end == node,
            })
            .map(|(id, r)| Relationship {
                id,
                rel_type: r.rel_type,
                start: r.start,
                end: r.end,
            })
            .collect())
    }

    async fn lock_node(&mut self, node: NodeId) -> Result<(), StoreError> {
        if self.held.contains_key(&node) {
            return Ok(());
        }
        let guard = self.store.lock_handle(node).lock_owned().await;
        self.held.insert(node, guard);
        Ok(())
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        if self.store.is_closed() {
            self.release();
            return Err(StoreError::Closed);
        }
        let ops = std::mem::take(&mut self.ops);
        let batch = {
            let mut graph = self
                .store
                .inner
                .graph
                .write()
                .map_err(|_| StoreError::Decode("memory store lock poisoned".into()))?;
            replay(&mut graph, ops)
        };
        self.release();

        let listeners = match self.store.inner.listeners.read() {
            Ok(l) => l.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for listener in listeners {
            listener.after_commit(&batch);
        }
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), StoreError> {
        self.release();
        Ok(())
    }
}

// --- Commit replay ---

enum Raw {
    NodeCreated(NodeId),
    NodeDeleted(NodeId),
    LabelAssigned(NodeId, String),
    LabelRemoved(NodeId, String),
    PropAssigned(NodeId, String),
    PropRemoved(NodeId, String),
    RelCreated(RelId),
    RelDeleted(RelId),
    RelPropAssigned(RelId, String),
}

/// Applies staged ops to the shared graph and describes what changed.
/// Writes aimed at nodes deleted by a concurrent commit are dropped.
fn replay(graph: &mut Graph, ops: Vec<Op>) -> DeltaBatch {
    let mut raw = Vec::with_capacity(ops.len());
    let mut gone_nodes: HashMap<NodeId, BTreeSet<String>> = HashMap::new();
    let mut gone_rels: HashMap<RelId, RelData> = HashMap::new();

    for op in ops {
        match op {
            Op::CreateNode { id, data } => {
                graph.nodes.insert(id, data);
                raw.push(Raw::NodeCreated(id));
            }
            Op::DeleteNode(id) => {
                if let Some(data) = graph.nodes.remove(&id) {
                    gone_nodes.insert(id, data.labels);
                    raw.push(Raw::NodeDeleted(id));
                }
            }
            Op::SetProp { id, key, value } => match graph.nodes.get_mut(&id) {
                Some(node) => {
                    node.props.insert(key.clone(), value);
                    raw.push(Raw::PropAssigned(id, key));
                }
                None => warn!(node = id, key = %key, "Skipping write to deleted node"),
            },
            Op::RemoveProp { id, key } => {
                if let Some(node) = graph.nodes.get_mut(&id) {
                    if node.props.remove(&key).is_some() {
                        raw.push(Raw::PropRemoved(id, key));
                    }
                }
            }
            Op::AddLabel { id, label } => {
                if let Some(node) = graph.nodes.get_mut(&id) {
                    if node.labels.insert(label.clone()) {
                        raw.push(Raw::LabelAssigned(id, label));
                    }
                }
            }
            Op::RemoveLabel { id, label } => {
                if let Some(node) = graph.nodes.get_mut(&id) {
                    if node.labels.remove(&label) {
                        raw.push(Raw::LabelRemoved(id, label));
                    }
                }
            }
            Op::CreateRel { id, data } => {
                if graph.nodes.contains_key(&data.start) && graph.nodes.contains_key(&data.end) {
                    graph.rels.insert(id, data);
                    raw.push(Raw::RelCreated(id));
                } else {
                    warn!(rel = id, "Skipping relationship to deleted node");
                }
            }
            Op::DeleteRel(id) => {
                if let Some(data) = graph.rels.remove(&id) {
                    gone_rels.insert(id, data);
                    raw.push(Raw::RelDeleted(id));
                }
            }
            Op::SetRelProp { id, key, value } => {
                if let Some(rel) = graph.rels.get_mut(&id) {
                    rel.props.insert(key.clone(), value);
                    raw.push(Raw::RelPropAssigned(id, key));
                }
            }
        }
    }

    let node_ref = |id: NodeId| -> NodeRef {
        let labels = graph
            .nodes
            .get(&id)
            .map(|n| n.labels.clone())
            .or_else(|| gone_nodes.get(&id).cloned())
            .unwrap_or_default();
        NodeRef { id, labels }
    };
    let rel_ref = |id: RelId| -> Option<RelRef> {
        let data = graph.rels.get(&id).or_else(|| gone_rels.get(&id))?;
        Some(RelRef {
            id,
            rel_type: data.rel_type.clone(),
            start: node_ref(data.start),
            end: node_ref(data.end),
        })
    };

    raw.into_iter()
        .filter_map(|r| {
            Some(match r {
                Raw::NodeCreated(id) => GraphDelta::NodeCreated(node_ref(id)),
                Raw::NodeDeleted(id) => GraphDelta::NodeDeleted(node_ref(id)),
                Raw::LabelAssigned(id, label) => GraphDelta::LabelAssigned {
                    node: node_ref(id),
                    label,
                },
                Raw::LabelRemoved(id, label) => GraphDelta::LabelRemoved {
                    node: node_ref(id),
                    label,
                },
                Raw::PropAssigned(id, key) => GraphDelta::NodePropertyAssigned {
                    node: node_ref(id),
                    key,
                },
                Raw::PropRemoved(id, key) => GraphDelta::NodePropertyRemoved {
                    node: node_ref(id),
                    key,
                },
                Raw::RelCreated(id) => GraphDelta::RelationshipCreated(rel_ref(id)?),
                Raw::RelDeleted(id) => GraphDelta::RelationshipDeleted(rel_ref(id)?),
                Raw::RelPropAssigned(id, key) => GraphDelta::RelationshipPropertyAssigned {
                    rel: rel_ref(id)?,
                    key,
                },
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder(StdMutex<Vec<DeltaBatch>>);

    impl CommitListener for Recorder {
        fn after_commit(&self, batch: &DeltaBatch) {
            self.0.lock().unwrap().push(batch.clone());
        }
    }

    fn labels(ls: &[&str]) -> Vec<String> {
        ls.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn reads_see_own_writes_and_commit_publishes() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let mut props = Props::new();
        props.insert("bodyId".into(), 7i64.into());
        let id = tx.create_node(&labels(&["mb6", "Segment"]), props).await.unwrap();
        assert_eq!(
            tx.find_node("Segment", "bodyId", 7i64.into()).await.unwrap(),
            Some(id)
        );

        let mut other = store.begin().await.unwrap();
        assert!(!other.node_exists(id).await.unwrap());
        other.rollback().await.unwrap();

        tx.commit().await.unwrap();
        let mut after = store.begin().await.unwrap();
        assert!(after.node_exists(id).await.unwrap());
    }

    #[tokio::test]
    async fn commit_emits_delta_batch_with_labels() {
        let store = MemoryStore::new();
        let recorder = Arc::new(Recorder::default());
        store.subscribe(recorder.clone());

        let mut tx = store.begin().await.unwrap();
        let a = tx.create_node(&labels(&["mb6", "Segment"]), Props::new()).await.unwrap();
        let b = tx.create_node(&labels(&["mb6", "Segment"]), Props::new()).await.unwrap();
        tx.create_relationship(a, b, "ConnectsTo", Props::new()).await.unwrap();
        tx.set_node_property(a, "name", "KC".into()).await.unwrap();
        tx.commit().await.unwrap();

        let batches = recorder.0.lock().unwrap();
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.len(), 4);
        assert!(batch.iter().any(|d| matches!(d,
            GraphDelta::RelationshipCreated(r) if r.start.id == a && r.end.has_label("Segment"))));
        assert!(batch.iter().any(|d| matches!(d,
            GraphDelta::NodePropertyAssigned { node, key } if node.id == a && key == "name")));
    }

    #[tokio::test]
    async fn delete_node_detaches_relationships() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let a = tx.create_node(&labels(&["A"]), Props::new()).await.unwrap();
        let b = tx.create_node(&labels(&["B"]), Props::new()).await.unwrap();
        let r = tx.create_relationship(a, b, "Contains", Props::new()).await.unwrap();
        tx.commit().await.unwrap();

        let recorder = Arc::new(Recorder::default());
        store.subscribe(recorder.clone());
        let mut tx = store.begin().await.unwrap();
        tx.delete_node(b).await.unwrap();
        assert!(tx.relationships(a, "Contains", Direction::Outgoing).await.unwrap().is_empty());
        tx.commit().await.unwrap();

        let batches = recorder.0.lock().unwrap();
        let deleted = batches[0].deleted_nodes();
        assert!(deleted.contains(&b));
        assert!(batches[0].iter().any(|d| matches!(d,
            GraphDelta::RelationshipDeleted(rel) if rel.id == r && rel.end.has_label("B"))));
    }

    #[tokio::test]
    async fn write_to_concurrently_deleted_node_is_dropped() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let a = tx.create_node(&labels(&["A"]), Props::new()).await.unwrap();
        tx.commit().await.unwrap();

        let mut writer = store.begin().await.unwrap();
        writer.set_node_property(a, "timeStamp", 1i64.into()).await.unwrap();

        let mut deleter = store.begin().await.unwrap();
        deleter.delete_node(a).await.unwrap();
        deleter.commit().await.unwrap();

        writer.commit().await.unwrap();
        assert_eq!(store.node_count(), 0);
    }

    #[tokio::test]
    async fn closed_store_refuses_transactions() {
        let store = MemoryStore::new();
        let tx = store.begin().await.unwrap();
        store.close();
        assert!(matches!(tx.commit().await, Err(StoreError::Closed)));
        assert!(matches!(store.begin().await, Err(StoreError::Closed)));
    }

    #[tokio::test]
    async fn node_lock_is_exclusive_until_commit() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let meta = tx.create_node(&labels(&["Meta"]), Props::new()).await.unwrap();
        tx.commit().await.unwrap();

        let mut first = store.begin().await.unwrap();
        first.lock_node(meta).await.unwrap();

        let contender = store.clone();
        let waiter = tokio::spawn(async move {
            let mut second = contender.begin().await.unwrap();
            second.lock_node(meta).await.unwrap();
            second.commit().await.unwrap();
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        first.commit().await.unwrap();
        waiter.await.unwrap();
    }
}
