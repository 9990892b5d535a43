//! [`GraphStore`] over a Neo4j server.
//!
//! Neo4j publishes no post-commit delta stream to Bolt clients, so this
//! store does not drive the trigger path on its own: it serves the bulk
//! loader, the ConnectionSet procedure and maintenance tasks.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use neo4rs::{query, BoltNull, BoltType, Node, Query, Row, Txn};

use crate::client::GraphClient;
use crate::schema::prop;
use crate::store::{
    Direction, GraphStore, NodeId, PropertyValue, Props, RelId, Relationship, StoreError,
    StoreTxn, SynapseRecord,
};

#[derive(Clone)]
pub struct Neo4jStore {
    client: GraphClient,
}

impl Neo4jStore {
    pub fn new(client: GraphClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &GraphClient {
        &self.client
    }
}

#[async_trait]
impl GraphStore for Neo4jStore {
    type Txn = Neo4jTxn;

    async fn begin(&self) -> Result<Neo4jTxn, StoreError> {
        let txn = self.client.graph.start_txn().await?;
        Ok(Neo4jTxn { txn })
    }
}

pub struct Neo4jTxn {
    txn: Txn,
}

impl From<PropertyValue> for BoltType {
    fn from(v: PropertyValue) -> Self {
        match v {
            PropertyValue::Bool(b) => b.into(),
            PropertyValue::Int(n) => n.into(),
            PropertyValue::Float(f) => f.into(),
            PropertyValue::Str(s) => s.into(),
            PropertyValue::StrList(l) => l.into(),
            PropertyValue::DateTime(t) => t.into(),
        }
    }
}

/// Labels and relationship types are spliced into Cypher, so they are
/// backtick-quoted with embedded backticks doubled.
fn quoted(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn label_clause(labels: &[String]) -> String {
    labels.iter().map(|l| format!(":{}", quoted(l))).collect()
}

/// Parameter for `SET n += $props`. A null value removes the key.
fn bolt_map(props: impl IntoIterator<Item = (String, Option<PropertyValue>)>) -> BoltType {
    let map: HashMap<String, BoltType> = props
        .into_iter()
        .map(|(k, v)| (k, v.map(BoltType::from).unwrap_or(BoltType::Null(BoltNull))))
        .collect();
    map.into()
}

fn decode_property(node: &Node, key: &str) -> Option<PropertyValue> {
    if let Ok(b) = node.get::<bool>(key) {
        return Some(PropertyValue::Bool(b));
    }
    if let Ok(n) = node.get::<i64>(key) {
        return Some(PropertyValue::Int(n));
    }
    if let Ok(f) = node.get::<f64>(key) {
        return Some(PropertyValue::Float(f));
    }
    if let Ok(t) = node.get::<NaiveDateTime>(key) {
        return Some(PropertyValue::DateTime(t));
    }
    if let Ok(s) = node.get::<String>(key) {
        return Some(PropertyValue::Str(s));
    }
    node.get::<Vec<String>>(key).ok().map(PropertyValue::StrList)
}

impl Neo4jTxn {
    async fn rows(&mut self, q: Query) -> Result<Vec<Row>, StoreError> {
        let mut stream = self.txn.execute(q).await?;
        let mut rows = Vec::new();
        while let Some(row) = stream.next(self.txn.handle()).await? {
            rows.push(row);
        }
        Ok(rows)
    }

    async fn first(&mut self, q: Query) -> Result<Option<Row>, StoreError> {
        Ok(self.rows(q).await?.into_iter().next())
    }

    async fn node(&mut self, id: NodeId) -> Result<Node, StoreError> {
        let row = self
            .first(query("MATCH (n) WHERE id(n) = $id RETURN n").param("id", id))
            .await?
            .ok_or(StoreError::NodeNotFound(id))?;
        row.get::<Node>("n")
            .map_err(|e| StoreError::Decode(format!("node {id}: {e}")))
    }

    async fn returned_id(&mut self, q: Query, missing: StoreError) -> Result<i64, StoreError> {
        let row = self.first(q).await?.ok_or(missing)?;
        row.get::<i64>("id")
            .map_err(|e| StoreError::Decode(format!("id: {e}")))
    }
}

#[async_trait]
impl StoreTxn for Neo4jTxn {
    async fn find_node(
        &mut self,
        label: &str,
        key: &str,
        value: PropertyValue,
    ) -> Result<Option<NodeId>, StoreError> {
        let cypher = format!(
            "MATCH (n:{}) WHERE n[$key] = $value RETURN id(n) AS id LIMIT 1",
            quoted(label)
        );
        let q = query(&cypher).param("key", key).param("value", BoltType::from(value));
        match self.first(q).await? {
            Some(row) => Ok(Some(
                row.get::<i64>("id")
                    .map_err(|e| StoreError::Decode(format!("id: {e}")))?,
            )),
            None => Ok(None),
        }
    }

    async fn nodes_with_label(&mut self, label: &str) -> Result<Vec<NodeId>, StoreError> {
        let cypher = format!("MATCH (n:{}) RETURN id(n) AS id ORDER BY id", quoted(label));
        self.rows(query(&cypher))
            .await?
            .into_iter()
            .map(|row| {
                row.get::<i64>("id")
                    .map_err(|e| StoreError::Decode(format!("id: {e}")))
            })
            .collect()
    }

    async fn node_exists(&mut self, node: NodeId) -> Result<bool, StoreError> {
        let q = query("MATCH (n) WHERE id(n) = $id RETURN id(n) AS id").param("id", node);
        Ok(self.first(q).await?.is_some())
    }

    async fn node_labels(&mut self, node: NodeId) -> Result<BTreeSet<String>, StoreError> {
        let n = self.node(node).await?;
        Ok(n.labels().into_iter().map(str::to_string).collect())
    }

    async fn node_properties(&mut self, node: NodeId) -> Result<Props, StoreError> {
        let n = self.node(node).await?;
        Ok(n.keys()
            .into_iter()
            .filter_map(|k| decode_property(&n, k).map(|v| (k.to_string(), v)))
            .collect())
    }

    async fn set_node_property(
        &mut self,
        node: NodeId,
        key: &str,
        value: PropertyValue,
    ) -> Result<(), StoreError> {
        let q = query("MATCH (n) WHERE id(n) = $id SET n += $props RETURN id(n) AS id")
            .param("id", node)
            .param("props", bolt_map([(key.to_string(), Some(value))]));
        self.returned_id(q, StoreError::NodeNotFound(node)).await?;
        Ok(())
    }

    async fn remove_node_property(&mut self, node: NodeId, key: &str) -> Result<(), StoreError> {
        let q = query("MATCH (n) WHERE id(n) = $id SET n += $props RETURN id(n) AS id")
            .param("id", node)
            .param("props", bolt_map([(key.to_string(), None)]));
        self.returned_id(q, StoreError::NodeNotFound(node)).await?;
        Ok(())
    }

    async fn add_label(&mut self, node: NodeId, label: &str) -> Result<(), StoreError> {
        let cypher = format!(
            "MATCH (n) WHERE id(n) = $id SET n:{} RETURN id(n) AS id",
            quoted(label)
        );
        self.returned_id(query(&cypher).param("id", node), StoreError::NodeNotFound(node))
            .await?;
        Ok(())
    }

    async fn remove_label(&mut self, node: NodeId, label: &str) -> Result<(), StoreError> {
        let cypher = format!(
            "MATCH (n) WHERE id(n) = $id REMOVE n:{} RETURN id(n) AS id",
            quoted(label)
        );
        self.returned_id(query(&cypher).param("id", node), StoreError::NodeNotFound(node))
            .await?;
        Ok(())
    }

    async fn create_node(&mut self, labels: &[String], props: Props) -> Result<NodeId, StoreError> {
        let cypher = format!(
            "CREATE (n{}) SET n += $props RETURN id(n) AS id",
            label_clause(labels)
        );
        let q = query(&cypher).param("props", bolt_map(props.into_iter().map(|(k, v)| (k, Some(v)))));
        self.returned_id(q, StoreError::Decode("CREATE returned no row".into()))
            .await
    }

    async fn delete_node(&mut self, node: NodeId) -> Result<(), StoreError> {
        let q = query("MATCH (n) WHERE id(n) = $id DETACH DELETE n RETURN $id AS id").param("id", node);
        self.returned_id(q, StoreError::NodeNotFound(node)).await?;
        Ok(())
    }

    async fn create_relationship(
        &mut self,
        start: NodeId,
        end: NodeId,
        rel_type: &str,
        props: Props,
    ) -> Result<RelId, StoreError> {
        let cypher = format!(
            "MATCH (a), (b) WHERE id(a) = $start AND id(b) = $end \
             CREATE (a)-[r:{}]->(b) SET r += $props RETURN id(r) AS id",
            quoted(rel_type)
        );
        let q = query(&cypher)
            .param("start", start)
            .param("end", end)
            .param("props", bolt_map(props.into_iter().map(|(k, v)| (k, Some(v)))));
        self.returned_id(q, StoreError::NodeNotFound(start)).await
    }

    async fn relationship_property(
        &mut self,
        rel: RelId,
        key: &str,
    ) -> Result<Option<PropertyValue>, StoreError> {
        let q = query("MATCH ()-[r]->() WHERE id(r) = $id RETURN r[$key] AS v, id(r) AS id")
            .param("id", rel)
            .param("key", key);
        let row = self
            .first(q)
            .await?
            .ok_or(StoreError::RelationshipNotFound(rel))?;
        if let Ok(n) = row.get::<i64>("v") {
            return Ok(Some(PropertyValue::Int(n)));
        }
        if let Ok(f) = row.get::<f64>("v") {
            return Ok(Some(PropertyValue::Float(f)));
        }
        Ok(row.get::<String>("v").ok().map(PropertyValue::Str))
    }

    async fn set_relationship_property(
        &mut self,
        rel: RelId,
        key: &str,
        value: PropertyValue,
    ) -> Result<(), StoreError> {
        let q = query("MATCH ()-[r]->() WHERE id(r) = $id SET r += $props RETURN id(r) AS id")
            .param("id", rel)
            .param("props", bolt_map([(key.to_string(), Some(value))]));
        self.returned_id(q, StoreError::RelationshipNotFound(rel)).await?;
        Ok(())
    }

    async fn delete_relationship(&mut self, rel: RelId) -> Result<(), StoreError> {
        let q = query("MATCH ()-[r]->() WHERE id(r) = $id DELETE r RETURN $id AS id").param("id", rel);
        self.returned_id(q, StoreError::RelationshipNotFound(rel)).await?;
        Ok(())
    }

    async fn relationships(
        &mut self,
        node: NodeId,
        rel_type: &str,
        direction: Direction,
    ) -> Result<Vec<Relationship>, StoreError> {
        let pattern = match direction {
            Direction::Outgoing => format!("(n)-[r:{}]->(m)", quoted(rel_type)),
            Direction::Incoming => format!("(n)<-[r:{}]-(m)", quoted(rel_type)),
        };
        let cypher = format!(
            "MATCH {pattern} WHERE id(n) = $id \
             RETURN id(r) AS id, id(startNode(r)) AS start, id(endNode(r)) AS end ORDER BY id"
        );
        let decode = |row: &Row, k: &str| {
            row.get::<i64>(k)
                .map_err(|e| StoreError::Decode(format!("{k}: {e}")))
        };
        self.rows(query(&cypher).param("id", node))
            .await?
            .iter()
            .map(|row| {
                Ok(Relationship {
                    id: decode(row, "id")?,
                    rel_type: rel_type.to_string(),
                    start: decode(row, "start")?,
                    end: decode(row, "end")?,
                })
            })
            .collect()
    }

    /// Writing a throwaway property takes Neo4j's exclusive node lock for
    /// the rest of the transaction.
    async fn lock_node(&mut self, node: NodeId) -> Result<(), StoreError> {
        let q = query("MATCH (n) WHERE id(n) = $id SET n._lock = true REMOVE n._lock RETURN id(n) AS id")
            .param("id", node);
        self.returned_id(q, StoreError::NodeNotFound(node)).await?;
        Ok(())
    }

    async fn synapses_in_partition(
        &mut self,
        dataset: &str,
    ) -> Result<Vec<SynapseRecord>, StoreError> {
        let cypher = format!(
            "MATCH (s:Synapse:{}) \
             RETURN id(s) AS id, labels(s) AS labels, s.type AS type, \
                    s.confidence AS confidence, s.location AS location, \
                    [k IN keys(s) WHERE s[k] = true] AS rois",
            quoted(dataset)
        );
        let rows = self.rows(query(&cypher)).await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let node = row
                .get::<i64>("id")
                .map_err(|e| StoreError::Decode(format!("id: {e}")))?;
            let labels: BTreeSet<String> = row
                .get::<Vec<String>>("labels")
                .unwrap_or_default()
                .into_iter()
                .collect();
            // Only the keys the record reads; ROI flags are already filtered.
            let mut props = Props::new();
            if let Ok(kind) = row.get::<String>("type") {
                props.insert(prop::TYPE.to_string(), kind.into());
            }
            if let Ok(confidence) = row.get::<f64>("confidence") {
                props.insert(prop::CONFIDENCE.to_string(), confidence.into());
            }
            if let Ok(location) = row.get::<String>("location") {
                props.insert(prop::LOCATION.to_string(), location.into());
            }
            for roi in row.get::<Vec<String>>("rois").unwrap_or_default() {
                props.insert(roi, PropertyValue::Bool(true));
            }
            records.push(SynapseRecord::from_node(node, &labels, &props));
        }
        Ok(records)
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.txn.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.txn.rollback().await?;
        Ok(())
    }
}
