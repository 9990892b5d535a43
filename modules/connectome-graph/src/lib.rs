pub mod classifier;
pub mod client;
pub mod clock;
pub mod connectivity;
pub mod delta;
pub mod engine;
pub mod loader;
pub mod location_index;
pub mod maintainer;
pub mod memory;
pub mod migrate;
pub mod neo4j;
pub mod procedures;
pub mod scheduler;
pub mod schema;
pub mod store;

#[cfg(feature = "test-utils")]
pub mod testutil;

pub use classifier::{Classification, DeltaClassifier};
pub use client::GraphClient;
pub use clock::{Clock, FixedClock, SystemClock};
pub use connectivity::{
    resolve_connectivity, BodyConnectivity, ConnectionSet, ConnectionSetStats, ConnectivityReport,
    ConnectivityResolver, UnresolvedPartner,
};
pub use delta::{DeltaBatch, GraphDelta, NodeRef, RelRef};
pub use engine::Engine;
pub use loader::{load_connectome, LoadSummary};
pub use location_index::LocationIndex;
pub use maintainer::{AggregateMaintainer, MaintenanceReport, MaintenanceTask, MetaAggregate};
pub use memory::{MemoryStore, MemoryTxn};
pub use neo4j::{Neo4jStore, Neo4jTxn};
pub use procedures::{remove_synapse_from_connection_set, set_connection_set_roi_info_and_weight_hp};
pub use scheduler::{RejectReason, SchedulerStats, TriggerOutcome, TriggerScheduler};
pub use store::{
    CommitListener, Direction, GraphStore, NodeId, PropertyValue, Props, RelId, Relationship,
    StoreError, StoreTxn, SynapseRecord,
};
