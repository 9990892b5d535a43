use thiserror::Error;

use crate::types::{BodyId, Location};

#[derive(Error, Debug)]
pub enum ConnectomeError {
    /// Two bodies claim the same synaptic location. Aborts a load.
    #[error("location {location} is already owned by body {existing}, cannot assign it to body {attempted}")]
    DuplicateLocation {
        location: Location,
        existing: BodyId,
        attempted: BodyId,
    },

    #[error("synapse{} is missing its {field}", describe_location(.location))]
    MalformedSynapse {
        location: Option<Location>,
        field: &'static str,
    },

    #[error("no ConnectionSet {pre} -> {post} in dataset {dataset}")]
    MissingConnectionSet {
        dataset: String,
        pre: BodyId,
        post: BodyId,
    },

    #[error("no Meta node for dataset {0}")]
    MissingPartitionAggregate(String),

    #[error("maintenance task {task_id} failed: {reason}")]
    MaintenanceTask { task_id: uuid::Uuid, reason: String },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

fn describe_location(location: &Option<Location>) -> String {
    location.map(|l| format!(" at {l}")).unwrap_or_default()
}
