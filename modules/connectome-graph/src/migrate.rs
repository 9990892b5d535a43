use neo4rs::query;
use tracing::{info, warn};

use crate::GraphClient;

/// Idempotent schema setup: the Meta uniqueness constraint and the lookup
/// indexes used by the loader and the maintainer.
pub async fn migrate(client: &GraphClient) -> Result<(), neo4rs::Error> {
    let g = &client.graph;

    info!("Running schema migrations...");

    let constraints = [
        "CREATE CONSTRAINT meta_dataset IF NOT EXISTS FOR (n:Meta) REQUIRE n.dataset IS UNIQUE",
    ];
    for c in &constraints {
        run_ignoring_exists(g, c).await?;
    }
    info!("Uniqueness constraints created");

    let indexes = [
        "CREATE INDEX segment_body_id IF NOT EXISTS FOR (n:Segment) ON (n.bodyId)",
        "CREATE INDEX synapse_location IF NOT EXISTS FOR (n:Synapse) ON (n.location)",
        "CREATE INDEX connection_set_key IF NOT EXISTS FOR (n:ConnectionSet) ON (n.datasetBodyIds)",
    ];
    for idx in &indexes {
        run_ignoring_exists(g, idx).await?;
    }
    info!("Property indexes created");

    Ok(())
}

async fn run_ignoring_exists(g: &neo4rs::Graph, cypher: &str) -> Result<(), neo4rs::Error> {
    match g.run(query(cypher)).await {
        Ok(_) => Ok(()),
        Err(e) => {
            let msg = e.to_string().to_lowercase();
            if msg.contains("already exists") || msg.contains("equivalent") {
                warn!("Already exists (skipped): {}", cypher.chars().take(80).collect::<String>());
                Ok(())
            } else {
                Err(e)
            }
        }
    }
}
