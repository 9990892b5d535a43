use neo4rs::{ConfigBuilder, Graph};

use connectome_common::Config;

/// Connection handle for the Neo4j server holding the connectome.
#[derive(Clone)]
pub struct GraphClient {
    pub(crate) graph: Graph,
}

impl GraphClient {
    pub async fn connect(uri: &str, user: &str, password: &str) -> Result<Self, neo4rs::Error> {
        let config = ConfigBuilder::default()
            .uri(uri)
            .user(user)
            .password(password)
            .fetch_size(500)
            .max_connections(10)
            .build()?;
        let graph = Graph::connect(config).await?;
        Ok(Self { graph })
    }

    pub async fn from_config(config: &Config) -> Result<Self, neo4rs::Error> {
        Self::connect(&config.neo4j_uri, &config.neo4j_user, &config.neo4j_password).await
    }

    pub fn inner(&self) -> &Graph {
        &self.graph
    }
}
