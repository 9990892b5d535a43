//! Neo4j container for integration tests.

use testcontainers::{
    core::{ContainerPort, WaitFor},
    runners::AsyncRunner,
    ContainerAsync, GenericImage, ImageExt,
};

use crate::GraphClient;
use connectome_common::{Body, Location, Synapse};

/// Start a Neo4j container and connect to it.
///
/// The container stops when the returned handle is dropped, so keep it
/// alive for the whole test.
pub async fn neo4j_container() -> (ContainerAsync<GenericImage>, GraphClient) {
    let image = GenericImage::new("neo4j", "5.25.1-community")
        .with_exposed_port(ContainerPort::Tcp(7687))
        .with_wait_for(WaitFor::message_on_stdout("Started."))
        .with_env_var("NEO4J_AUTH", "neo4j/connectome-test");

    let container: ContainerAsync<GenericImage> = image
        .start()
        .await
        .expect("Failed to start Neo4j container");

    let host_port = container
        .get_host_port_ipv4(7687)
        .await
        .expect("Failed to get Neo4j host port");

    let uri = format!("bolt://127.0.0.1:{host_port}");
    let client = GraphClient::connect(&uri, "neo4j", "connectome-test")
        .await
        .expect("Failed to connect to Neo4j");

    (container, client)
}

/// Two bodies joined by one synapse pair, the smallest complete connectome.
pub fn two_body_fixture() -> Vec<Body> {
    vec![
        Body::new(
            8426959,
            vec![Synapse::pre(Location::new(4287, 2277, 1542), 1.0)
                .with_rois(["seven_column_roi", "distal"])
                .with_partners([Location::new(4298, 2294, 1542)])],
        ),
        Body::new(
            26311,
            vec![Synapse::post(Location::new(4298, 2294, 1542), 0.88)
                .with_rois(["seven_column_roi", "distal"])],
        ),
    ]
}

