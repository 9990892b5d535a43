use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use connectome_common::{Body, Config};
use connectome_graph::{migrate::migrate, Engine, GraphClient, Neo4jStore, SystemClock};

/// Connection settings, dataset and thresholds come from the environment
/// (`NEO4J_URI`, `NEO4J_USER`, `NEO4J_PASSWORD`, `DATASET`, ...), see
/// [`Config::from_env`].
#[derive(Parser)]
#[command(name = "connectome-loader", about = "Load a synapse JSON file into a Neo4j connectome")]
struct Cli {
    /// Synapse list: a JSON array of bodies with their synapse sets
    synapses: PathBuf,

    /// Top-level ROIs used for cluster names (comma separated)
    #[arg(long, value_delimiter = ',')]
    super_rois: Vec<String>,

    /// Skip constraint and index creation
    #[arg(long)]
    skip_migrate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("connectome=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    config.log_redacted();

    let mut options = config.load_options();
    options.super_rois = cli.super_rois.iter().cloned().collect::<BTreeSet<_>>();

    info!(file = %cli.synapses.display(), dataset = %options.dataset, "Connectome loader starting...");

    let raw = std::fs::read_to_string(&cli.synapses)
        .with_context(|| format!("reading {}", cli.synapses.display()))?;
    let bodies: Vec<Body> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing synapse list {}", cli.synapses.display()))?;
    info!(bodies = bodies.len(), "Synapse list parsed");

    let client = GraphClient::from_config(&config).await?;
    if !cli.skip_migrate {
        migrate(&client).await?;
    }

    let engine = Engine::start(Neo4jStore::new(client), Arc::new(SystemClock), config.engine()).await?;
    let summary = engine.load(&bodies, &options).await;
    engine.shutdown().await;
    let summary = summary?;

    info!(
        dataset = %summary.dataset,
        segments = summary.segments,
        neurons = summary.neurons,
        synapses = summary.synapses,
        connection_sets = summary.connection_sets,
        unresolved = summary.unresolved,
        "Load complete"
    );
    if let Some(meta) = &summary.meta {
        println!("\n=== {} ===", meta.dataset);
        println!("Pre: {}  |  Post: {}", meta.total_pre, meta.total_post);
        println!("ROIs: {}", meta.roi_info.len());
        if meta.malformed > 0 {
            println!("Malformed synapses excluded: {}", meta.malformed);
        }
    }

    Ok(())
}
