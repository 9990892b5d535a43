use std::env;
use std::str::FromStr;

use crate::error::ConnectomeError;

/// Process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Neo4j
    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,

    // Dataset partition
    pub dataset: String,
    pub pre_hp_threshold: f64,
    pub post_hp_threshold: f64,
    pub neuron_threshold: u64,

    // Maintenance pool
    pub maintenance_workers: usize,
    pub maintenance_queue_capacity: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, ConnectomeError> {
        let defaults = LoadOptions::default();
        let engine = EngineConfig::default();
        Ok(Self {
            neo4j_uri: required_env("NEO4J_URI")?,
            neo4j_user: required_env("NEO4J_USER")?,
            neo4j_password: required_env("NEO4J_PASSWORD")?,
            dataset: required_env("DATASET")?,
            pre_hp_threshold: parsed_env("PRE_HP_THRESHOLD", defaults.pre_hp_threshold)?,
            post_hp_threshold: parsed_env("POST_HP_THRESHOLD", defaults.post_hp_threshold)?,
            neuron_threshold: parsed_env("NEURON_THRESHOLD", defaults.neuron_threshold)?,
            maintenance_workers: parsed_env("MAINTENANCE_WORKERS", engine.workers)?,
            maintenance_queue_capacity: parsed_env(
                "MAINTENANCE_QUEUE_CAPACITY",
                engine.queue_capacity,
            )?,
        })
    }

    /// Log the effective configuration. The password is never printed.
    pub fn log_redacted(&self) {
        tracing::info!(
            neo4j_uri = %self.neo4j_uri,
            neo4j_user = %self.neo4j_user,
            dataset = %self.dataset,
            pre_hp_threshold = self.pre_hp_threshold,
            post_hp_threshold = self.post_hp_threshold,
            neuron_threshold = self.neuron_threshold,
            maintenance_workers = self.maintenance_workers,
            maintenance_queue_capacity = self.maintenance_queue_capacity,
            "Loaded configuration"
        );
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            workers: self.maintenance_workers,
            queue_capacity: self.maintenance_queue_capacity,
        }
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            dataset: self.dataset.clone(),
            pre_hp_threshold: self.pre_hp_threshold,
            post_hp_threshold: self.post_hp_threshold,
            neuron_threshold: self.neuron_threshold,
            super_rois: Default::default(),
        }
    }
}

/// Sizing of the background maintenance pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            queue_capacity: 1024,
        }
    }
}

/// Parameters of one bulk load into a dataset partition.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadOptions {
    pub dataset: String,
    pub pre_hp_threshold: f64,
    pub post_hp_threshold: f64,
    pub neuron_threshold: u64,
    /// Top-level ROIs used for cluster names. Empty means every ROI counts.
    pub super_rois: std::collections::BTreeSet<String>,
}

impl LoadOptions {
    pub fn new(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            ..Self::default()
        }
    }

    pub fn with_thresholds(mut self, pre_hp: f64, post_hp: f64) -> Self {
        self.pre_hp_threshold = pre_hp;
        self.post_hp_threshold = post_hp;
        self
    }
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            dataset: String::new(),
            pre_hp_threshold: 0.0,
            post_hp_threshold: 0.0,
            neuron_threshold: 10,
            super_rois: Default::default(),
        }
    }
}

fn required_env(key: &str) -> Result<String, ConnectomeError> {
    env::var(key).map_err(|_| ConnectomeError::Config(format!("{key} environment variable is required")))
}

fn parsed_env<T>(key: &str, default: T) -> Result<T, ConnectomeError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConnectomeError::Config(format!("{key} must be a number, got {raw:?}: {e}"))),
        Err(_) => Ok(default),
    }
}
