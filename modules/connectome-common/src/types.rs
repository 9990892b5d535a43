use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConnectomeError;

// --- Location ---

/// Integer 3D location of a synaptic density. Canonical key is `"x:y:z"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "[i64; 3]", into = "[i64; 3]")]
pub struct Location {
    pub x: i64,
    pub y: i64,
    pub z: i64,
}

impl Location {
    pub const fn new(x: i64, y: i64, z: i64) -> Self {
        Self { x, y, z }
    }

    /// The `"x:y:z"` key used for the `location` property and index lookups.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl From<[i64; 3]> for Location {
    fn from([x, y, z]: [i64; 3]) -> Self {
        Self { x, y, z }
    }
}

impl From<Location> for [i64; 3] {
    fn from(l: Location) -> Self {
        [l.x, l.y, l.z]
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.x, self.y, self.z)
    }
}

impl FromStr for Location {
    type Err = ConnectomeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 {
            return Err(ConnectomeError::Validation(format!(
                "location key must look like x:y:z, got {s}"
            )));
        }
        let parse = |p: &str| {
            p.trim()
                .parse::<i64>()
                .map_err(|e| ConnectomeError::Validation(format!("bad coordinate {p:?} in {s}: {e}")))
        };
        Ok(Self {
            x: parse(parts[0])?,
            y: parse(parts[1])?,
            z: parse(parts[2])?,
        })
    }
}

// --- Synapses ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SynapseKind {
    Pre,
    Post,
}

impl SynapseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SynapseKind::Pre => "pre",
            SynapseKind::Post => "post",
        }
    }

    /// Parses the `type` property stored on synapse nodes. Anything other
    /// than `pre`/`post` is treated as missing.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pre" => Some(SynapseKind::Pre),
            "post" => Some(SynapseKind::Post),
            _ => None,
        }
    }
}

impl fmt::Display for SynapseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pre- or post-synaptic density owned by exactly one body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Synapse {
    #[serde(rename = "Type")]
    pub kind: SynapseKind,
    #[serde(rename = "Location")]
    pub location: Location,
    #[serde(rename = "Confidence", default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub rois: BTreeSet<String>,
    /// Partner terminals. For a pre-synapse these are the post-synaptic
    /// locations it connects to; repeats are meaningful and kept.
    #[serde(rename = "ConnectsTo", default, skip_serializing_if = "Vec::is_empty")]
    pub partners: Vec<Location>,
}

impl Synapse {
    pub fn pre(location: Location, confidence: f64) -> Self {
        Self {
            kind: SynapseKind::Pre,
            location,
            confidence: Some(confidence),
            rois: BTreeSet::new(),
            partners: Vec::new(),
        }
    }

    pub fn post(location: Location, confidence: f64) -> Self {
        Self {
            kind: SynapseKind::Post,
            ..Self::pre(location, confidence)
        }
    }

    pub fn with_rois<I, S>(mut self, rois: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rois.extend(rois.into_iter().map(Into::into));
        self
    }

    pub fn with_partners<I: IntoIterator<Item = Location>>(mut self, partners: I) -> Self {
        self.partners.extend(partners);
        self
    }

    pub fn is_pre(&self) -> bool {
        self.kind == SynapseKind::Pre
    }

    pub fn is_post(&self) -> bool {
        self.kind == SynapseKind::Post
    }
}

/// Read-only view of what the ROI fold needs from a synapse. Implemented by
/// the input model and by synapse records read back from the store, where
/// either field may be missing.
pub trait RoiTagged {
    fn kind(&self) -> Option<SynapseKind>;
    fn confidence(&self) -> Option<f64>;
    fn rois(&self) -> &BTreeSet<String>;
    fn location(&self) -> Option<Location> {
        None
    }
}

impl RoiTagged for Synapse {
    fn kind(&self) -> Option<SynapseKind> {
        Some(self.kind)
    }

    fn confidence(&self) -> Option<f64> {
        self.confidence
    }

    fn rois(&self) -> &BTreeSet<String> {
        &self.rois
    }

    fn location(&self) -> Option<Location> {
        Some(self.location)
    }
}

// --- Bodies ---

/// Opaque body identifier. Numeric in every shipped dataset, but string ids
/// are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BodyId {
    Numeric(i64),
    Named(String),
}

impl fmt::Display for BodyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodyId::Numeric(n) => write!(f, "{n}"),
            BodyId::Named(s) => f.write_str(s),
        }
    }
}

impl From<i64> for BodyId {
    fn from(n: i64) -> Self {
        BodyId::Numeric(n)
    }
}

impl From<i32> for BodyId {
    fn from(n: i32) -> Self {
        BodyId::Numeric(i64::from(n))
    }
}

impl From<String> for BodyId {
    fn from(s: String) -> Self {
        BodyId::Named(s)
    }
}

impl From<&str> for BodyId {
    fn from(s: &str) -> Self {
        BodyId::Named(s.to_string())
    }
}

/// Optional neuron annotations. Missing is a visible state, never a sentinel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NeuronAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub cell_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// A neuronal body and the synapses it exclusively owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "BodyRecord")]
pub struct Body {
    #[serde(rename = "BodyId")]
    pub id: BodyId,
    #[serde(rename = "SynapseSet")]
    synapses: Vec<Synapse>,
    #[serde(flatten)]
    pub attributes: NeuronAttributes,
}

#[derive(Deserialize)]
struct BodyRecord {
    #[serde(rename = "BodyId")]
    id: BodyId,
    #[serde(rename = "SynapseSet", default)]
    synapses: Vec<Synapse>,
    #[serde(flatten)]
    attributes: NeuronAttributes,
}

impl From<BodyRecord> for Body {
    fn from(r: BodyRecord) -> Self {
        Body::new(r.id, r.synapses).with_attributes(r.attributes)
    }
}

impl Body {
    /// Builds a body, keeping the first occurrence of each (kind, location)
    /// pair so the synapse set stays ordered and unique.
    pub fn new(id: impl Into<BodyId>, synapses: impl IntoIterator<Item = Synapse>) -> Self {
        let mut seen: HashSet<(SynapseKind, Location)> = HashSet::new();
        let synapses = synapses
            .into_iter()
            .filter(|s| seen.insert((s.kind, s.location)))
            .collect();
        Self {
            id: id.into(),
            synapses,
            attributes: NeuronAttributes::default(),
        }
    }

    pub fn with_attributes(mut self, attributes: NeuronAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn synapses(&self) -> &[Synapse] {
        &self.synapses
    }

    pub fn pre_synapses(&self) -> impl Iterator<Item = &Synapse> {
        self.synapses.iter().filter(|s| s.is_pre())
    }

    pub fn post_synapses(&self) -> impl Iterator<Item = &Synapse> {
        self.synapses.iter().filter(|s| s.is_post())
    }

    pub fn pre_count(&self) -> usize {
        self.pre_synapses().count()
    }

    pub fn post_count(&self) -> usize {
        self.post_synapses().count()
    }

    /// Every ROI touched by any of this body's synapses, sorted.
    pub fn rois(&self) -> BTreeSet<String> {
        self.synapses.iter().flat_map(|s| s.rois.iter().cloned()).collect()
    }
}
