//! Per-ROI synapse counters with high-precision (HP) sub-counts.
//!
//! `RoiInfo` is what ends up in every `roiInfo` property: on bodies, on
//! ConnectionSets and on the partition's Meta node. Keys serialize in
//! lexicographic order and each value serializes as
//! `{"preHP":_,"postHP":_,"pre":_,"post":_}`. Snapshots are diffed by
//! consumers, so neither ordering may change.

use std::collections::btree_map::{self, BTreeMap};
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::ConnectomeError;
use crate::types::{Body, RoiTagged, SynapseKind};

/// Counters for one ROI. Field order is the serialized key order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoiCounts {
    #[serde(rename = "preHP", default)]
    pub pre_hp: u64,
    #[serde(rename = "postHP", default)]
    pub post_hp: u64,
    #[serde(default)]
    pub pre: u64,
    #[serde(default)]
    pub post: u64,
}

impl RoiCounts {
    pub fn is_empty(&self) -> bool {
        self.pre == 0 && self.post == 0 && self.pre_hp == 0 && self.post_hp == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoiInfo {
    counts: BTreeMap<String, RoiCounts>,
}

impl RoiInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a serialized `roiInfo` property. Missing counters default to 0.
    pub fn from_json(s: &str) -> Result<Self, ConnectomeError> {
        serde_json::from_str(s)
            .map_err(|e| ConnectomeError::Validation(format!("invalid roiInfo JSON: {e}")))
    }

    pub fn to_json(&self) -> String {
        // A map of string keys to plain integer structs cannot fail to serialize.
        serde_json::to_string(&self.counts).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn get(&self, roi: &str) -> Option<&RoiCounts> {
        self.counts.get(roi)
    }

    pub fn rois(&self) -> impl Iterator<Item = &str> {
        self.counts.keys().map(String::as_str)
    }

    pub fn roi_set(&self) -> BTreeSet<String> {
        self.counts.keys().cloned().collect()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, RoiCounts> {
        self.counts.iter()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Overwrite the counters for one ROI.
    pub fn set(&mut self, roi: impl Into<String>, counts: RoiCounts) {
        self.counts.insert(roi.into(), counts);
    }

    pub fn increment_pre(&mut self, roi: &str) {
        self.entry(roi).pre += 1;
    }

    pub fn increment_post(&mut self, roi: &str) {
        self.entry(roi).post += 1;
    }

    pub fn increment_pre_hp(&mut self, roi: &str) {
        self.entry(roi).pre_hp += 1;
    }

    pub fn increment_post_hp(&mut self, roi: &str) {
        self.entry(roi).post_hp += 1;
    }

    pub fn decrement_pre(&mut self, roi: &str) {
        self.decrement(roi, |c| &mut c.pre);
    }

    pub fn decrement_post(&mut self, roi: &str) {
        self.decrement(roi, |c| &mut c.post);
    }

    pub fn decrement_pre_hp(&mut self, roi: &str) {
        self.decrement(roi, |c| &mut c.pre_hp);
    }

    pub fn decrement_post_hp(&mut self, roi: &str) {
        self.decrement(roi, |c| &mut c.post_hp);
    }

    /// Add every counter of `other` into this map.
    pub fn merge(&mut self, other: &RoiInfo) {
        for (roi, c) in &other.counts {
            let e = self.entry(roi);
            e.pre += c.pre;
            e.post += c.post;
            e.pre_hp += c.pre_hp;
            e.post_hp += c.post_hp;
        }
    }

    fn entry(&mut self, roi: &str) -> &mut RoiCounts {
        self.counts.entry(roi.to_string()).or_default()
    }

    // Clamps at zero and drops the ROI once all four counters are zero, so
    // an increment followed by its decrement restores the previous map.
    fn decrement(&mut self, roi: &str, field: impl FnOnce(&mut RoiCounts) -> &mut u64) {
        let Some(counts) = self.counts.get_mut(roi) else {
            return;
        };
        let slot = field(counts);
        *slot = slot.saturating_sub(1);
        if counts.is_empty() {
            self.counts.remove(roi);
        }
    }
}

// --- Folding synapses into counters ---

/// Which counters a synapse contributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Folded {
    pub kind: SynapseKind,
    pub high_precision: bool,
}

/// Fold one synapse into `counters`.
///
/// Every ROI of the synapse gets its base count for the synapse's direction;
/// the HP count is added too when the confidence strictly exceeds the
/// direction's threshold. A synapse without a direction or a confidence
/// contributes nothing and is reported as `MalformedSynapse`.
pub fn fold_synapse_into_roi_counters<S: RoiTagged + ?Sized>(
    counters: &mut RoiInfo,
    synapse: &S,
    pre_hp_threshold: f64,
    post_hp_threshold: f64,
) -> Result<Folded, ConnectomeError> {
    let (kind, high_precision) = classify(synapse, pre_hp_threshold, post_hp_threshold)?;
    for roi in synapse.rois() {
        match kind {
            SynapseKind::Pre => {
                counters.increment_pre(roi);
                if high_precision {
                    counters.increment_pre_hp(roi);
                }
            }
            SynapseKind::Post => {
                counters.increment_post(roi);
                if high_precision {
                    counters.increment_post_hp(roi);
                }
            }
        }
    }
    Ok(Folded {
        kind,
        high_precision,
    })
}

/// Inverse of [`fold_synapse_into_roi_counters`], used when a synapse leaves
/// an aggregate.
pub fn remove_synapse_from_roi_counters<S: RoiTagged + ?Sized>(
    counters: &mut RoiInfo,
    synapse: &S,
    pre_hp_threshold: f64,
    post_hp_threshold: f64,
) -> Result<Folded, ConnectomeError> {
    let (kind, high_precision) = classify(synapse, pre_hp_threshold, post_hp_threshold)?;
    for roi in synapse.rois() {
        match kind {
            SynapseKind::Pre => {
                if high_precision {
                    counters.decrement_pre_hp(roi);
                }
                counters.decrement_pre(roi);
            }
            SynapseKind::Post => {
                if high_precision {
                    counters.decrement_post_hp(roi);
                }
                counters.decrement_post(roi);
            }
        }
    }
    Ok(Folded {
        kind,
        high_precision,
    })
}

fn classify<S: RoiTagged + ?Sized>(
    synapse: &S,
    pre_hp_threshold: f64,
    post_hp_threshold: f64,
) -> Result<(SynapseKind, bool), ConnectomeError> {
    let kind = synapse.kind().ok_or(ConnectomeError::MalformedSynapse {
        location: synapse.location(),
        field: "type",
    })?;
    let confidence = synapse.confidence().ok_or(ConnectomeError::MalformedSynapse {
        location: synapse.location(),
        field: "confidence",
    })?;
    let threshold = match kind {
        SynapseKind::Pre => pre_hp_threshold,
        SynapseKind::Post => post_hp_threshold,
    };
    Ok((kind, confidence > threshold))
}

/// Result of folding a whole collection of synapses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoiFold {
    pub roi_info: RoiInfo,
    pub pre: u64,
    pub post: u64,
    pub pre_hp: u64,
    pub post_hp: u64,
    /// Synapses excluded because a direction or confidence was missing.
    pub malformed: u64,
}

impl RoiFold {
    /// Fold every synapse, skipping and counting malformed ones.
    pub fn collect<'a, S, I>(synapses: I, pre_hp_threshold: f64, post_hp_threshold: f64) -> Self
    where
        S: RoiTagged + ?Sized + 'a,
        I: IntoIterator<Item = &'a S>,
    {
        let mut fold = RoiFold::default();
        for synapse in synapses {
            match fold_synapse_into_roi_counters(
                &mut fold.roi_info,
                synapse,
                pre_hp_threshold,
                post_hp_threshold,
            ) {
                Ok(Folded { kind: SynapseKind::Pre, high_precision }) => {
                    fold.pre += 1;
                    fold.pre_hp += high_precision as u64;
                }
                Ok(Folded { kind: SynapseKind::Post, high_precision }) => {
                    fold.post += 1;
                    fold.post_hp += high_precision as u64;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Excluding synapse from roiInfo");
                    fold.malformed += 1;
                }
            }
        }
        fold
    }

    pub fn is_complete(&self) -> bool {
        self.malformed == 0
    }
}

// --- Body-level statistics ---

/// Plain per-ROI pre/post counts for one body. HP counters stay at zero.
pub fn body_roi_info(body: &Body) -> RoiInfo {
    let mut info = RoiInfo::new();
    for synapse in body.synapses() {
        for roi in &synapse.rois {
            match synapse.kind {
                SynapseKind::Pre => info.increment_pre(roi),
                SynapseKind::Post => info.increment_post(roi),
            }
        }
    }
    info
}

/// A body is a Neuron when it has at least `threshold / 5` pre terminals or
/// at least `threshold` post terminals.
pub fn is_neuron(pre: u64, post: u64, threshold: u64) -> bool {
    pre >= threshold / 5 || post >= threshold
}

/// `inputs-outputs` name built from the ROIs of `super_rois` that hold more
/// than 10% of the body's post (inputs) or pre (outputs) terminals.
pub fn cluster_name(
    info: &RoiInfo,
    total_pre: u64,
    total_post: u64,
    super_rois: &BTreeSet<String>,
) -> String {
    let mut inputs = Vec::new();
    let mut outputs = Vec::new();
    for (roi, c) in info.iter().filter(|(roi, _)| super_rois.contains(*roi)) {
        if total_post > 0 && c.post as f64 / total_post as f64 > 0.10 {
            inputs.push(roi.as_str());
        }
        if total_pre > 0 && c.pre as f64 / total_pre as f64 > 0.10 {
            outputs.push(roi.as_str());
        }
    }
    let join = |v: Vec<&str>| if v.is_empty() { "none".to_string() } else { v.join(".") };
    format!("{}-{}", join(inputs), join(outputs))
}
