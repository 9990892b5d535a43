//! Two-phase resolution of pre-synaptic partners into body-to-body edges.
//!
//! Phase 1 registers every post-synaptic location in a [`LocationIndex`].
//! Phase 2 walks each pre-synapse's declared partners, resolves the owning
//! body and accumulates edge weights, per-body connection maps and the
//! synapses that make up each (pre body, post body) ConnectionSet.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{debug, info};

use connectome_common::{Body, BodyId, ConnectomeError, Location, RoiFold, RoiInfo, Synapse, SynapseKind};

use crate::location_index::LocationIndex;

/// A partner location no loaded body owns. Expected when the input is a
/// spatial subset of a larger volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedPartner {
    pub body: BodyId,
    pub pre: Location,
    pub partner: Location,
}

/// Derived per-body attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BodyConnectivity {
    pub pre: u64,
    pub post: u64,
    /// Weight of every outgoing edge, keyed by the post body.
    pub connects_to: BTreeMap<BodyId, u64>,
    /// Weight of every incoming edge, keyed by the pre body.
    pub connects_from: BTreeMap<BodyId, u64>,
}

/// The distinct synapses that link one pre body to one post body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionSet {
    synapses: Vec<Synapse>,
    seen: HashSet<(SynapseKind, Location)>,
}

impl ConnectionSet {
    fn add(&mut self, synapse: &Synapse) {
        if self.seen.insert((synapse.kind, synapse.location)) {
            self.synapses.push(synapse.clone());
        }
    }

    pub fn synapses(&self) -> &[Synapse] {
        &self.synapses
    }

    pub fn stats(&self, pre_hp_threshold: f64, post_hp_threshold: f64) -> ConnectionSetStats {
        let fold = RoiFold::collect(self.synapses.iter(), pre_hp_threshold, post_hp_threshold);
        ConnectionSetStats {
            weight: fold.post,
            weight_hp: fold.post_hp,
            roi_info: fold.roi_info,
        }
    }
}

/// Aggregate written onto a ConnectionSet node and its `ConnectsTo` edge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionSetStats {
    pub roi_info: RoiInfo,
    /// Distinct post terminals in the set.
    pub weight: u64,
    /// Post terminals whose confidence exceeds the post HP threshold.
    pub weight_hp: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectivityReport {
    /// Resolved pre→post link counts, not deduplicated by partner location.
    pub edges: BTreeMap<(BodyId, BodyId), u64>,
    pub bodies: BTreeMap<BodyId, BodyConnectivity>,
    pub connection_sets: BTreeMap<(BodyId, BodyId), ConnectionSet>,
    /// Resolved partner locations of every pre-synapse.
    pub synapses_to: BTreeMap<Location, Vec<Location>>,
    pub unresolved: Vec<UnresolvedPartner>,
}

impl ConnectivityReport {
    pub fn weight(&self, pre: &BodyId, post: &BodyId) -> u64 {
        self.edges
            .get(&(pre.clone(), post.clone()))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_weight(&self) -> u64 {
        self.edges.values().sum()
    }
}

pub struct ConnectivityResolver<'a> {
    bodies: &'a [Body],
    index: LocationIndex,
    post_synapses: HashMap<Location, &'a Synapse>,
}

impl<'a> ConnectivityResolver<'a> {
    /// Phase 1. Fails on the first location claimed twice.
    pub fn new(bodies: &'a [Body]) -> Result<Self, ConnectomeError> {
        let post_total: usize = bodies.iter().map(Body::post_count).sum();
        let mut index = LocationIndex::with_capacity(post_total);
        let mut post_synapses = HashMap::with_capacity(post_total);
        for body in bodies {
            for synapse in body.post_synapses() {
                index.put(synapse.location, &body.id)?;
                post_synapses.insert(synapse.location, synapse);
            }
        }
        debug!(bodies = bodies.len(), locations = index.len(), "Indexed post-synaptic locations");
        Ok(Self {
            bodies,
            index,
            post_synapses,
        })
    }

    pub fn index(&self) -> &LocationIndex {
        &self.index
    }

    /// Phase 2.
    pub fn resolve(&self) -> ConnectivityReport {
        let mut report = ConnectivityReport::default();

        for body in self.bodies {
            let entry = report.bodies.entry(body.id.clone()).or_default();
            entry.pre += body.pre_count() as u64;
            entry.post += body.post_count() as u64;
        }

        for body in self.bodies {
            for pre in body.pre_synapses() {
                for partner in &pre.partners {
                    let Some(owner) = self.index.get(partner) else {
                        debug!(body = %body.id, pre = %pre.location, partner = %partner, "Unresolved partner");
                        report.unresolved.push(UnresolvedPartner {
                            body: body.id.clone(),
                            pre: pre.location,
                            partner: *partner,
                        });
                        continue;
                    };

                    *report
                        .edges
                        .entry((body.id.clone(), owner.clone()))
                        .or_insert(0) += 1;
                    *report
                        .bodies
                        .entry(body.id.clone())
                        .or_default()
                        .connects_to
                        .entry(owner.clone())
                        .or_insert(0) += 1;
                    *report
                        .bodies
                        .entry(owner.clone())
                        .or_default()
                        .connects_from
                        .entry(body.id.clone())
                        .or_insert(0) += 1;
                    report
                        .synapses_to
                        .entry(pre.location)
                        .or_default()
                        .push(*partner);

                    let set = report
                        .connection_sets
                        .entry((body.id.clone(), owner.clone()))
                        .or_default();
                    set.add(pre);
                    if let Some(post) = self.post_synapses.get(partner) {
                        set.add(post);
                    }
                }
            }
        }

        info!(
            bodies = self.bodies.len(),
            edges = report.edges.len(),
            weight = report.total_weight(),
            unresolved = report.unresolved.len(),
            "Resolved connectivity"
        );
        report
    }
}

/// Bulk entry point: index then resolve.
pub fn resolve_connectivity(bodies: &[Body]) -> Result<ConnectivityReport, ConnectomeError> {
    Ok(ConnectivityResolver::new(bodies)?.resolve())
}
