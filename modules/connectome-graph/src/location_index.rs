use std::collections::hash_map::{Entry, HashMap};

use connectome_common::{BodyId, ConnectomeError, Location};

/// Exact-match map from a synaptic location to the body that owns it.
///
/// A location is owned by at most one body. A second registration of an
/// already-mapped location fails and leaves the first mapping in place.
#[derive(Debug, Default, Clone)]
pub struct LocationIndex {
    owners: HashMap<Location, BodyId>,
}

impl LocationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            owners: HashMap::with_capacity(n),
        }
    }

    pub fn put(&mut self, location: Location, body: &BodyId) -> Result<(), ConnectomeError> {
        match self.owners.entry(location) {
            Entry::Vacant(slot) => {
                slot.insert(body.clone());
                Ok(())
            }
            // Re-registering the same body is malformed input as well.
            Entry::Occupied(existing) => Err(ConnectomeError::DuplicateLocation {
                location,
                existing: existing.get().clone(),
                attempted: body.clone(),
            }),
        }
    }

    pub fn get(&self, location: &Location) -> Option<&BodyId> {
        self.owners.get(location)
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_returns_owner() {
        let mut index = LocationIndex::new();
        for (i, x) in (0..50).enumerate() {
            index.put(Location::new(x, x * 2, 7), &BodyId::from(i as i64)).unwrap();
        }
        assert_eq!(index.len(), 50);
        for (i, x) in (0..50).enumerate() {
            assert_eq!(index.get(&Location::new(x, x * 2, 7)), Some(&BodyId::from(i as i64)));
        }
        assert!(index.get(&Location::new(-1, 0, 0)).is_none());
    }

    #[test]
    fn conflicting_owner_is_rejected_and_original_kept() {
        let loc = Location::new(4298, 2294, 1542);
        let mut index = LocationIndex::new();
        index.put(loc, &BodyId::from(26311)).unwrap();

        let err = index.put(loc, &BodyId::from(831744)).unwrap_err();
        match err {
            ConnectomeError::DuplicateLocation {
                location,
                existing,
                attempted,
            } => {
                assert_eq!(location, loc);
                assert_eq!(existing, BodyId::from(26311));
                assert_eq!(attempted, BodyId::from(831744));
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(index.get(&loc), Some(&BodyId::from(26311)));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn same_owner_twice_is_also_rejected() {
        let loc = Location::new(1, 2, 3);
        let mut index = LocationIndex::new();
        index.put(loc, &BodyId::from(5)).unwrap();
        assert!(index.put(loc, &BodyId::from(5)).is_err());
        assert_eq!(index.get(&loc), Some(&BodyId::from(5)));
    }
}
