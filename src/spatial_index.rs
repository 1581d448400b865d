//! R-tree index over geofence bounding boxes.
//!
//! Queries first collect geofences whose bounding box covers the point, then
//! run the boundary-inclusive ring test only on those candidates. The box
//! test uses the same tolerance as the ring test, so the prefilter never
//! drops a point the ring test would accept.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use rstar::{RTree, RTreeObject, AABB};

use crate::geometry;
use crate::{Bounds, GeoPoint, Geofence, GeofenceId, Result, VehicleId};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Bounds wrapper for R-tree spatial indexing
#[derive(Debug, Clone, PartialEq)]
pub struct GeofenceBounds {
    pub geofence_id: GeofenceId,
    pub bounds: Bounds,
}

impl RTreeObject for GeofenceBounds {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.bounds.envelope()
    }
}

/// Geofence registry plus its bounding-box R-tree.
///
/// Boundaries are read-only once indexed.
#[derive(Debug, Default)]
pub struct SpatialIndex {
    geofences: BTreeMap<GeofenceId, Geofence>,
    tree: RTree<GeofenceBounds>,
}

impl SpatialIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bulk-load an index (faster and better balanced than repeated inserts).
    pub fn from_geofences(geofences: Vec<Geofence>) -> Self {
        let entries: Vec<GeofenceBounds> = geofences
            .iter()
            .map(|g| GeofenceBounds {
                geofence_id: g.id,
                bounds: g.bounds,
            })
            .collect();
        Self {
            geofences: geofences.into_iter().map(|g| (g.id, g)).collect(),
            tree: RTree::bulk_load(entries),
        }
    }

    /// Add one geofence. An existing entry with the same id is replaced,
    /// envelope included.
    pub fn insert(&mut self, geofence: Geofence) {
        if let Some(old) = self.geofences.remove(&geofence.id) {
            self.tree.remove(&GeofenceBounds {
                geofence_id: old.id,
                bounds: old.bounds,
            });
        }
        self.tree.insert(GeofenceBounds {
            geofence_id: geofence.id,
            bounds: geofence.bounds,
        });
        self.geofences.insert(geofence.id, geofence);
    }

    pub fn get(&self, id: GeofenceId) -> Option<&Geofence> {
        self.geofences.get(&id)
    }

    pub fn bounds(&self, id: GeofenceId) -> Option<Bounds> {
        self.geofences.get(&id).map(|g| g.bounds)
    }

    /// All geofences in ascending id order.
    pub fn geofences(&self) -> impl Iterator<Item = &Geofence> {
        self.geofences.values()
    }

    pub fn len(&self) -> usize {
        self.geofences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.geofences.is_empty()
    }

    pub fn clear(&mut self) {
        self.geofences.clear();
        self.tree = RTree::new();
    }

    /// Ids whose bounding box covers `point` (within the boundary
    /// tolerance), before the exact test.
    pub fn candidates(&self, point: GeoPoint) -> Vec<GeofenceId> {
        let eps = geometry::BOUNDARY_EPSILON;
        let window = AABB::from_corners(
            [point.longitude - eps, point.latitude - eps],
            [point.longitude + eps, point.latitude + eps],
        );
        let mut ids: Vec<GeofenceId> = self
            .tree
            .locate_in_envelope_intersecting(&window)
            .map(|entry| entry.geofence_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Geofences containing `point`, ascending by id.
    pub fn query(&self, point: GeoPoint) -> Result<Vec<GeofenceId>> {
        let mut hits = Vec::new();
        for id in self.candidates(point) {
            if let Some(geofence) = self.geofences.get(&id) {
                if geofence.contains(point)? {
                    hits.push(id);
                }
            }
        }
        Ok(hits)
    }

    /// Count how many of `points` fall in each geofence. A point may count
    /// toward several overlapping geofences. Geofences with no points are
    /// absent from the map.
    pub fn count_by_geofence(&self, points: &[GeoPoint]) -> Result<BTreeMap<GeofenceId, usize>> {
        #[cfg(feature = "parallel")]
        {
            points
                .par_iter()
                .try_fold(BTreeMap::new, |mut acc, point| {
                    for id in self.query(*point)? {
                        *acc.entry(id).or_insert(0) += 1;
                    }
                    Ok(acc)
                })
                .try_reduce(BTreeMap::new, |mut a, b| {
                    for (id, n) in b {
                        *a.entry(id).or_insert(0) += n;
                    }
                    Ok(a)
                })
        }

        #[cfg(not(feature = "parallel"))]
        {
            let mut counts = BTreeMap::new();
            for point in points {
                for id in self.query(*point)? {
                    *counts.entry(id).or_insert(0) += 1;
                }
            }
            Ok(counts)
        }
    }

    /// Every indexed geofence with its count (zero when absent from
    /// `counts`), ordered by count descending then id ascending.
    pub fn ranked(&self, counts: &BTreeMap<GeofenceId, usize>) -> Vec<(GeofenceId, usize)> {
        let mut ranked: Vec<(GeofenceId, usize)> = self
            .geofences
            .keys()
            .map(|id| (*id, counts.get(id).copied().unwrap_or(0)))
            .collect();
        ranked.sort_by_key(|&(id, count)| (Reverse(count), id));
        ranked
    }

    /// Vehicles from `positions` inside geofence `id`, preserving input order.
    ///
    /// Returns `Ok(None)` when the geofence does not exist.
    pub fn members(
        &self,
        id: GeofenceId,
        positions: &[(VehicleId, GeoPoint)],
    ) -> Result<Option<Vec<VehicleId>>> {
        let Some(geofence) = self.geofences.get(&id) else {
            return Ok(None);
        };
        let mut inside = Vec::new();
        for (vehicle_id, point) in positions {
            if geofence.contains(*point)? {
                inside.push(*vehicle_id);
            }
        }
        Ok(Some(inside))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GeofenceDraft;

    fn square(id: GeofenceId, x: f64, y: f64, size: f64) -> Geofence {
        let ring = vec![
            GeoPoint::new(x, y),
            GeoPoint::new(x + size, y),
            GeoPoint::new(x + size, y + size),
            GeoPoint::new(x, y + size),
            GeoPoint::new(x, y),
        ];
        GeofenceDraft::new(&format!("Zone {}", id), "yard", ring)
            .into_geofence(id)
            .unwrap()
    }

    /// Right triangle with the hypotenuse from (1,0) to (0,1).
    fn triangle(id: GeofenceId) -> Geofence {
        let ring = vec![
            GeoPoint::new(0.0, 0.0),
            GeoPoint::new(1.0, 0.0),
            GeoPoint::new(0.0, 1.0),
            GeoPoint::new(0.0, 0.0),
        ];
        GeofenceDraft::new("Triangle", "yard", ring)
            .into_geofence(id)
            .unwrap()
    }

    #[test]
    fn test_query_exact_match() {
        let index =
            SpatialIndex::from_geofences(vec![square(1, 0.0, 0.0, 1.0), square(2, 5.0, 5.0, 1.0)]);
        assert_eq!(index.query(GeoPoint::new(0.5, 0.5)).unwrap(), vec![1]);
        assert_eq!(index.query(GeoPoint::new(5.5, 5.9)).unwrap(), vec![2]);
        assert!(index.query(GeoPoint::new(3.0, 3.0)).unwrap().is_empty());
    }

    #[test]
    fn test_bbox_candidate_filtered_by_exact_test() {
        let index = SpatialIndex::from_geofences(vec![triangle(1)]);
        let corner = GeoPoint::new(0.9, 0.9);
        // Inside the bounding box, outside the triangle
        assert_eq!(index.candidates(corner), vec![1]);
        assert!(index.query(corner).unwrap().is_empty());
        // On the hypotenuse counts as inside
        assert_eq!(index.query(GeoPoint::new(0.5, 0.5)).unwrap(), vec![1]);
    }

    #[test]
    fn test_points_outside_bbox_never_candidates() {
        let index = SpatialIndex::from_geofences(vec![square(1, 0.0, 0.0, 1.0)]);
        for p in [
            GeoPoint::new(-0.0001, 0.5),
            GeoPoint::new(1.0001, 0.5),
            GeoPoint::new(0.5, 1.0001),
            GeoPoint::new(0.5, -0.0001),
        ] {
            assert!(index.candidates(p).is_empty());
        }
    }

    #[test]
    fn test_index_agrees_with_ring_test_at_tolerance() {
        let fence = square(1, 0.0, 0.0, 1.0);
        let index = SpatialIndex::from_geofences(vec![fence.clone()]);

        // Within the boundary tolerance east of the right edge
        let near = GeoPoint::new(1.0 + geometry::BOUNDARY_EPSILON / 2.0, 0.5);
        assert!(geometry::contains(&fence.boundary, near).unwrap());
        assert!(fence.contains(near).unwrap());
        assert_eq!(index.query(near).unwrap(), vec![1]);

        // Clearly outside: all three reject
        let far = GeoPoint::new(1.0 + 1e-6, 0.5);
        assert!(!geometry::contains(&fence.boundary, far).unwrap());
        assert!(!fence.contains(far).unwrap());
        assert!(index.query(far).unwrap().is_empty());
    }

    #[test]
    fn test_overlapping_geofences_both_counted() {
        let index = SpatialIndex::from_geofences(vec![
            square(1, 0.0, 0.0, 2.0),
            square(2, 1.0, 1.0, 2.0),
            square(3, 10.0, 10.0, 1.0),
        ]);
        let points = vec![
            GeoPoint::new(1.5, 1.5), // both 1 and 2
            GeoPoint::new(0.5, 0.5), // only 1
            GeoPoint::new(2.5, 2.5), // only 2
            GeoPoint::new(2.8, 2.8), // only 2
        ];
        let counts = index.count_by_geofence(&points).unwrap();
        assert_eq!(counts.get(&1), Some(&2));
        assert_eq!(counts.get(&2), Some(&3));
        assert_eq!(counts.get(&3), None);

        let ranked = index.ranked(&counts);
        assert_eq!(ranked, vec![(2, 3), (1, 2), (3, 0)]);
    }

    #[test]
    fn test_ranked_ties_break_by_id() {
        let index = SpatialIndex::from_geofences(vec![
            square(3, 0.0, 0.0, 1.0),
            square(1, 5.0, 5.0, 1.0),
            square(2, 8.0, 8.0, 1.0),
        ]);
        let points = vec![GeoPoint::new(0.5, 0.5), GeoPoint::new(5.5, 5.5)];
        let counts = index.count_by_geofence(&points).unwrap();
        assert_eq!(index.ranked(&counts), vec![(1, 1), (3, 1), (2, 0)]);
    }

    #[test]
    fn test_insert_and_members() {
        let mut index = SpatialIndex::new();
        index.insert(square(1, 0.0, 0.0, 1.0));
        index.insert(square(2, 0.5, 0.5, 1.0));
        assert_eq!(index.len(), 2);

        let positions = vec![
            (10, GeoPoint::new(0.2, 0.2)),
            (11, GeoPoint::new(0.7, 0.7)),
            (12, GeoPoint::new(1.4, 1.4)),
        ];
        assert_eq!(index.members(1, &positions).unwrap(), Some(vec![10, 11]));
        assert_eq!(index.members(2, &positions).unwrap(), Some(vec![11, 12]));
        assert_eq!(index.members(99, &positions).unwrap(), None);
    }

    #[test]
    fn test_clear() {
        let mut index = SpatialIndex::from_geofences(vec![square(1, 0.0, 0.0, 1.0)]);
        index.clear();
        assert!(index.is_empty());
        assert!(index.query(GeoPoint::new(0.5, 0.5)).unwrap().is_empty());
        assert!(index.ranked(&BTreeMap::new()).is_empty());
    }
}
