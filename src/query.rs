//! Containment queries over the current position set.

use std::collections::BTreeMap;

use crate::{
    FuzzyConfig, GeoPoint, Geofence, GeofenceId, GeofenceOccupancy, OptionExt, PositionStore,
    Result, SpatialIndex, TrigramIndex, Vehicle, VehicleId, VehicleSummary,
};

/// Read-only view answering "which vehicles are in this geofence" and "which
/// geofences hold the most vehicles".
///
/// Each call reads a fresh snapshot of the position store. Results taken
/// while a batch update is running may mix old and new positions.
pub struct ContainmentQueryEngine<'a> {
    index: &'a SpatialIndex,
    vehicles: &'a BTreeMap<VehicleId, Vehicle>,
    positions: &'a PositionStore,
    names: &'a TrigramIndex,
}

impl<'a> ContainmentQueryEngine<'a> {
    pub fn new(
        index: &'a SpatialIndex,
        vehicles: &'a BTreeMap<VehicleId, Vehicle>,
        positions: &'a PositionStore,
        names: &'a TrigramIndex,
    ) -> Self {
        Self {
            index,
            vehicles,
            positions,
            names,
        }
    }

    fn summarize(
        &self,
        ids: &[VehicleId],
        points: &BTreeMap<VehicleId, GeoPoint>,
    ) -> Vec<VehicleSummary> {
        ids.iter()
            .filter_map(|id| {
                let vehicle = self.vehicles.get(id)?;
                let point = points.get(id)?;
                Some(VehicleSummary::new(vehicle, *point))
            })
            .collect()
    }

    /// Vehicles inside `geofence_id`, ascending by id, at most `limit`.
    pub fn vehicles_in(&self, geofence_id: GeofenceId, limit: usize) -> Result<Vec<VehicleSummary>> {
        let positions = self.positions.points()?;
        let mut inside = self
            .index
            .members(geofence_id, &positions)?
            .ok_or_geofence(geofence_id)?;
        inside.truncate(limit);

        let points: BTreeMap<VehicleId, GeoPoint> = positions.into_iter().collect();
        Ok(self.summarize(&inside, &points))
    }

    /// The `top_n` geofences by vehicle count (descending, ties by ascending
    /// id), each with up to `sample_limit` sample vehicles.
    ///
    /// Every geofence takes part in the ranking, including empty ones.
    pub fn top_geofences_by_occupancy(
        &self,
        top_n: usize,
        sample_limit: usize,
    ) -> Result<Vec<GeofenceOccupancy>> {
        let positions = self.positions.points()?;
        let just_points: Vec<GeoPoint> = positions.iter().map(|(_, p)| *p).collect();
        let counts = self.index.count_by_geofence(&just_points)?;
        let ranked = self.index.ranked(&counts);
        log::debug!(
            "[ContainmentQueryEngine] Ranked {} geofences over {} positions",
            ranked.len(),
            positions.len()
        );

        let points: BTreeMap<VehicleId, GeoPoint> = positions.iter().copied().collect();
        let mut result = Vec::with_capacity(top_n.min(ranked.len()));
        for (geofence_id, vehicle_count) in ranked.into_iter().take(top_n) {
            let geofence = self.index.get(geofence_id).ok_or_geofence(geofence_id)?;
            let vehicles = if sample_limit > 0 && vehicle_count > 0 {
                let mut sample = self
                    .index
                    .members(geofence_id, &positions)?
                    .unwrap_or_default();
                sample.truncate(sample_limit);
                self.summarize(&sample, &points)
            } else {
                Vec::new()
            };
            result.push(GeofenceOccupancy {
                geofence_id,
                name: geofence.name.clone(),
                fence_type: geofence.fence_type.clone(),
                tags: geofence.tags.iter().cloned().collect(),
                vehicle_count,
                vehicles,
            });
        }
        Ok(result)
    }

    /// Best fuzzy match on geofence names, with its score.
    pub fn find_geofence_by_name(&self, name: &str, config: &FuzzyConfig) -> Option<(&'a Geofence, f64)> {
        let best = self.names.search(name, 1, config).into_iter().next()?;
        self.index.get(best.id).map(|g| (g, best.score))
    }
}
