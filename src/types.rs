//! Entity types for the fleet: vehicles, geofences, current positions and
//! history records, plus the lightweight summaries returned by queries.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::geometry;
use crate::{Bounds, GeoPoint, GeofenceId, Result, VehicleId};

// ============================================================================
// Vehicles
// ============================================================================

/// A registered vehicle. Identity fields never change after registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: VehicleId,
    /// 17-character vehicle identification number (unique)
    pub vin: String,
    /// License plate (unique)
    pub license_plate: String,
    pub make: String,
    pub model: String,
    pub year: u16,
    pub color: String,
    /// Free-form attributes (fleet, status, fuel, ...)
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

/// Everything needed to register a vehicle except its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleDraft {
    pub vin: String,
    pub license_plate: String,
    pub make: String,
    pub model: String,
    pub year: u16,
    pub color: String,
    pub attributes: Map<String, Value>,
}

impl VehicleDraft {
    pub fn new(vin: &str, license_plate: &str, make: &str, model: &str, year: u16) -> Self {
        Self {
            vin: vin.to_string(),
            license_plate: license_plate.to_string(),
            make: make.to_string(),
            model: model.to_string(),
            year,
            color: String::new(),
            attributes: Map::new(),
        }
    }

    pub fn with_color(mut self, color: &str) -> Self {
        self.color = color.to_string();
        self
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub(crate) fn into_vehicle(self, id: VehicleId) -> Vehicle {
        Vehicle {
            id,
            vin: self.vin,
            license_plate: self.license_plate,
            make: self.make,
            model: self.model,
            year: self.year,
            color: self.color,
            attributes: self.attributes,
        }
    }
}

// ============================================================================
// Geofences
// ============================================================================

/// A named polygonal region. The boundary is a closed ring of
/// (longitude, latitude) vertices and never changes after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    pub id: GeofenceId,
    /// Display name (not unique)
    pub name: String,
    /// Type tag: "warehouse", "depot", ...
    pub fence_type: String,
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Closed ring, first vertex equals last
    pub boundary: Vec<GeoPoint>,
    /// Pre-computed bounding box of `boundary`
    pub bounds: Bounds,
}

impl Geofence {
    /// Exact containment test against this geofence's ring (boundary-inclusive).
    pub fn contains(&self, point: GeoPoint) -> Result<bool> {
        if !self
            .bounds
            .expanded(geometry::BOUNDARY_EPSILON)
            .contains_point(point)
        {
            return Ok(false);
        }
        geometry::contains(&self.boundary, point).map_err(|e| e.for_geofence(self.id))
    }
}

/// Everything needed to register a geofence except its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeofenceDraft {
    pub name: String,
    pub fence_type: String,
    pub tags: BTreeSet<String>,
    pub metadata: Map<String, Value>,
    pub boundary: Vec<GeoPoint>,
}

impl GeofenceDraft {
    pub fn new(name: &str, fence_type: &str, boundary: Vec<GeoPoint>) -> Self {
        Self {
            name: name.to_string(),
            fence_type: fence_type.to_string(),
            tags: BTreeSet::new(),
            metadata: Map::new(),
            boundary,
        }
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tags.insert(tag.to_string());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Validate the ring and attach the id and bounding box.
    pub fn into_geofence(self, id: GeofenceId) -> Result<Geofence> {
        geometry::validate_ring(&self.boundary).map_err(|e| e.for_geofence(id))?;
        let bounds = geometry::bounding_box(&self.boundary).map_err(|e| e.for_geofence(id))?;
        Ok(Geofence {
            id,
            name: self.name,
            fence_type: self.fence_type,
            tags: self.tags,
            metadata: self.metadata,
            boundary: self.boundary,
            bounds,
        })
    }
}

// ============================================================================
// Positions
// ============================================================================

/// The current position of one vehicle. Overwritten in place on each update.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VehiclePosition {
    pub point: GeoPoint,
    /// Heading in degrees, always in [0, 360)
    pub heading_deg: f64,
    /// Speed in km/h, never negative
    pub speed_kph: f64,
    pub updated_at: DateTime<Utc>,
}

impl VehiclePosition {
    /// Check the invariants every stored position must satisfy.
    pub fn is_valid(&self) -> bool {
        self.point.is_valid()
            && self.heading_deg.is_finite()
            && (0.0..360.0).contains(&self.heading_deg)
            && self.speed_kph.is_finite()
            && self.speed_kph >= 0.0
    }
}

/// A position to be committed, before the store stamps it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionDraft {
    pub point: GeoPoint,
    pub heading_deg: f64,
    pub speed_kph: f64,
}

impl PositionDraft {
    /// Stationary at `point`, heading north.
    pub fn at(point: GeoPoint) -> Self {
        Self {
            point,
            heading_deg: 0.0,
            speed_kph: 0.0,
        }
    }

    pub fn with_heading(mut self, heading_deg: f64) -> Self {
        self.heading_deg = heading_deg;
        self
    }

    pub fn with_speed(mut self, speed_kph: f64) -> Self {
        self.speed_kph = speed_kph;
        self
    }

    /// Normalize heading into [0, 360) and stamp the update time.
    pub fn stamp(self, updated_at: DateTime<Utc>) -> VehiclePosition {
        VehiclePosition {
            point: self.point,
            heading_deg: geometry::normalize_heading(self.heading_deg),
            speed_kph: self.speed_kph,
            updated_at,
        }
    }
}

/// One observation in the append-only history log.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionHistoryRecord {
    /// Position in the log, assigned on append (starts at 1)
    pub seq: u64,
    pub vehicle_id: VehicleId,
    pub point: GeoPoint,
    pub heading_deg: f64,
    pub speed_kph: f64,
    pub recorded_at: DateTime<Utc>,
}

impl PositionHistoryRecord {
    /// Build the record paired with a committed position. `seq` is filled in
    /// by the log.
    pub fn from_position(vehicle_id: VehicleId, position: &VehiclePosition) -> Self {
        Self {
            seq: 0,
            vehicle_id,
            point: position.point,
            heading_deg: position.heading_deg,
            speed_kph: position.speed_kph,
            recorded_at: position.updated_at,
        }
    }

    /// True when the record carries exactly the values of `position`.
    pub fn matches(&self, position: &VehiclePosition) -> bool {
        self.point == position.point
            && self.heading_deg == position.heading_deg
            && self.speed_kph == position.speed_kph
            && self.recorded_at == position.updated_at
    }

    /// The current position this record describes.
    pub fn to_position(&self) -> VehiclePosition {
        VehiclePosition {
            point: self.point,
            heading_deg: self.heading_deg,
            speed_kph: self.speed_kph,
            updated_at: self.recorded_at,
        }
    }
}

// ============================================================================
// Query Results
// ============================================================================

/// Vehicle identity joined with its current point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleSummary {
    pub vehicle_id: VehicleId,
    pub vin: String,
    pub license_plate: String,
    pub make: String,
    pub model: String,
    pub year: u16,
    pub point: GeoPoint,
}

impl VehicleSummary {
    pub fn new(vehicle: &Vehicle, point: GeoPoint) -> Self {
        Self {
            vehicle_id: vehicle.id,
            vin: vehicle.vin.clone(),
            license_plate: vehicle.license_plate.clone(),
            make: vehicle.make.clone(),
            model: vehicle.model.clone(),
            year: vehicle.year,
            point,
        }
    }
}

/// A geofence with its vehicle count and a sample of the vehicles inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeofenceOccupancy {
    pub geofence_id: GeofenceId,
    pub name: String,
    pub fence_type: String,
    pub tags: Vec<String>,
    pub vehicle_count: usize,
    /// Up to `sample_limit` vehicles, ascending by id
    pub vehicles: Vec<VehicleSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FleetError;

    fn unit_square() -> Vec<GeoPoint> {
        vec![
            GeoPoint::new(0.0, 0.0),
            GeoPoint::new(1.0, 0.0),
            GeoPoint::new(1.0, 1.0),
            GeoPoint::new(0.0, 1.0),
            GeoPoint::new(0.0, 0.0),
        ]
    }

    #[test]
    fn test_geofence_draft_computes_bounds() {
        let fence = GeofenceDraft::new("Yard", "yard", unit_square())
            .with_tag("urban")
            .with_tag("urban")
            .into_geofence(1)
            .unwrap();
        assert_eq!(fence.bounds.max_lon, 1.0);
        assert_eq!(fence.tags.len(), 1);
        assert!(fence.contains(GeoPoint::new(0.5, 0.5)).unwrap());
        assert!(!fence.contains(GeoPoint::new(2.0, 2.0)).unwrap());
    }

    #[test]
    fn test_geofence_draft_rejects_open_ring() {
        let mut ring = unit_square();
        ring.pop();
        let err = GeofenceDraft::new("Open", "yard", ring)
            .into_geofence(5)
            .unwrap_err();
        assert!(matches!(
            err,
            FleetError::InvalidGeometry {
                geofence_id: Some(5),
                ..
            }
        ));
    }

    #[test]
    fn test_stamp_normalizes_heading() {
        let now = Utc::now();
        let pos = PositionDraft::at(GeoPoint::new(1.0, 1.0))
            .with_heading(-30.0)
            .with_speed(12.0)
            .stamp(now);
        assert_eq!(pos.heading_deg, 330.0);
        assert!(pos.is_valid());
    }

    #[test]
    fn test_history_record_matches_position() {
        let pos = PositionDraft::at(GeoPoint::new(3.0, 4.0))
            .with_heading(90.0)
            .stamp(Utc::now());
        let record = PositionHistoryRecord::from_position(8, &pos);
        assert!(record.matches(&pos));
        assert_eq!(record.to_position(), pos);

        let mut moved = pos;
        moved.speed_kph = 1.0;
        assert!(!record.matches(&moved));
    }

    #[test]
    fn test_negative_speed_is_invalid() {
        let pos = PositionDraft::at(GeoPoint::new(0.0, 0.0))
            .with_speed(-1.0)
            .stamp(Utc::now());
        assert!(!pos.is_valid());
    }
}
