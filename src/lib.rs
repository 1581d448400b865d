//! # Fleet Tracker
//!
//! In-process fleet tracking engine: vehicles, their current positions, an
//! append-only position history, and polygonal geofences.
//!
//! This library provides:
//! - Point-in-polygon containment with an R-tree bounding-box prefilter
//! - Trigram (Jaccard) fuzzy search over VINs, plates and geofence names
//! - A parallel position-update pipeline that pairs every position write
//!   with exactly one history record
//!
//! ## Features
//!
//! - **`parallel`** - Run batch updates and occupancy counts on the rayon pool
//! - **`persistence`** - SQLite storage for fleet state
//! - **`cli`** - The `fleet-tracker` command-line front end
//!
//! ## Quick Start
//!
//! ```rust
//! use fleet_tracker::{FleetEngine, GeoPoint, GeofenceDraft, VehicleDraft, PositionDraft};
//!
//! let engine = FleetEngine::new();
//! let square = vec![
//!     GeoPoint::new(0.0, 0.0),
//!     GeoPoint::new(1.0, 0.0),
//!     GeoPoint::new(1.0, 1.0),
//!     GeoPoint::new(0.0, 1.0),
//!     GeoPoint::new(0.0, 0.0),
//! ];
//! let fence = engine
//!     .add_geofence(GeofenceDraft::new("Depot", "depot", square))
//!     .unwrap();
//! let vehicle = engine
//!     .add_vehicle(
//!         VehicleDraft::new("1HGCM82633A004352", "ABC-1234", "Honda", "Civic", 2020),
//!         PositionDraft::at(GeoPoint::new(0.5, 0.5)),
//!     )
//!     .unwrap();
//!
//! let inside = engine.vehicles_in(fence, 10).unwrap();
//! assert_eq!(inside[0].vehicle_id, vehicle);
//! ```

use geo::Coord;
use rstar::AABB;
use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{FleetError, IdentifierKind, OptionExt, Result};

// Entity types (vehicles, geofences, positions, history records)
pub mod types;
pub use types::{
    GeofenceDraft, GeofenceOccupancy, Geofence, PositionDraft, PositionHistoryRecord,
    VehicleDraft, Vehicle, VehiclePosition, VehicleSummary,
};

// Geometry kernel (containment, bounding boxes, local displacement)
pub mod geometry;

// R-tree backed geofence index
pub mod spatial_index;
pub use spatial_index::SpatialIndex;

// Trigram similarity and ranked fuzzy search
pub mod fuzzy;
pub use fuzzy::{FuzzyConfig, FuzzyMatch, TrigramIndex};

// Current positions + append-only history with paired commits
pub mod store;
pub use store::{FleetStore, HistoryLog, PositionStore};

// Cooperative cancellation for long-running batches
pub mod cancel;
pub use cancel::CancelToken;

// Batch position updates and targeted moves
pub mod pipeline;
pub use pipeline::{
    BatchReport, DisplacementModel, MoveConfig, MoveReport, RandomWalk, UpdateConfig,
    UpdatePipeline,
};

// Containment queries
pub mod query;
pub use query::ContainmentQueryEngine;

// Synthetic fleet generation for seeding
pub mod seed;
pub use seed::{SeedConfig, SeedReport, SyntheticFleet};

// Stateful fleet engine (owns everything above)
pub mod engine;
pub use engine::{EngineStats, FleetEngine, FleetSnapshot};

// SQLite persistence
#[cfg(feature = "persistence")]
pub mod persistence;
#[cfg(feature = "persistence")]
pub use persistence::{FleetDatabase, StoredCounts};

/// Identity of a vehicle (assigned sequentially from 1).
pub type VehicleId = u64;

/// Identity of a geofence (assigned sequentially from 1).
pub type GeofenceId = u64;

// ============================================================================
// Core Types
// ============================================================================

/// A geographic coordinate, longitude first.
///
/// # Example
/// ```
/// use fleet_tracker::GeoPoint;
/// let point = GeoPoint::new(-122.3321, 47.6062); // Seattle
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub longitude: f64,
    pub latitude: f64,
}

impl GeoPoint {
    /// Create a new point from longitude and latitude in degrees.
    pub fn new(longitude: f64, latitude: f64) -> Self {
        Self {
            longitude,
            latitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

impl From<GeoPoint> for Coord<f64> {
    fn from(p: GeoPoint) -> Self {
        Coord {
            x: p.longitude,
            y: p.latitude,
        }
    }
}

impl From<Coord<f64>> for GeoPoint {
    fn from(c: Coord<f64>) -> Self {
        GeoPoint::new(c.x, c.y)
    }
}

/// Axis-aligned bounding box in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl Bounds {
    /// Inclusive point test.
    pub fn contains_point(&self, point: GeoPoint) -> bool {
        point.longitude >= self.min_lon
            && point.longitude <= self.max_lon
            && point.latitude >= self.min_lat
            && point.latitude <= self.max_lat
    }

    /// Grow every side by `margin` degrees.
    pub fn expanded(&self, margin: f64) -> Self {
        Self {
            min_lon: self.min_lon - margin,
            min_lat: self.min_lat - margin,
            max_lon: self.max_lon + margin,
            max_lat: self.max_lat + margin,
        }
    }

    pub fn width(&self) -> f64 {
        self.max_lon - self.min_lon
    }

    pub fn height(&self) -> f64 {
        self.max_lat - self.min_lat
    }

    /// Envelope for R-tree indexing, `[lon, lat]` order.
    pub fn envelope(&self) -> AABB<[f64; 2]> {
        AABB::from_corners([self.min_lon, self.min_lat], [self.max_lon, self.max_lat])
    }
}
