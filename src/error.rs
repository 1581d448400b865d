//! Unified error handling for the fleet-tracker library.
//!
//! Every fallible operation returns [`Result`]. Not-found conditions are
//! recoverable and meant to be surfaced to the caller as a message; geometry
//! errors are fatal to the operation that hit them.

use thiserror::Error;

use crate::{GeofenceId, VehicleId};

/// Which unique vehicle identifier collided during generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierKind {
    Vin,
    LicensePlate,
}

impl std::fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentifierKind::Vin => write!(f, "VIN"),
            IdentifierKind::LicensePlate => write!(f, "license plate"),
        }
    }
}

/// Unified error type for fleet-tracker operations.
#[derive(Debug, Error)]
pub enum FleetError {
    /// Vehicle id is not known to the store
    #[error("Vehicle {0} not found")]
    VehicleNotFound(VehicleId),

    /// Geofence id is not known to the index
    #[error("Geofence {0} not found")]
    GeofenceNotFound(GeofenceId),

    /// Polygon ring is malformed
    #[error(
        "Invalid geometry{}: {}",
        .geofence_id.map(|id| format!(" for geofence {}", id)).unwrap_or_default(),
        .message
    )]
    InvalidGeometry {
        geofence_id: Option<GeofenceId>,
        message: String,
    },

    /// A computed position failed validation and was not committed
    #[error("Vehicle {vehicle_id} rejected position update: {message}")]
    InvalidPosition { vehicle_id: VehicleId, message: String },

    /// VIN or plate already in use
    #[error("{kind} '{value}' is already in use")]
    UniquenessCollision { kind: IdentifierKind, value: String },

    /// Identifier generation gave up after too many collisions
    #[error("Could not generate a unique {kind} after {attempts} attempts")]
    IdentifierSpaceExhausted { kind: IdentifierKind, attempts: u32 },

    /// Interior point sampling gave up (degenerate or sliver polygon)
    #[error("No interior point found in geofence {geofence_id} after {attempts} attempts")]
    SamplingExhausted { geofence_id: GeofenceId, attempts: u32 },

    /// A lock was poisoned by a panicking writer
    #[error("Lock poisoned: {0}")]
    LockPoisoned(&'static str),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// SQLite storage error
    #[cfg(feature = "persistence")]
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Boundary blob encoding error
    #[cfg(feature = "persistence")]
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Boundary blob decoding error
    #[cfg(feature = "persistence")]
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON attribute (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FleetError {
    /// Shorthand for a geometry error not yet tied to a geofence.
    pub fn invalid_geometry(message: impl Into<String>) -> Self {
        FleetError::InvalidGeometry {
            geofence_id: None,
            message: message.into(),
        }
    }

    /// Attach a geofence id to a geometry error, leaving other errors untouched.
    pub fn for_geofence(self, id: GeofenceId) -> Self {
        match self {
            FleetError::InvalidGeometry { message, .. } => FleetError::InvalidGeometry {
                geofence_id: Some(id),
                message,
            },
            other => other,
        }
    }

    /// True for errors a caller should report and move on from.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            FleetError::VehicleNotFound(_) | FleetError::GeofenceNotFound(_)
        )
    }
}

/// Result type alias for fleet-tracker operations.
pub type Result<T> = std::result::Result<T, FleetError>;

/// Extension trait for converting Option to FleetError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a vehicle not-found error.
    fn ok_or_vehicle(self, id: VehicleId) -> Result<T>;

    /// Convert Option to Result with a geofence not-found error.
    fn ok_or_geofence(self, id: GeofenceId) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_vehicle(self, id: VehicleId) -> Result<T> {
        self.ok_or(FleetError::VehicleNotFound(id))
    }

    fn ok_or_geofence(self, id: GeofenceId) -> Result<T> {
        self.ok_or(FleetError::GeofenceNotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FleetError::GeofenceNotFound(42);
        assert_eq!(err.to_string(), "Geofence 42 not found");

        let err = FleetError::invalid_geometry("ring is not closed").for_geofence(7);
        assert!(err.to_string().contains("geofence 7"));
        assert!(err.to_string().contains("ring is not closed"));
    }

    #[test]
    fn test_invalid_geometry_without_geofence() {
        let err = FleetError::invalid_geometry("too few vertices");
        assert_eq!(err.to_string(), "Invalid geometry: too few vertices");
    }

    #[test]
    fn test_option_ext() {
        let none: Option<i32> = None;
        let result = none.ok_or_vehicle(3);
        assert!(matches!(result, Err(FleetError::VehicleNotFound(3))));
        assert!(result.unwrap_err().is_not_found());

        let some = Some(1).ok_or_geofence(9);
        assert_eq!(some.unwrap(), 1);
    }

    #[test]
    fn test_collision_display() {
        let err = FleetError::UniquenessCollision {
            kind: IdentifierKind::LicensePlate,
            value: "ABC-1234".to_string(),
        };
        assert_eq!(err.to_string(), "license plate 'ABC-1234' is already in use");
    }
}
