//! Synthetic fleet generation for demos and load tests.
//!
//! Everything is drawn from the generator the caller passes in, so a seeded
//! generator reproduces the same fleet.

use chrono::{Datelike, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    Bounds, FleetError, GeoPoint, GeofenceDraft, GeofenceId, IdentifierKind, PositionDraft,
    Result, VehicleDraft, VehicleId,
};

const VIN_CHARS: &[u8] = b"ABCDEFGHJKLMNPRSTUVWXYZ0123456789";
const VIN_LEN: usize = 17;
const PLATE_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";

const MAKES_MODELS: &[(&str, &[&str])] = &[
    ("Toyota", &["Camry", "Corolla", "RAV4", "Highlander", "Tacoma"]),
    ("Ford", &["F-150", "Explorer", "Escape", "Mustang", "Edge"]),
    ("Chevrolet", &["Silverado", "Equinox", "Tahoe", "Traverse", "Bolt"]),
    ("Honda", &["Civic", "Accord", "CR-V", "Pilot", "Ridgeline"]),
    ("Nissan", &["Altima", "Rogue", "Sentra", "Pathfinder", "Frontier"]),
    ("BMW", &["330i", "X3", "X5", "M4", "i4"]),
    ("Mercedes", &["C300", "GLC", "GLE", "EQS", "Sprinter"]),
    ("Tesla", &["Model 3", "Model Y", "Model S", "Model X"]),
    ("Jeep", &["Wrangler", "Grand Cherokee", "Compass", "Gladiator"]),
    ("Subaru", &["Outback", "Forester", "Crosstrek", "WRX"]),
    ("Hyundai", &["Santa Fe", "Tucson", "Kona", "Elantra"]),
    ("Kia", &["Telluride", "Sorento", "Sportage", "EV6"]),
    ("Volkswagen", &["Jetta", "Golf", "Tiguan", "Atlas"]),
    ("Volvo", &["XC40", "XC60", "XC90", "S60"]),
    ("Audi", &["A4", "Q5", "Q7", "e-tron"]),
    ("Lexus", &["RX350", "NX300", "IS300", "GX460"]),
    ("Mazda", &["CX-5", "CX-50", "CX-30", "Mazda3"]),
    ("GMC", &["Sierra", "Yukon", "Acadia", "Canyon"]),
    ("Dodge", &["Ram", "Durango", "Charger"]),
    ("Cadillac", &["Escalade", "XT5", "Lyriq"]),
];

const COLORS: &[&str] = &[
    "black", "white", "silver", "gray", "blue", "red", "green", "orange", "navy", "gold",
];
const FLEETS: &[&str] = &[
    "alpha", "bravo", "charlie", "delta", "omega", "metro", "rural", "long-haul",
];
const STATUSES: &[&str] = &["active", "maintenance", "idle"];
const FUELS: &[&str] = &["gasoline", "diesel", "hybrid", "electric"];
const TRIMS: &[&str] = &["base", "sport", "luxury", "offroad"];
const VIN_SOURCES: &[&str] = &["oem", "aftermarket", "telematics"];

const GEOFENCE_TYPES: &[&str] = &[
    "warehouse",
    "customer",
    "yard",
    "hub",
    "service-area",
    "restricted",
    "depot",
];
const GEOFENCE_TAGS: &[&str] = &[
    "priority",
    "urban",
    "suburban",
    "high-traffic",
    "rural",
    "cold",
    "hot",
    "coastal",
    "mountain",
];
const CITY_NAMES: &[&str] = &[
    "Seattle", "Portland", "San Francisco", "Los Angeles", "San Diego", "Phoenix", "Denver",
    "Dallas", "Houston", "Austin", "Chicago", "Detroit", "Boston", "New York", "Philadelphia",
    "Baltimore", "Charlotte", "Miami", "Orlando", "Atlanta", "Nashville", "Cleveland",
    "Pittsburgh", "Columbus", "Indianapolis", "Kansas City", "St Louis", "Minneapolis", "Omaha",
    "Boise", "Salt Lake", "Las Vegas", "Reno", "Birmingham", "New Orleans", "Memphis", "Richmond",
    "Buffalo", "Albany", "Hartford", "Providence", "Raleigh", "Charleston", "Savannah", "Tampa",
    "Tucson", "El Paso", "Anchorage", "Honolulu",
];
const ADJECTIVES: &[&str] = &[
    "North", "South", "East", "West", "Central", "Upper", "Lower", "River", "Lake", "Harbor",
    "Gateway",
];
const SPEED_LIMITS: &[u32] = &[25, 35, 45, 55, 65];
const ACCESS: &[&str] = &["public", "private", "staff-only", "customer"];
const PRIORITIES: &[&str] = &["critical", "normal", "low"];
const TIMEZONES: &[&str] = &[
    "America/New_York",
    "America/Chicago",
    "America/Denver",
    "America/Los_Angeles",
];
const NOTES: &[&str] = &["staging", "inbound", "outbound", "mixed", "overnight"];

/// Continental United States.
pub const CONTINENTAL_US: Bounds = Bounds {
    min_lon: -124.8,
    min_lat: 24.5,
    max_lon: -66.9,
    max_lat: 49.5,
};

/// Size and shape of a synthetic fleet.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeedConfig {
    /// Default: 60000
    pub vehicle_count: usize,
    /// Default: 120000
    pub geofence_count: usize,
    /// Draws per identifier before giving up on finding an unused one.
    /// Default: 64
    pub max_identifier_attempts: u32,
    /// Vehicle positions and geofence centers are drawn from this box.
    /// Default: continental US
    pub area: Bounds,
    /// Geofences are squares with a half-size drawn from this range, in degrees.
    /// Default: 0.01..0.12
    pub min_half_size_deg: f64,
    pub max_half_size_deg: f64,
    /// First model year; the last is the current year.
    /// Default: 2005
    pub first_model_year: u16,
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self {
            vehicle_count: 60_000,
            geofence_count: 120_000,
            max_identifier_attempts: 64,
            area: CONTINENTAL_US,
            min_half_size_deg: 0.01,
            max_half_size_deg: 0.12,
            first_model_year: 2005,
        }
    }
}

impl SeedConfig {
    pub fn with_counts(vehicle_count: usize, geofence_count: usize) -> Self {
        Self {
            vehicle_count,
            geofence_count,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        let a = &self.area;
        if !(a.min_lon < a.max_lon && a.min_lat < a.max_lat)
            || !GeoPoint::new(a.min_lon, a.min_lat).is_valid()
            || !GeoPoint::new(a.max_lon, a.max_lat).is_valid()
        {
            return Err(FleetError::Config(format!("invalid seed area {:?}", a)));
        }
        if !(self.min_half_size_deg > 0.0 && self.min_half_size_deg <= self.max_half_size_deg) {
            return Err(FleetError::Config(format!(
                "invalid geofence half-size range {}..{}",
                self.min_half_size_deg, self.max_half_size_deg
            )));
        }
        if self.max_identifier_attempts == 0 {
            return Err(FleetError::Config(
                "max_identifier_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of a seeding run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedReport {
    pub geofences_created: usize,
    pub vehicles_created: usize,
    /// Id of the first geofence created by this run (0 when none)
    pub first_geofence_id: GeofenceId,
    /// Id of the first vehicle created by this run (0 when none)
    pub first_vehicle_id: VehicleId,
    pub cancelled: bool,
}

/// Random vehicle and geofence generator.
#[derive(Debug, Clone)]
pub struct SyntheticFleet {
    config: SeedConfig,
    speed: Normal<f64>,
    last_model_year: u16,
}

impl SyntheticFleet {
    pub fn new(config: SeedConfig) -> Result<Self> {
        config.validate()?;
        let speed = Normal::new(60.0, 20.0)
            .map_err(|e| FleetError::Config(format!("speed distribution: {}", e)))?;
        let this_year = u16::try_from(Utc::now().year()).unwrap_or(config.first_model_year);
        Ok(Self {
            config,
            speed,
            last_model_year: this_year.max(config.first_model_year),
        })
    }

    pub fn config(&self) -> &SeedConfig {
        &self.config
    }

    pub fn random_vin<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        (0..VIN_LEN)
            .map(|_| VIN_CHARS[rng.gen_range(0..VIN_CHARS.len())] as char)
            .collect()
    }

    pub fn random_plate<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        let letters: String = (0..3)
            .map(|_| PLATE_CHARS[rng.gen_range(0..PLATE_CHARS.len())] as char)
            .collect();
        format!("{}-{:04}", letters, rng.gen_range(0..10_000))
    }

    pub fn random_point<R: Rng + ?Sized>(&self, rng: &mut R) -> GeoPoint {
        let a = &self.config.area;
        GeoPoint::new(
            rng.gen_range(a.min_lon..=a.max_lon),
            rng.gen_range(a.min_lat..=a.max_lat),
        )
    }

    /// Draw identifiers until `taken` rejects none of them.
    fn unique<R, G, T>(&self, rng: &mut R, kind: IdentifierKind, draw: G, taken: T) -> Result<String>
    where
        R: Rng + ?Sized,
        G: Fn(&Self, &mut R) -> String,
        T: Fn(&str) -> bool,
    {
        let attempts = self.config.max_identifier_attempts;
        for _ in 0..attempts {
            let candidate = draw(self, rng);
            if !taken(&candidate) {
                return Ok(candidate);
            }
            log::debug!("[SyntheticFleet] {} collision on {}, redrawing", kind, candidate);
        }
        Err(FleetError::IdentifierSpaceExhausted { kind, attempts })
    }

    /// A random vehicle with an initial position.
    ///
    /// `taken` reports whether an identifier of the given kind is already in
    /// use; colliding draws are regenerated.
    pub fn vehicle<R, T>(&self, rng: &mut R, taken: T) -> Result<(VehicleDraft, PositionDraft)>
    where
        R: Rng + ?Sized,
        T: Fn(IdentifierKind, &str) -> bool,
    {
        let (make, models) = MAKES_MODELS[rng.gen_range(0..MAKES_MODELS.len())];
        let model = pick(models, rng);
        let year = rng.gen_range(self.config.first_model_year..=self.last_model_year);
        let color = pick(COLORS, rng);

        let vin = self.unique(rng, IdentifierKind::Vin, Self::random_vin, |v| {
            taken(IdentifierKind::Vin, v)
        })?;
        let plate = self.unique(rng, IdentifierKind::LicensePlate, Self::random_plate, |p| {
            taken(IdentifierKind::LicensePlate, p)
        })?;

        let draft = VehicleDraft::new(&vin, &plate, make, model, year)
            .with_color(color)
            .with_attribute("fleet", pick(FLEETS, rng))
            .with_attribute("status", pick(STATUSES, rng))
            .with_attribute("fuel", pick(FUELS, rng))
            .with_attribute("trim", pick(TRIMS, rng))
            .with_attribute("odometer_km", rng.gen_range(1_000u32..=250_000))
            .with_attribute("vin_source", pick(VIN_SOURCES, rng));

        let position = PositionDraft::at(self.random_point(rng))
            .with_heading(rng.gen_range(0.0..360.0))
            .with_speed(self.speed.sample(rng).max(0.0));

        Ok((draft, position))
    }

    /// A random square geofence named after its sequence number `n`.
    pub fn geofence<R: Rng + ?Sized>(&self, rng: &mut R, n: usize) -> GeofenceDraft {
        let fence_type = pick(GEOFENCE_TYPES, rng);
        let name = format!(
            "{} {} Zone {}",
            pick(ADJECTIVES, rng),
            pick(CITY_NAMES, rng),
            n
        );
        let center = self.random_point(rng);
        let half = rng.gen_range(self.config.min_half_size_deg..=self.config.max_half_size_deg);
        let (x, y) = (center.longitude, center.latitude);
        let ring = vec![
            GeoPoint::new(x - half, y - half),
            GeoPoint::new(x + half, y - half),
            GeoPoint::new(x + half, y + half),
            GeoPoint::new(x - half, y + half),
            GeoPoint::new(x - half, y - half),
        ];

        let mut draft = GeofenceDraft::new(&name, fence_type, ring);
        // Three draws, duplicates collapse
        for _ in 0..3 {
            draft = draft.with_tag(pick(GEOFENCE_TAGS, rng));
        }
        draft
            .with_metadata("speed_limit_kph", *SPEED_LIMITS.choose(rng).unwrap_or(&35))
            .with_metadata("access", pick(ACCESS, rng))
            .with_metadata("priority", pick(PRIORITIES, rng))
            .with_metadata("timezone", pick(TIMEZONES, rng))
            .with_metadata("notes", pick(NOTES, rng))
            .with_metadata("fence_type", json!(fence_type))
    }
}

fn pick<'a, R: Rng + ?Sized>(options: &[&'a str], rng: &mut R) -> &'a str {
    options.choose(rng).copied().unwrap_or_default()
}
