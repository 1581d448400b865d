//! Geometry kernel: point-in-polygon, bounding boxes and small planar
//! displacements on (longitude, latitude) coordinates.
//!
//! Rings are closed slices of [`GeoPoint`] (first vertex equals last) with at
//! least four entries. Containment is boundary-inclusive.

use geo::{BoundingRect, Coord, LineString};
use rand::Rng;

use crate::{Bounds, FleetError, GeoPoint, Result};

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Points closer than this (in degrees) to an edge count as on the boundary.
/// Bounding-box prefilters widen by the same margin.
pub const BOUNDARY_EPSILON: f64 = 1e-9;

/// Minimum ring length: a triangle plus the closing vertex.
pub const MIN_RING_VERTICES: usize = 4;

/// Check that `ring` is a usable polygon boundary.
pub fn validate_ring(ring: &[GeoPoint]) -> Result<()> {
    if ring.len() < MIN_RING_VERTICES {
        return Err(FleetError::invalid_geometry(format!(
            "ring has {} vertices, minimum {} required",
            ring.len(),
            MIN_RING_VERTICES
        )));
    }
    if ring
        .iter()
        .any(|p| !p.longitude.is_finite() || !p.latitude.is_finite())
    {
        return Err(FleetError::invalid_geometry("ring has non-finite coordinates"));
    }
    if ring[0] != ring[ring.len() - 1] {
        return Err(FleetError::invalid_geometry(
            "ring is not closed (first vertex != last vertex)",
        ));
    }
    Ok(())
}

/// Boundary-inclusive point-in-polygon test (even-odd rule).
///
/// Boundary hits are detected first, so points on any edge or vertex
/// (horizontal edges included) return `true`. The crossing count then skips
/// horizontal edges and treats each edge as half-open in latitude, so a ray
/// passing exactly through a vertex is counted once.
pub fn contains(ring: &[GeoPoint], point: GeoPoint) -> Result<bool> {
    validate_ring(ring)?;

    if ring
        .windows(2)
        .any(|edge| on_segment(edge[0], edge[1], point))
    {
        return Ok(true);
    }

    let (px, py) = (point.longitude, point.latitude);
    let mut inside = false;
    for edge in ring.windows(2) {
        let (a, b) = (edge[0], edge[1]);
        if a.latitude == b.latitude {
            continue;
        }
        if (a.latitude > py) != (b.latitude > py) {
            let x_cross = a.longitude
                + (py - a.latitude) * (b.longitude - a.longitude) / (b.latitude - a.latitude);
            if px < x_cross {
                inside = !inside;
            }
        }
    }
    Ok(inside)
}

fn on_segment(a: GeoPoint, b: GeoPoint, p: GeoPoint) -> bool {
    let min_x = a.longitude.min(b.longitude) - BOUNDARY_EPSILON;
    let max_x = a.longitude.max(b.longitude) + BOUNDARY_EPSILON;
    let min_y = a.latitude.min(b.latitude) - BOUNDARY_EPSILON;
    let max_y = a.latitude.max(b.latitude) + BOUNDARY_EPSILON;
    if p.longitude < min_x || p.longitude > max_x || p.latitude < min_y || p.latitude > max_y {
        return false;
    }

    let dx = b.longitude - a.longitude;
    let dy = b.latitude - a.latitude;
    let len = dx.hypot(dy);
    if len == 0.0 {
        // Degenerate edge (repeated vertex): the bbox check above already
        // reduced it to a point.
        return true;
    }
    let cross = dx * (p.latitude - a.latitude) - dy * (p.longitude - a.longitude);
    (cross / len).abs() <= BOUNDARY_EPSILON
}

/// Bounding box of a ring.
pub fn bounding_box(ring: &[GeoPoint]) -> Result<Bounds> {
    let line: LineString<f64> = ring.iter().map(|p| Coord::from(*p)).collect();
    let rect = line
        .bounding_rect()
        .ok_or_else(|| FleetError::invalid_geometry("cannot bound an empty ring"))?;
    Ok(Bounds {
        min_lon: rect.min().x,
        min_lat: rect.min().y,
        max_lon: rect.max().x,
        max_lat: rect.max().y,
    })
}

/// Translate `point` by `dx_m` meters east and `dy_m` meters north using an
/// equirectangular approximation around the starting latitude.
///
/// Results are clamped to valid coordinates rather than wrapped: fleets do not
/// operate across the antimeridian or the poles.
pub fn displace(point: GeoPoint, dx_m: f64, dy_m: f64) -> GeoPoint {
    let lat_rad = point.latitude.to_radians();
    let dlat = (dy_m / EARTH_RADIUS_M).to_degrees();
    let cos_lat = lat_rad.cos().abs().max(1e-12);
    let dlon = (dx_m / (EARTH_RADIUS_M * cos_lat)).to_degrees();

    GeoPoint::new(
        (point.longitude + dlon).clamp(-180.0, 180.0),
        (point.latitude + dlat).clamp(-90.0, 90.0),
    )
}

/// Map any finite heading into [0, 360).
pub fn normalize_heading(heading_deg: f64) -> f64 {
    let h = heading_deg.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360 for tiny negative inputs
    if h >= 360.0 {
        0.0
    } else {
        h
    }
}

/// Rejection-sample a point inside `ring`, drawing uniformly from `bounds`.
///
/// Returns `Ok(None)` when `max_attempts` draws all land outside, which only
/// happens for slivers or degenerate rings.
pub fn sample_interior<R: Rng + ?Sized>(
    ring: &[GeoPoint],
    bounds: &Bounds,
    rng: &mut R,
    max_attempts: u32,
) -> Result<Option<GeoPoint>> {
    validate_ring(ring)?;
    for _ in 0..max_attempts {
        let lon = if bounds.width() > 0.0 {
            rng.gen_range(bounds.min_lon..=bounds.max_lon)
        } else {
            bounds.min_lon
        };
        let lat = if bounds.height() > 0.0 {
            rng.gen_range(bounds.min_lat..=bounds.max_lat)
        } else {
            bounds.min_lat
        };
        let candidate = GeoPoint::new(lon, lat);
        if contains(ring, candidate)? {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}
