//! SQLite storage for fleet state.
//!
//! Schema:
//! - `vehicles`: identity and attributes (JSON text)
//! - `geofences`: name, type, tags and metadata (JSON text), the boundary
//!   ring as a MessagePack blob, and its bounding box as columns
//! - `vehicle_positions`: one row per vehicle, overwritten on update
//! - `vehicle_position_history`: append-only; row ids come from SQLite's
//!   AUTOINCREMENT counter
//!
//! Position changes are written with [`FleetDatabase::record_updates`], which
//! inserts each history record and upserts the matching position inside one
//! transaction. Several processes may write to the same file: each batch is
//! stored in its own in-memory sequence order, the database assigns the row
//! ids, and the last committed batch wins for a vehicle's current position.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row, Transaction};
use serde::{Deserialize, Serialize};

use crate::{
    Bounds, FleetSnapshot, GeoPoint, Geofence, PositionHistoryRecord, Result, Vehicle, VehicleId,
    VehiclePosition,
};

/// Row counts per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCounts {
    pub vehicles: usize,
    pub geofences: usize,
    pub positions: usize,
    pub history: usize,
}

/// SQLite-backed fleet store.
pub struct FleetDatabase {
    conn: Connection,
    path: String,
}

impl FleetDatabase {
    // ========================================================================
    // Initialization
    // ========================================================================

    /// Open (or create) a database file.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        log::info!("[FleetDatabase] Opened {}", path);
        Ok(Self {
            conn,
            path: path.to_string(),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS vehicles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                vin TEXT NOT NULL UNIQUE,
                license_plate TEXT NOT NULL UNIQUE,
                make TEXT NOT NULL,
                model TEXT NOT NULL,
                year INTEGER NOT NULL,
                color TEXT NOT NULL,
                attributes TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER DEFAULT (strftime('%s', 'now'))
            );

            CREATE TABLE IF NOT EXISTS geofences (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                fence_type TEXT NOT NULL,
                tags TEXT NOT NULL DEFAULT '[]',
                metadata TEXT NOT NULL DEFAULT '{}',
                boundary BLOB NOT NULL,
                vertex_count INTEGER NOT NULL,
                min_lon REAL NOT NULL,
                min_lat REAL NOT NULL,
                max_lon REAL NOT NULL,
                max_lat REAL NOT NULL,
                created_at INTEGER DEFAULT (strftime('%s', 'now'))
            );

            CREATE TABLE IF NOT EXISTS vehicle_positions (
                vehicle_id INTEGER PRIMARY KEY,
                longitude REAL NOT NULL,
                latitude REAL NOT NULL,
                heading_deg REAL NOT NULL,
                speed_kph REAL NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (vehicle_id) REFERENCES vehicles(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS vehicle_position_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                vehicle_id INTEGER NOT NULL,
                longitude REAL NOT NULL,
                latitude REAL NOT NULL,
                heading_deg REAL NOT NULL,
                speed_kph REAL NOT NULL,
                recorded_at TEXT NOT NULL,
                FOREIGN KEY (vehicle_id) REFERENCES vehicles(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_history_vehicle
                ON vehicle_position_history(vehicle_id, id);
            CREATE INDEX IF NOT EXISTS idx_geofences_bounds
                ON geofences(min_lon, max_lon, min_lat, max_lat);
        "#,
        )?;
        Ok(())
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Read the whole fleet. History rows are not loaded; the snapshot only
    /// carries a starting point for the in-memory sequence (one past the
    /// highest stored row id).
    pub fn load(&self) -> Result<FleetSnapshot> {
        let vehicles = self.load_vehicles()?;
        let geofences = self.load_geofences()?;
        let positions = self.load_positions()?;
        let next_history_seq: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(id), 0) + 1 FROM vehicle_position_history",
            [],
            |row| row.get(0),
        )?;

        log::info!(
            "[FleetDatabase] Loaded {} vehicles, {} geofences, {} positions",
            vehicles.len(),
            geofences.len(),
            positions.len()
        );

        Ok(FleetSnapshot {
            vehicles,
            geofences,
            positions,
            next_history_seq: next_history_seq as u64,
        })
    }

    fn load_vehicles(&self) -> Result<Vec<Vehicle>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, vin, license_plate, make, model, year, color, attributes
             FROM vehicles ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            let attributes: String = row.get(7)?;
            Ok(Vehicle {
                id: row.get::<_, i64>(0)? as VehicleId,
                vin: row.get(1)?,
                license_plate: row.get(2)?,
                make: row.get(3)?,
                model: row.get(4)?,
                year: row.get(5)?,
                color: row.get(6)?,
                attributes: from_json(7, &attributes)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn load_geofences(&self) -> Result<Vec<Geofence>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, fence_type, tags, metadata, boundary,
                    min_lon, min_lat, max_lon, max_lat
             FROM geofences ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            let tags: String = row.get(3)?;
            let metadata: String = row.get(4)?;
            let blob: Vec<u8> = row.get(5)?;
            let boundary: Vec<GeoPoint> = rmp_serde::from_slice(&blob).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(5, Type::Blob, Box::new(e))
            })?;
            Ok(Geofence {
                id: row.get::<_, i64>(0)? as u64,
                name: row.get(1)?,
                fence_type: row.get(2)?,
                tags: from_json(3, &tags)?,
                metadata: from_json(4, &metadata)?,
                boundary,
                bounds: Bounds {
                    min_lon: row.get(6)?,
                    min_lat: row.get(7)?,
                    max_lon: row.get(8)?,
                    max_lat: row.get(9)?,
                },
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn load_positions(&self) -> Result<Vec<(VehicleId, VehiclePosition)>> {
        let mut stmt = self.conn.prepare(
            "SELECT vehicle_id, longitude, latitude, heading_deg, speed_kph, updated_at
             FROM vehicle_positions ORDER BY vehicle_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)? as VehicleId,
                VehiclePosition {
                    point: GeoPoint::new(row.get(1)?, row.get(2)?),
                    heading_deg: row.get(3)?,
                    speed_kph: row.get(4)?,
                    updated_at: timestamp(row, 5)?,
                },
            ))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Stored history for one vehicle, oldest first.
    pub fn history_for(&self, vehicle_id: VehicleId) -> Result<Vec<PositionHistoryRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, vehicle_id, longitude, latitude, heading_deg, speed_kph, recorded_at
             FROM vehicle_position_history WHERE vehicle_id = ? ORDER BY id",
        )?;
        let rows = stmt.query_map(params![vehicle_id as i64], |row| {
            Ok(PositionHistoryRecord {
                seq: row.get::<_, i64>(0)? as u64,
                vehicle_id: row.get::<_, i64>(1)? as VehicleId,
                point: GeoPoint::new(row.get(2)?, row.get(3)?),
                heading_deg: row.get(4)?,
                speed_kph: row.get(5)?,
                recorded_at: timestamp(row, 6)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ========================================================================
    // Writing
    // ========================================================================

    /// Store newly created geofences and vehicles together with their
    /// initial history records, in one transaction.
    pub fn insert_seed(
        &mut self,
        geofences: &[Geofence],
        vehicles: &[Vehicle],
        records: &[PositionHistoryRecord],
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO geofences
                    (id, name, fence_type, tags, metadata, boundary, vertex_count,
                     min_lon, min_lat, max_lon, max_lat)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?;
            for g in geofences {
                stmt.execute(params![
                    g.id as i64,
                    g.name,
                    g.fence_type,
                    serde_json::to_string(&g.tags)?,
                    serde_json::to_string(&g.metadata)?,
                    rmp_serde::to_vec(&g.boundary)?,
                    g.boundary.len() as i64,
                    g.bounds.min_lon,
                    g.bounds.min_lat,
                    g.bounds.max_lon,
                    g.bounds.max_lat,
                ])?;
            }
        }
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO vehicles
                    (id, vin, license_plate, make, model, year, color, attributes)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )?;
            for v in vehicles {
                stmt.execute(params![
                    v.id as i64,
                    v.vin,
                    v.license_plate,
                    v.make,
                    v.model,
                    v.year,
                    v.color,
                    serde_json::to_string(&v.attributes)?,
                ])?;
            }
        }
        write_records(&tx, records)?;
        tx.commit()?;

        log::info!(
            "[FleetDatabase] Stored {} geofences, {} vehicles, {} history records",
            geofences.len(),
            vehicles.len(),
            records.len()
        );
        Ok(())
    }

    /// Append history records and upsert the positions they describe, in
    /// one transaction. Records are applied in sequence order so each
    /// vehicle's stored position ends up equal to its newest record.
    pub fn record_updates(&mut self, records: &[PositionHistoryRecord]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        write_records(&tx, records)?;
        tx.commit()?;
        log::debug!("[FleetDatabase] Recorded {} position updates", records.len());
        Ok(records.len())
    }

    /// Delete every row and reset the AUTOINCREMENT counters.
    pub fn wipe(&mut self) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute_batch(
            "DELETE FROM vehicle_position_history;
             DELETE FROM vehicle_positions;
             DELETE FROM vehicles;
             DELETE FROM geofences;
             DELETE FROM sqlite_sequence
                WHERE name IN ('vehicles', 'geofences', 'vehicle_position_history');",
        )?;
        tx.commit()?;
        log::info!("[FleetDatabase] Wiped {}", self.path);
        Ok(())
    }

    pub fn counts(&self) -> Result<StoredCounts> {
        let count = |table: &str| -> Result<usize> {
            let n: i64 = self
                .conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
            Ok(n as usize)
        };
        Ok(StoredCounts {
            vehicles: count("vehicles")?,
            geofences: count("geofences")?,
            positions: count("vehicle_positions")?,
            history: count("vehicle_position_history")?,
        })
    }
}

fn write_records(tx: &Transaction<'_>, records: &[PositionHistoryRecord]) -> Result<()> {
    let mut ordered: Vec<&PositionHistoryRecord> = records.iter().collect();
    ordered.sort_by_key(|r| r.seq);

    let mut history = tx.prepare_cached(
        "INSERT INTO vehicle_position_history
            (vehicle_id, longitude, latitude, heading_deg, speed_kph, recorded_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )?;
    let mut position = tx.prepare_cached(
        "INSERT OR REPLACE INTO vehicle_positions
            (vehicle_id, longitude, latitude, heading_deg, speed_kph, updated_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )?;
    for r in ordered {
        let at = r.recorded_at.to_rfc3339();
        history.execute(params![
            r.vehicle_id as i64,
            r.point.longitude,
            r.point.latitude,
            r.heading_deg,
            r.speed_kph,
            at,
        ])?;
        position.execute(params![
            r.vehicle_id as i64,
            r.point.longitude,
            r.point.latitude,
            r.heading_deg,
            r.speed_kph,
            at,
        ])?;
    }
    Ok(())
}

fn from_json<T: serde::de::DeserializeOwned>(idx: usize, text: &str) -> rusqlite::Result<T> {
    serde_json::from_str(text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
