//! Stateful fleet engine.
//!
//! [`FleetEngine`] owns the geofence index, the vehicle registry, the
//! position/history store and the fuzzy identifier indexes behind one
//! fleet-wide `RwLock`:
//!
//! - Seeding, wiping and registration take the write lock (maintenance
//!   window, exclusive with everything else).
//! - Queries, fuzzy lookups, batch updates and moves take the read lock and
//!   may run concurrently. Per-vehicle consistency during updates comes from
//!   the store's slot locks.
//!
//! ## Example
//! ```rust
//! use fleet_tracker::{CancelToken, FleetEngine, SeedConfig};
//! use rand::SeedableRng;
//! use rand_chacha::ChaCha8Rng;
//!
//! let engine = FleetEngine::new();
//! let mut rng = ChaCha8Rng::seed_from_u64(42);
//! let cancel = CancelToken::new();
//!
//! engine.seed(&SeedConfig::with_counts(50, 20), &mut rng, &cancel).unwrap();
//! let report = engine.update_positions(&mut rng, &cancel).unwrap();
//! assert_eq!(report.committed, 50);
//!
//! let top = engine.top_geofences(3, 5).unwrap();
//! assert_eq!(top.len(), 3);
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    BatchReport, CancelToken, ContainmentQueryEngine, FleetError, FleetStore, FuzzyConfig,
    FuzzyMatch, Geofence, GeofenceDraft, GeofenceId, GeofenceOccupancy, IdentifierKind,
    MoveConfig, MoveReport, OptionExt, PositionDraft, PositionHistoryRecord, PositionStore,
    Result, SeedConfig, SeedReport, SpatialIndex, SyntheticFleet, TrigramIndex, UpdateConfig,
    UpdatePipeline, Vehicle, VehicleDraft, VehicleId, VehiclePosition, VehicleSummary,
};

// ============================================================================
// Snapshots and Stats
// ============================================================================

/// Complete fleet state, as loaded from or written to storage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetSnapshot {
    pub vehicles: Vec<Vehicle>,
    pub geofences: Vec<Geofence>,
    pub positions: Vec<(VehicleId, VehiclePosition)>,
    /// Sequence number for the next history record
    pub next_history_seq: u64,
}

/// Entity counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub vehicles: usize,
    pub geofences: usize,
    pub positions: usize,
    /// History records held in memory (appended since creation, restore or
    /// the last release)
    pub history_records: usize,
    pub next_history_seq: u64,
}

// ============================================================================
// Engine State
// ============================================================================

#[derive(Debug)]
struct FleetState {
    index: SpatialIndex,
    vehicles: BTreeMap<VehicleId, Vehicle>,
    vin_owner: HashMap<String, VehicleId>,
    plate_owner: HashMap<String, VehicleId>,
    store: FleetStore,
    vin_index: TrigramIndex,
    plate_index: TrigramIndex,
    name_index: TrigramIndex,
    next_vehicle_id: VehicleId,
    next_geofence_id: GeofenceId,
}

impl Default for FleetState {
    fn default() -> Self {
        Self {
            index: SpatialIndex::new(),
            vehicles: BTreeMap::new(),
            vin_owner: HashMap::new(),
            plate_owner: HashMap::new(),
            store: FleetStore::new(),
            vin_index: TrigramIndex::new(),
            plate_index: TrigramIndex::new(),
            name_index: TrigramIndex::new(),
            next_vehicle_id: 1,
            next_geofence_id: 1,
        }
    }
}

impl FleetState {
    fn identifier_taken(&self, kind: IdentifierKind, value: &str) -> bool {
        match kind {
            IdentifierKind::Vin => self.vin_owner.contains_key(value),
            IdentifierKind::LicensePlate => self.plate_owner.contains_key(value),
        }
    }

    fn add_geofence(&mut self, draft: GeofenceDraft) -> Result<GeofenceId> {
        let id = self.next_geofence_id;
        let geofence = draft.into_geofence(id)?;
        self.name_index.insert(id, &geofence.name);
        self.index.insert(geofence);
        self.next_geofence_id += 1;
        Ok(id)
    }

    fn add_vehicle(&mut self, draft: VehicleDraft, position: PositionDraft) -> Result<VehicleId> {
        for (kind, value) in [
            (IdentifierKind::Vin, &draft.vin),
            (IdentifierKind::LicensePlate, &draft.license_plate),
        ] {
            if self.identifier_taken(kind, value) {
                return Err(FleetError::UniquenessCollision {
                    kind,
                    value: value.clone(),
                });
            }
        }

        let id = self.next_vehicle_id;
        self.store.register(id, position)?;
        self.index_vehicle(draft.into_vehicle(id));
        self.next_vehicle_id += 1;
        Ok(id)
    }

    fn index_vehicle(&mut self, vehicle: Vehicle) {
        self.vin_owner.insert(vehicle.vin.clone(), vehicle.id);
        self.plate_owner.insert(vehicle.license_plate.clone(), vehicle.id);
        self.vin_index.insert(vehicle.id, &vehicle.vin);
        self.plate_index.insert(vehicle.id, &vehicle.license_plate);
        self.vehicles.insert(vehicle.id, vehicle);
    }

    fn queries(&self) -> ContainmentQueryEngine<'_> {
        ContainmentQueryEngine::new(
            &self.index,
            &self.vehicles,
            &self.store.positions,
            &self.name_index,
        )
    }
}

// ============================================================================
// Fleet Engine
// ============================================================================

/// Thread-safe fleet engine. Share it behind an `Arc`.
#[derive(Debug, Default)]
pub struct FleetEngine {
    state: RwLock<FleetState>,
    fuzzy: FuzzyConfig,
    update: UpdateConfig,
    moves: MoveConfig,
}

impl FleetEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fuzzy_config(mut self, config: FuzzyConfig) -> Self {
        self.fuzzy = config;
        self
    }

    pub fn with_update_config(mut self, config: UpdateConfig) -> Self {
        self.update = config;
        self
    }

    pub fn with_move_config(mut self, config: MoveConfig) -> Self {
        self.moves = config;
        self
    }

    pub fn fuzzy_config(&self) -> &FuzzyConfig {
        &self.fuzzy
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, FleetState>> {
        self.state
            .read()
            .map_err(|_| FleetError::LockPoisoned("fleet state"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, FleetState>> {
        self.state
            .write()
            .map_err(|_| FleetError::LockPoisoned("fleet state"))
    }

    // ------------------------------------------------------------------------
    // Registration and maintenance
    // ------------------------------------------------------------------------

    /// Register a geofence. Fails with `InvalidGeometry` on a malformed ring.
    pub fn add_geofence(&self, draft: GeofenceDraft) -> Result<GeofenceId> {
        let mut state = self.write()?;
        state.add_geofence(draft).map_err(|e| {
            log::warn!("[FleetEngine] Rejected geofence: {}", e);
            e
        })
    }

    /// Register a vehicle with its initial position (and the paired history
    /// record). Fails with `UniquenessCollision` if the VIN or plate is taken.
    pub fn add_vehicle(&self, draft: VehicleDraft, position: PositionDraft) -> Result<VehicleId> {
        self.write()?.add_vehicle(draft, position)
    }

    /// Generate and register a synthetic fleet: geofences first, then
    /// vehicles with initial positions.
    ///
    /// Runs inside the maintenance window. The cancel token is checked
    /// between entities; whatever was created before cancellation stays.
    pub fn seed<R: Rng + ?Sized>(
        &self,
        config: &SeedConfig,
        rng: &mut R,
        cancel: &CancelToken,
    ) -> Result<SeedReport> {
        let generator = SyntheticFleet::new(*config)?;
        let mut state = self.write()?;
        let mut report = SeedReport::default();

        log::info!(
            "[FleetEngine] Seeding {} geofences and {} vehicles",
            config.geofence_count,
            config.vehicle_count
        );

        for n in 0..config.geofence_count {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let id = state.add_geofence(generator.geofence(rng, n))?;
            if report.geofences_created == 0 {
                report.first_geofence_id = id;
            }
            report.geofences_created += 1;
            if report.geofences_created % 10_000 == 0 {
                log::info!(
                    "[FleetEngine] geofences: {}/{}",
                    report.geofences_created,
                    config.geofence_count
                );
            }
        }

        for _ in 0..config.vehicle_count {
            if report.cancelled || cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let (draft, position) =
                generator.vehicle(rng, |kind, value| state.identifier_taken(kind, value))?;
            let id = state.add_vehicle(draft, position)?;
            if report.vehicles_created == 0 {
                report.first_vehicle_id = id;
            }
            report.vehicles_created += 1;
            if report.vehicles_created % 10_000 == 0 {
                log::info!(
                    "[FleetEngine] vehicles: {}/{}",
                    report.vehicles_created,
                    config.vehicle_count
                );
            }
        }

        log::info!(
            "[FleetEngine] Seeded {} geofences, {} vehicles{}",
            report.geofences_created,
            report.vehicles_created,
            if report.cancelled { " (cancelled)" } else { "" }
        );
        Ok(report)
    }

    /// Remove every entity and restart all id and sequence counters at 1.
    pub fn wipe(&self) -> Result<()> {
        let mut state = self.write()?;
        *state = FleetState::default();
        log::info!("[FleetEngine] Wiped all fleet state");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------------

    pub fn vehicle(&self, id: VehicleId) -> Result<Vehicle> {
        self.read()?.vehicles.get(&id).cloned().ok_or_vehicle(id)
    }

    pub fn geofence(&self, id: GeofenceId) -> Result<Geofence> {
        self.read()?.index.get(id).cloned().ok_or_geofence(id)
    }

    pub fn position(&self, id: VehicleId) -> Result<VehiclePosition> {
        self.read()?.store.positions.get(id)
    }

    /// Fuzzy search over VINs.
    pub fn search_vin(&self, query: &str, limit: usize) -> Result<Vec<FuzzyMatch>> {
        Ok(self.read()?.vin_index.search(query, limit, &self.fuzzy))
    }

    /// Fuzzy search over license plates.
    pub fn search_plate(&self, query: &str, limit: usize) -> Result<Vec<FuzzyMatch>> {
        Ok(self.read()?.plate_index.search(query, limit, &self.fuzzy))
    }

    /// Best fuzzy match on geofence names.
    pub fn find_geofence_by_name(&self, name: &str) -> Result<Option<(Geofence, f64)>> {
        let state = self.read()?;
        Ok(state
            .queries()
            .find_geofence_by_name(name, &self.fuzzy)
            .map(|(g, score)| (g.clone(), score)))
    }

    // ------------------------------------------------------------------------
    // Containment
    // ------------------------------------------------------------------------

    pub fn vehicles_in(&self, geofence_id: GeofenceId, limit: usize) -> Result<Vec<VehicleSummary>> {
        self.read()?.queries().vehicles_in(geofence_id, limit)
    }

    pub fn top_geofences(&self, top_n: usize, sample_limit: usize) -> Result<Vec<GeofenceOccupancy>> {
        self.read()?
            .queries()
            .top_geofences_by_occupancy(top_n, sample_limit)
    }

    // ------------------------------------------------------------------------
    // Updates
    // ------------------------------------------------------------------------

    /// One random-walk step for every vehicle.
    pub fn update_positions<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        cancel: &CancelToken,
    ) -> Result<BatchReport> {
        let state = self.read()?;
        UpdatePipeline::new(&state.store, &state.index).run_batch(&self.update, rng, cancel)
    }

    /// Move up to `count` random vehicles into a geofence.
    pub fn move_vehicles<R: Rng + ?Sized>(
        &self,
        geofence_id: GeofenceId,
        count: usize,
        rng: &mut R,
        cancel: &CancelToken,
    ) -> Result<MoveReport> {
        let state = self.read()?;
        UpdatePipeline::new(&state.store, &state.index)
            .with_move_config(self.moves)
            .move_into_geofence(geofence_id, count, rng, cancel)
    }

    // ------------------------------------------------------------------------
    // History and state transfer
    // ------------------------------------------------------------------------

    /// History records with a sequence number greater than `seq`.
    pub fn history_since(&self, seq: u64) -> Result<Vec<PositionHistoryRecord>> {
        self.read()?.store.history.since(seq)
    }

    pub fn history_for(&self, vehicle_id: VehicleId) -> Result<Vec<PositionHistoryRecord>> {
        self.read()?.store.history.records_for(vehicle_id)
    }

    /// Drop in-memory history up to and including `seq` after it has been
    /// written to durable storage. Sequence numbering is unaffected.
    pub fn release_history_through(&self, seq: u64) -> Result<usize> {
        let released = self.read()?.store.history.truncate_through(seq)?;
        log::debug!("[FleetEngine] Released {} history records through {}", released, seq);
        Ok(released)
    }

    pub fn stats(&self) -> Result<EngineStats> {
        let state = self.read()?;
        Ok(EngineStats {
            vehicles: state.vehicles.len(),
            geofences: state.index.len(),
            positions: state.store.positions.len(),
            history_records: state.store.history.len()?,
            next_history_seq: state.store.history.next_seq()?,
        })
    }

    pub fn snapshot(&self) -> Result<FleetSnapshot> {
        let state = self.read()?;
        Ok(FleetSnapshot {
            vehicles: state.vehicles.values().cloned().collect(),
            geofences: state.index.geofences().cloned().collect(),
            positions: state.store.positions.snapshot()?,
            next_history_seq: state.store.history.next_seq()?,
        })
    }

    /// Rebuild an engine from stored state. Geofence rings are revalidated
    /// and every position must belong to a known vehicle.
    pub fn from_snapshot(snapshot: FleetSnapshot) -> Result<Self> {
        let mut state = FleetState::default();

        let mut geofences = Vec::with_capacity(snapshot.geofences.len());
        for g in snapshot.geofences {
            let id = g.id;
            let mut draft = GeofenceDraft::new(&g.name, &g.fence_type, g.boundary);
            draft.tags = g.tags;
            draft.metadata = g.metadata;
            let geofence = draft.into_geofence(id)?;
            state.name_index.insert(id, &geofence.name);
            state.next_geofence_id = state.next_geofence_id.max(id + 1);
            geofences.push(geofence);
        }
        state.index = SpatialIndex::from_geofences(geofences);

        for vehicle in snapshot.vehicles {
            state.next_vehicle_id = state.next_vehicle_id.max(vehicle.id + 1);
            state.index_vehicle(vehicle);
        }

        let mut positions = PositionStore::new();
        for (id, position) in snapshot.positions {
            if !state.vehicles.contains_key(&id) {
                return Err(FleetError::VehicleNotFound(id));
            }
            positions.insert(id, position);
        }
        state.store = FleetStore::restore(positions, snapshot.next_history_seq);

        log::info!(
            "[FleetEngine] Restored {} vehicles, {} geofences",
            state.vehicles.len(),
            state.index.len()
        );

        Ok(Self {
            state: RwLock::new(state),
            ..Self::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GeoPoint;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::sync::Arc;
    use std::thread;

    fn unit_square() -> Vec<GeoPoint> {
        vec![
            GeoPoint::new(0.0, 0.0),
            GeoPoint::new(1.0, 0.0),
            GeoPoint::new(1.0, 1.0),
            GeoPoint::new(0.0, 1.0),
            GeoPoint::new(0.0, 0.0),
        ]
    }

    fn small_fleet(seed: u64) -> FleetEngine {
        let engine = FleetEngine::new();
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        engine
            .seed(&SeedConfig::with_counts(200, 100), &mut rng, &CancelToken::new())
            .unwrap();
        engine
    }

    #[test]
    fn test_add_and_query() {
        let engine = FleetEngine::new();
        let fence = engine
            .add_geofence(GeofenceDraft::new("Depot", "depot", unit_square()))
            .unwrap();
        let inside = engine
            .add_vehicle(
                VehicleDraft::new("1HGCM82633A004352", "ABC-1234", "Honda", "Civic", 2020),
                PositionDraft::at(GeoPoint::new(0.5, 0.5)),
            )
            .unwrap();
        engine
            .add_vehicle(
                VehicleDraft::new("1HGCM82633A004353", "ABC-1235", "Honda", "Civic", 2021),
                PositionDraft::at(GeoPoint::new(2.0, 2.0)),
            )
            .unwrap();

        let result = engine.vehicles_in(fence, 10).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].vehicle_id, inside);
        assert_eq!(result[0].license_plate, "ABC-1234");
    }

    #[test]
    fn test_duplicate_identifiers_rejected() {
        let engine = FleetEngine::new();
        let pos = PositionDraft::at(GeoPoint::new(0.0, 0.0));
        let first = VehicleDraft::new("VIN00000000000001", "AAA-0001", "Ford", "Edge", 2019);
        let second = VehicleDraft::new("VIN00000000000002", "AAA-0001", "Ford", "Edge", 2019);
        engine.add_vehicle(first, pos).unwrap();
        let err = engine.add_vehicle(second, pos).unwrap_err();
        assert!(matches!(
            err,
            FleetError::UniquenessCollision {
                kind: IdentifierKind::LicensePlate,
                ..
            }
        ));
        assert_eq!(engine.stats().unwrap().vehicles, 1);
    }

    #[test]
    fn test_invalid_geofence_rejected() {
        let engine = FleetEngine::new();
        let mut ring = unit_square();
        ring.pop();
        let err = engine
            .add_geofence(GeofenceDraft::new("Broken", "yard", ring))
            .unwrap_err();
        assert!(matches!(err, FleetError::InvalidGeometry { .. }));
        assert_eq!(engine.stats().unwrap().geofences, 0);
    }

    #[test]
    fn test_seed_counts_and_pairing() {
        let engine = small_fleet(1);
        let stats = engine.stats().unwrap();
        assert_eq!(stats.vehicles, 200);
        assert_eq!(stats.geofences, 100);
        assert_eq!(stats.positions, 200);
        assert_eq!(stats.history_records, 200);
        assert_eq!(stats.next_history_seq, 201);

        let v = engine.vehicle(17).unwrap();
        let pos = engine.position(17).unwrap();
        let history = engine.history_for(17).unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].matches(&pos));
        assert_eq!(v.vin.len(), 17);
    }

    #[test]
    fn test_seed_cancelled() {
        let engine = FleetEngine::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let report = engine
            .seed(&SeedConfig::with_counts(10, 10), &mut rng, &cancel)
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.vehicles_created, 0);
        assert_eq!(report.geofences_created, 0);
    }

    #[test]
    fn test_fuzzy_lookups() {
        let engine = small_fleet(2);
        let v = engine.vehicle(5).unwrap();

        let hits = engine.search_vin(&v.vin, 10).unwrap();
        assert_eq!(hits[0].id, 5);
        assert_eq!(hits[0].score, 1.0);

        let hits = engine.search_plate(&v.license_plate.to_lowercase(), 3).unwrap();
        assert_eq!(hits[0].id, 5);
        assert!(hits.len() <= 3);

        let g = engine.geofence(7).unwrap();
        let (found, score) = engine.find_geofence_by_name(&g.name).unwrap().unwrap();
        assert_eq!(score, 1.0);
        assert_eq!(found.id, 7);
    }

    #[test]
    fn test_move_then_query() {
        let engine = small_fleet(3);
        let mut rng = ChaCha8Rng::seed_from_u64(30);
        let report = engine
            .move_vehicles(4, 5, &mut rng, &CancelToken::new())
            .unwrap();
        assert_eq!(report.moved.len(), 5);

        let inside: Vec<VehicleId> = engine
            .vehicles_in(4, 1000)
            .unwrap()
            .into_iter()
            .map(|v| v.vehicle_id)
            .collect();
        for id in &report.moved {
            assert!(inside.contains(id));
        }

        let top = engine.top_geofences(1, 3).unwrap();
        assert!(top[0].vehicle_count >= 5);
        assert!(top[0].vehicles.len() <= 3);
    }

    #[test]
    fn test_wipe_resets_everything() {
        let engine = small_fleet(4);
        engine.wipe().unwrap();
        assert!(engine.top_geofences(1, 10).unwrap().is_empty());
        let expected = EngineStats {
            next_history_seq: 1,
            ..EngineStats::default()
        };
        assert_eq!(engine.stats().unwrap(), expected);
        assert!(engine.search_vin("ABC", 10).unwrap().is_empty());

        let id = engine
            .add_geofence(GeofenceDraft::new("Fresh", "yard", unit_square()))
            .unwrap();
        assert_eq!(id, 1);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let engine = small_fleet(5);
        let mut rng = ChaCha8Rng::seed_from_u64(50);
        engine.update_positions(&mut rng, &CancelToken::new()).unwrap();

        let snapshot = engine.snapshot().unwrap();
        assert_eq!(snapshot.next_history_seq, 401);
        let restored = FleetEngine::from_snapshot(snapshot.clone()).unwrap();
        assert_eq!(restored.snapshot().unwrap(), snapshot);
        assert_eq!(
            restored.top_geofences(5, 2).unwrap(),
            engine.top_geofences(5, 2).unwrap()
        );

        // Identifiers stay unique and ids continue after the restored maximum
        let id = restored
            .add_geofence(GeofenceDraft::new("Extra", "yard", unit_square()))
            .unwrap();
        assert_eq!(id, 101);
    }

    #[test]
    fn test_snapshot_with_orphan_position() {
        let engine = small_fleet(6);
        let mut snapshot = engine.snapshot().unwrap();
        let pos = snapshot.positions[0].1;
        snapshot.positions.push((9999, pos));
        let err = FleetEngine::from_snapshot(snapshot).unwrap_err();
        assert!(matches!(err, FleetError::VehicleNotFound(9999)));
    }

    #[test]
    fn test_released_history_stays_bounded_across_batches() {
        let engine = small_fleet(8);
        let mut rng = ChaCha8Rng::seed_from_u64(80);
        let cancel = CancelToken::new();

        let mut persisted = engine.stats().unwrap().next_history_seq - 1;
        assert_eq!(engine.release_history_through(persisted).unwrap(), 200);

        for round in 1..=6u64 {
            engine.update_positions(&mut rng, &cancel).unwrap();
            let written = engine.history_since(persisted).unwrap();
            assert_eq!(written.len(), 200);
            persisted = written.last().unwrap().seq;
            engine.release_history_through(persisted).unwrap();

            let stats = engine.stats().unwrap();
            assert_eq!(stats.history_records, 0);
            assert_eq!(stats.next_history_seq, 201 + round * 200);
        }
    }

    #[test]
    fn test_queries_run_during_updates() {
        let engine = Arc::new(small_fleet(7));
        let updater = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let mut rng = ChaCha8Rng::seed_from_u64(70);
                for _ in 0..5 {
                    engine.update_positions(&mut rng, &CancelToken::new()).unwrap();
                }
            })
        };
        for _ in 0..5 {
            let top = engine.top_geofences(3, 2).unwrap();
            assert_eq!(top.len(), 3);
        }
        updater.join().unwrap();

        // 200 seeded + 5 batches of 200
        assert_eq!(engine.stats().unwrap().history_records, 1200);
        for id in [1, 100, 200] {
            let pos = engine.position(id).unwrap();
            let history = engine.history_for(id).unwrap();
            assert_eq!(history.len(), 6);
            assert!(history.last().unwrap().matches(&pos));
        }
    }
}
