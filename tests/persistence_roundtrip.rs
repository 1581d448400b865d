//! File-backed persistence integration tests.
//!
//! Exercises the same flow as the CLI: open a database file, load it into an
//! engine, run a command, write the new history back, then reopen and check
//! that the stored state matches the engine.
//!
//! Run with: `cargo test --test persistence_roundtrip`

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tempfile::TempDir;

use fleet_tracker::{CancelToken, FleetDatabase, FleetEngine, SeedConfig};

/// Helper: temp dir plus a database file path inside it.
fn temp_database() -> (TempDir, String) {
    let tmp_dir = TempDir::new().expect("failed to create temp dir");
    let path = tmp_dir
        .path()
        .join("fleet.db")
        .to_str()
        .expect("temp path is not UTF-8")
        .to_string();
    (tmp_dir, path)
}

/// Helper: seed a fresh database file and return the engine that did it.
fn seed_database(path: &str, vehicles: usize, geofences: usize, seed: u64) -> FleetEngine {
    let mut db = FleetDatabase::open(path).expect("failed to open db");
    let engine = FleetEngine::from_snapshot(db.load().expect("load")).expect("restore");
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let config = SeedConfig::with_counts(vehicles, geofences);
    engine
        .seed(&config, &mut rng, &CancelToken::new())
        .expect("seed");

    let snapshot = engine.snapshot().expect("snapshot");
    let history = engine.history_since(0).expect("history");
    db.insert_seed(&snapshot.geofences, &snapshot.vehicles, &history)
        .expect("insert seed");
    engine
}

// ============================================================================
// Test: Seed, Reopen, Load
// ============================================================================

#[test]
fn test_seed_survives_reopen() {
    let (_tmp, path) = temp_database();
    let engine = seed_database(&path, 40, 15, 7);

    let db = FleetDatabase::open(&path).expect("reopen");
    let counts = db.counts().expect("counts");
    assert_eq!(counts.vehicles, 40);
    assert_eq!(counts.geofences, 15);
    assert_eq!(counts.positions, 40);
    assert_eq!(counts.history, 40);

    let loaded = db.load().expect("load");
    let expected = engine.snapshot().expect("snapshot");
    assert_eq!(loaded.vehicles, expected.vehicles);
    assert_eq!(loaded.geofences, expected.geofences);
    assert_eq!(loaded.positions, expected.positions);
    assert_eq!(loaded.next_history_seq, 41);
}

// ============================================================================
// Test: Update Batches Across Process Boundaries
// ============================================================================

#[test]
fn test_updates_append_across_reopens() {
    let (_tmp, path) = temp_database();
    seed_database(&path, 25, 5, 11);

    // Two separate "invocations", each loading fresh from disk
    for round in 0..2u64 {
        let mut db = FleetDatabase::open(&path).expect("open");
        let engine = FleetEngine::from_snapshot(db.load().expect("load")).expect("restore");
        let before = engine.stats().expect("stats").next_history_seq - 1;
        assert_eq!(before, 25 * (round + 1));

        let mut rng = ChaCha8Rng::seed_from_u64(100 + round);
        let report = engine
            .update_positions(&mut rng, &CancelToken::new())
            .expect("update");
        assert_eq!(report.committed, 25);

        let records = engine.history_since(before).expect("history");
        assert_eq!(records.len(), 25);
        db.record_updates(&records).expect("record");
    }

    let db = FleetDatabase::open(&path).expect("reopen");
    let counts = db.counts().expect("counts");
    assert_eq!(counts.positions, 25);
    assert_eq!(counts.history, 75);

    // Stored position equals the newest history record for every vehicle
    let snapshot = db.load().expect("load");
    for (vehicle_id, position) in &snapshot.positions {
        let history = db.history_for(*vehicle_id).expect("history_for");
        assert_eq!(history.len(), 3);
        let newest = history.iter().max_by_key(|r| r.seq).expect("non-empty");
        assert!(newest.matches(position));
    }
}

// ============================================================================
// Test: Two Writers On One File
// ============================================================================

#[test]
fn test_concurrent_writers_both_persist() {
    let (_tmp, path) = temp_database();
    seed_database(&path, 30, 6, 13);

    // Both processes load the same state, so their in-memory sequences overlap
    let mut db_a = FleetDatabase::open(&path).expect("open a");
    let mut db_b = FleetDatabase::open(&path).expect("open b");
    let engine_a = FleetEngine::from_snapshot(db_a.load().expect("load a")).expect("restore a");
    let engine_b = FleetEngine::from_snapshot(db_b.load().expect("load b")).expect("restore b");
    let start_a = engine_a.stats().expect("stats").next_history_seq - 1;
    let start_b = engine_b.stats().expect("stats").next_history_seq - 1;
    assert_eq!(start_a, start_b);

    let mut rng_b = ChaCha8Rng::seed_from_u64(31);
    let moved = engine_b
        .move_vehicles(2, 8, &mut rng_b, &CancelToken::new())
        .expect("move");
    assert_eq!(moved.moved.len(), 8);
    let records_b = engine_b.history_since(start_b).expect("history b");
    db_b.record_updates(&records_b).expect("persist b");

    let mut rng_a = ChaCha8Rng::seed_from_u64(32);
    engine_a
        .update_positions(&mut rng_a, &CancelToken::new())
        .expect("update");
    let records_a = engine_a.history_since(start_a).expect("history a");
    assert_eq!(records_a.first().map(|r| r.seq), records_b.first().map(|r| r.seq));
    db_a.record_updates(&records_a).expect("persist a");

    let db = FleetDatabase::open(&path).expect("reopen");
    let counts = db.counts().expect("counts");
    assert_eq!(counts.history, 30 + 8 + 30);
    assert_eq!(counts.positions, 30);

    // A committed last, so every stored position is A's
    let snapshot = db.load().expect("load");
    assert_eq!(snapshot.next_history_seq, 30 + 8 + 30 + 1);
    for (vehicle_id, position) in &snapshot.positions {
        assert_eq!(engine_a.position(*vehicle_id).expect("position"), *position);
        let history = db.history_for(*vehicle_id).expect("history_for");
        assert!(history.last().expect("non-empty").matches(position));
        let expected = if moved.moved.contains(vehicle_id) { 3 } else { 2 };
        assert_eq!(history.len(), expected);
    }
}

// ============================================================================
// Test: Wipe Then Reseed
// ============================================================================

#[test]
fn test_wipe_then_reseed_restarts_ids() {
    let (_tmp, path) = temp_database();
    seed_database(&path, 10, 3, 1);

    {
        let mut db = FleetDatabase::open(&path).expect("open");
        db.wipe().expect("wipe");
        let counts = db.counts().expect("counts");
        assert_eq!(counts.vehicles, 0);
        assert_eq!(counts.history, 0);
    }

    let engine = seed_database(&path, 4, 2, 2);
    let db = FleetDatabase::open(&path).expect("reopen");
    let loaded = db.load().expect("load");
    assert_eq!(loaded.vehicles.first().map(|v| v.id), Some(1));
    assert_eq!(loaded.geofences.first().map(|g| g.id), Some(1));
    assert_eq!(loaded.next_history_seq, 5);
    assert!(engine.top_geofences(1, 0).is_ok());
}
