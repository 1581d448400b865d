//! Current positions and the append-only position history.
//!
//! [`PositionStore`] keeps one slot per vehicle, each behind its own lock, so
//! writers for different vehicles never contend. [`HistoryLog`] is a single
//! append-only sequence. [`FleetStore::commit`] ties the two together: the
//! position overwrite and then the history append both happen while the
//! vehicle's slot lock is held, so a reader that sees a history record and
//! then reads the vehicle's position always sees the matching position.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;

use crate::{
    FleetError, GeoPoint, OptionExt, PositionDraft, PositionHistoryRecord, Result, VehicleId,
    VehiclePosition,
};

// ============================================================================
// Position Store
// ============================================================================

/// One current position per vehicle.
///
/// The set of vehicles is fixed between maintenance windows (`insert` and
/// `clear` need `&mut self`); positions inside existing slots are updated
/// through `&self`.
#[derive(Debug, Default)]
pub struct PositionStore {
    slots: BTreeMap<VehicleId, Mutex<VehiclePosition>>,
}

impl PositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a vehicle's slot. Returns the previous position.
    pub fn insert(&mut self, vehicle_id: VehicleId, position: VehiclePosition) -> Option<VehiclePosition> {
        self.slots
            .insert(vehicle_id, Mutex::new(position))
            .and_then(|old| old.into_inner().ok())
    }

    pub(crate) fn lock(&self, vehicle_id: VehicleId) -> Result<MutexGuard<'_, VehiclePosition>> {
        self.slots
            .get(&vehicle_id)
            .ok_or_vehicle(vehicle_id)?
            .lock()
            .map_err(|_| FleetError::LockPoisoned("position slot"))
    }

    pub fn get(&self, vehicle_id: VehicleId) -> Result<VehiclePosition> {
        Ok(*self.lock(vehicle_id)?)
    }

    /// Overwrite a vehicle's position. The vehicle must already have a slot.
    ///
    /// This bypasses the history log; batch updates go through
    /// [`FleetStore::commit`] instead.
    pub fn set(&self, vehicle_id: VehicleId, position: VehiclePosition) -> Result<()> {
        *self.lock(vehicle_id)? = position;
        Ok(())
    }

    pub fn contains(&self, vehicle_id: VehicleId) -> bool {
        self.slots.contains_key(&vehicle_id)
    }

    /// Vehicle ids in ascending order.
    pub fn ids(&self) -> Vec<VehicleId> {
        self.slots.keys().copied().collect()
    }

    /// Point-in-time copy of every position, ascending by vehicle id.
    ///
    /// Slots are read one at a time, so a snapshot taken during a batch may
    /// mix positions from before and after it.
    pub fn snapshot(&self) -> Result<Vec<(VehicleId, VehiclePosition)>> {
        self.slots
            .iter()
            .map(|(id, slot)| {
                slot.lock()
                    .map(|pos| (*id, *pos))
                    .map_err(|_| FleetError::LockPoisoned("position slot"))
            })
            .collect()
    }

    /// Same as [`snapshot`](Self::snapshot), points only.
    pub fn points(&self) -> Result<Vec<(VehicleId, GeoPoint)>> {
        Ok(self
            .snapshot()?
            .into_iter()
            .map(|(id, pos)| (id, pos.point))
            .collect())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

// ============================================================================
// History Log
// ============================================================================

#[derive(Debug)]
struct LogState {
    records: Vec<PositionHistoryRecord>,
    next_seq: u64,
}

/// Append-only history of position observations.
///
/// Sequence numbers start at 1 and increase by one per append. A log opened
/// over existing storage can continue an older sequence with
/// [`starting_at`](Self::starting_at); it then only holds records appended
/// since.
#[derive(Debug)]
pub struct HistoryLog {
    state: Mutex<LogState>,
}

impl Default for HistoryLog {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl HistoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(next_seq: u64) -> Self {
        Self {
            state: Mutex::new(LogState {
                records: Vec::new(),
                next_seq: next_seq.max(1),
            }),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, LogState>> {
        self.state
            .lock()
            .map_err(|_| FleetError::LockPoisoned("history log"))
    }

    /// Append a record, assigning its sequence number. Returns the stored
    /// record.
    pub fn append(&self, mut record: PositionHistoryRecord) -> Result<PositionHistoryRecord> {
        let mut state = self.state()?;
        record.seq = state.next_seq;
        state.next_seq += 1;
        state.records.push(record);
        Ok(record)
    }

    /// Number of records held in memory.
    pub fn len(&self) -> Result<usize> {
        Ok(self.state()?.records.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// The sequence number the next append will receive.
    pub fn next_seq(&self) -> Result<u64> {
        Ok(self.state()?.next_seq)
    }

    pub fn records(&self) -> Result<Vec<PositionHistoryRecord>> {
        Ok(self.state()?.records.clone())
    }

    /// Records for one vehicle, oldest first.
    pub fn records_for(&self, vehicle_id: VehicleId) -> Result<Vec<PositionHistoryRecord>> {
        Ok(self
            .state()?
            .records
            .iter()
            .filter(|r| r.vehicle_id == vehicle_id)
            .copied()
            .collect())
    }

    /// Records with a sequence number strictly greater than `seq`.
    pub fn since(&self, seq: u64) -> Result<Vec<PositionHistoryRecord>> {
        let state = self.state()?;
        // Records are stored in seq order
        let start = state.records.partition_point(|r| r.seq <= seq);
        Ok(state.records[start..].to_vec())
    }

    pub fn latest_for(&self, vehicle_id: VehicleId) -> Result<Option<PositionHistoryRecord>> {
        Ok(self
            .state()?
            .records
            .iter()
            .rev()
            .find(|r| r.vehicle_id == vehicle_id)
            .copied())
    }

    /// Release records with a sequence number up to and including `seq`,
    /// once they are stored elsewhere. The sequence keeps counting from
    /// where it was. Returns how many records were released.
    pub fn truncate_through(&self, seq: u64) -> Result<usize> {
        let mut state = self.state()?;
        let end = state.records.partition_point(|r| r.seq <= seq);
        state.records.drain(..end);
        Ok(end)
    }

    /// Drop every record and restart the sequence at 1.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.state()?;
        state.records.clear();
        state.next_seq = 1;
        Ok(())
    }
}

// ============================================================================
// Paired Commits
// ============================================================================

/// Positions and history, updated together.
#[derive(Debug, Default)]
pub struct FleetStore {
    pub positions: PositionStore,
    pub history: HistoryLog,
}

impl FleetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap restored positions, continuing the history sequence at `next_seq`.
    pub fn restore(positions: PositionStore, next_seq: u64) -> Self {
        Self {
            positions,
            history: HistoryLog::starting_at(next_seq),
        }
    }

    /// Give a new vehicle its first position and the paired history record.
    pub fn register(
        &mut self,
        vehicle_id: VehicleId,
        draft: PositionDraft,
    ) -> Result<PositionHistoryRecord> {
        let position = checked(vehicle_id, draft)?;
        let previous = self.positions.insert(vehicle_id, position);
        match self
            .history
            .append(PositionHistoryRecord::from_position(vehicle_id, &position))
        {
            Ok(record) => Ok(record),
            Err(e) => {
                match previous {
                    Some(old) => {
                        self.positions.insert(vehicle_id, old);
                    }
                    None => {
                        self.positions.slots.remove(&vehicle_id);
                    }
                }
                Err(e)
            }
        }
    }

    /// Paired update for one vehicle.
    ///
    /// `next` receives the current position and returns the new one. While
    /// the vehicle's slot lock is held the result is stamped, validated,
    /// written to the position store and then appended to the history log.
    /// If `next` or validation fails, neither side is written. If the append
    /// fails, the slot gets its previous position back before the lock is
    /// released.
    pub fn commit<F>(&self, vehicle_id: VehicleId, next: F) -> Result<PositionHistoryRecord>
    where
        F: FnOnce(&VehiclePosition) -> Result<PositionDraft>,
    {
        let mut slot = self.positions.lock(vehicle_id)?;
        let position = checked(vehicle_id, next(&*slot)?)?;
        let previous = std::mem::replace(&mut *slot, position);
        match self
            .history
            .append(PositionHistoryRecord::from_position(vehicle_id, &position))
        {
            Ok(record) => Ok(record),
            Err(e) => {
                *slot = previous;
                Err(e)
            }
        }
    }

    /// Empty both sides and restart the history sequence.
    pub fn clear(&mut self) -> Result<()> {
        self.positions.clear();
        self.history.clear()
    }
}

fn checked(vehicle_id: VehicleId, draft: PositionDraft) -> Result<VehiclePosition> {
    let position = draft.stamp(Utc::now());
    if !position.is_valid() {
        return Err(FleetError::InvalidPosition {
            vehicle_id,
            message: format!(
                "({}, {}) heading {} speed {}",
                position.point.longitude,
                position.point.latitude,
                position.heading_deg,
                position.speed_kph
            ),
        });
    }
    Ok(position)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn store_with(n: u64) -> FleetStore {
        let mut store = FleetStore::new();
        for id in 1..=n {
            store
                .register(id, PositionDraft::at(GeoPoint::new(id as f64, 0.0)))
                .unwrap();
        }
        store
    }

    #[test]
    fn test_register_pairs_position_and_history() {
        let store = store_with(3);
        assert_eq!(store.positions.len(), 3);
        assert_eq!(store.history.len().unwrap(), 3);
        for id in 1..=3 {
            let pos = store.positions.get(id).unwrap();
            let rec = store.history.latest_for(id).unwrap().unwrap();
            assert!(rec.matches(&pos));
            assert_eq!(rec.seq, id);
        }
    }

    #[test]
    fn test_get_unknown_vehicle() {
        let store = store_with(1);
        let err = store.positions.get(42).unwrap_err();
        assert!(matches!(err, FleetError::VehicleNotFound(42)));
    }

    #[test]
    fn test_commit_updates_both_sides() {
        let store = store_with(2);
        let record = store
            .commit(2, |current| {
                Ok(PositionDraft::at(GeoPoint::new(current.point.longitude + 1.0, 1.0))
                    .with_heading(370.0)
                    .with_speed(30.0))
            })
            .unwrap();

        let pos = store.positions.get(2).unwrap();
        assert_eq!(pos.point, GeoPoint::new(3.0, 1.0));
        assert_eq!(pos.heading_deg, 10.0);
        assert!(record.matches(&pos));
        assert_eq!(record.seq, 3);
        assert_eq!(store.history.records_for(2).unwrap().len(), 2);
    }

    #[test]
    fn test_failed_commit_writes_nothing() {
        let store = store_with(1);
        let before = store.positions.get(1).unwrap();

        let err = store
            .commit(1, |_| Ok(PositionDraft::at(GeoPoint::new(0.0, 0.0)).with_speed(-3.0)))
            .unwrap_err();
        assert!(matches!(err, FleetError::InvalidPosition { vehicle_id: 1, .. }));

        let err = store
            .commit(1, |_| Err(FleetError::Config("model failed".into())))
            .unwrap_err();
        assert!(matches!(err, FleetError::Config(_)));

        assert_eq!(store.positions.get(1).unwrap(), before);
        assert_eq!(store.history.len().unwrap(), 1);
    }

    #[test]
    fn test_commit_unknown_vehicle() {
        let store = store_with(1);
        let result = store.commit(9, |_| Ok(PositionDraft::at(GeoPoint::new(0.0, 0.0))));
        assert!(result.unwrap_err().is_not_found());
        assert_eq!(store.history.len().unwrap(), 1);
    }

    #[test]
    fn test_history_since_and_sequence() {
        let log = HistoryLog::starting_at(10);
        let pos = PositionDraft::at(GeoPoint::new(0.0, 0.0)).stamp(Utc::now());
        for id in 0..5 {
            log.append(PositionHistoryRecord::from_position(id, &pos))
                .unwrap();
        }
        assert_eq!(log.next_seq().unwrap(), 15);
        let tail = log.since(12).unwrap();
        assert_eq!(tail.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![13, 14]);
        assert_eq!(log.since(0).unwrap().len(), 5);

        log.clear().unwrap();
        assert!(log.is_empty().unwrap());
        assert_eq!(log.next_seq().unwrap(), 1);
    }

    #[test]
    fn test_truncate_through_keeps_sequence() {
        let store = store_with(4);
        store
            .commit(2, |c| Ok(PositionDraft::at(c.point).with_speed(9.0)))
            .unwrap();

        assert_eq!(store.history.truncate_through(3).unwrap(), 3);
        let left: Vec<u64> = store.history.records().unwrap().iter().map(|r| r.seq).collect();
        assert_eq!(left, vec![4, 5]);
        assert_eq!(store.history.next_seq().unwrap(), 6);
        assert_eq!(store.history.since(3).unwrap().len(), 2);

        // Nothing below the cut is left to release
        assert_eq!(store.history.truncate_through(3).unwrap(), 0);
        assert_eq!(store.history.truncate_through(100).unwrap(), 2);
        assert!(store.history.is_empty().unwrap());

        let record = store
            .commit(1, |c| Ok(PositionDraft::at(c.point)))
            .unwrap();
        assert_eq!(record.seq, 6);
    }

    #[test]
    fn test_failed_append_restores_position() {
        let store = store_with(2);
        let before = store.positions.get(2).unwrap();

        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = store.history.state.lock().unwrap();
            panic!("writer died holding the history lock");
        }));

        let err = store
            .commit(2, |_| Ok(PositionDraft::at(GeoPoint::new(50.0, 50.0))))
            .unwrap_err();
        assert!(matches!(err, FleetError::LockPoisoned("history log")));
        assert_eq!(store.positions.get(2).unwrap(), before);
    }

    #[test]
    fn test_set_bypasses_history() {
        let store = store_with(1);
        let moved = PositionDraft::at(GeoPoint::new(7.0, 7.0)).stamp(Utc::now());
        store.positions.set(1, moved).unwrap();

        assert_eq!(store.positions.get(1).unwrap(), moved);
        // Raw overwrite: the log still only has the registration record
        assert_eq!(store.history.len().unwrap(), 1);
        let latest = store.history.latest_for(1).unwrap().unwrap();
        assert!(!latest.matches(&moved));

        assert!(store.positions.set(5, moved).unwrap_err().is_not_found());
    }

    #[test]
    fn test_concurrent_commits_stay_paired() {
        let store = store_with(8);
        thread::scope(|s| {
            for worker in 0..4 {
                let store = &store;
                s.spawn(move || {
                    for round in 0..50 {
                        // Every worker hits every vehicle, so same-id writes contend
                        for id in 1..=8 {
                            store
                                .commit(id, |current| {
                                    Ok(PositionDraft::at(current.point)
                                        .with_heading((worker * 50 + round) as f64)
                                        .with_speed(current.speed_kph + 1.0))
                                })
                                .unwrap();
                        }
                    }
                });
            }
        });

        assert_eq!(store.history.len().unwrap(), 8 + 4 * 50 * 8);
        let records = store.history.records().unwrap();
        for (i, rec) in records.iter().enumerate() {
            assert_eq!(rec.seq, i as u64 + 1);
        }
        for id in 1..=8 {
            let pos = store.positions.get(id).unwrap();
            // Slot lock serializes read-modify-write on one vehicle
            assert_eq!(pos.speed_kph, 200.0);
            let latest = store.history.latest_for(id).unwrap().unwrap();
            assert!(latest.matches(&pos));
        }
    }
}
