//! Batch position updates and targeted moves.
//!
//! Every vehicle is an independent unit of work: derive its generator,
//! compute the new position, run the paired commit. Units run on the rayon
//! pool when the `parallel` feature is enabled. A failed unit is counted and
//! logged; the rest of the batch carries on.
//!
//! Randomness comes from the caller's generator. One batch seed is drawn from
//! it and each vehicle gets a ChaCha8 stream keyed by that seed and its id, so
//! a batch produces the same positions whatever the thread scheduling.

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::geometry::{self, displace};
use crate::{
    CancelToken, FleetError, FleetStore, GeofenceId, OptionExt, PositionDraft, Result,
    SpatialIndex, VehicleId, VehiclePosition,
};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

// ============================================================================
// Configuration
// ============================================================================

/// Bounds for one random-walk step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Heading changes by a uniform draw in +/- this many degrees.
    /// Default: 15.0
    pub max_heading_delta_deg: f64,
    /// Speed changes by a normal draw clamped to +/- this many km/h.
    /// Default: 5.0
    pub max_speed_delta_kph: f64,
    /// Each axis moves by a uniform draw in +/- this many meters.
    /// Default: 250.0
    pub max_offset_m: f64,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            max_heading_delta_deg: 15.0,
            max_speed_delta_kph: 5.0,
            max_offset_m: 250.0,
        }
    }
}

impl UpdateConfig {
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("max_heading_delta_deg", self.max_heading_delta_deg),
            ("max_speed_delta_kph", self.max_speed_delta_kph),
            ("max_offset_m", self.max_offset_m),
        ];
        for (name, value) in fields {
            if !value.is_finite() || value < 0.0 {
                return Err(FleetError::Config(format!(
                    "{} must be a non-negative number, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// Settings for moving vehicles into a geofence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MoveConfig {
    /// Rejection-sampling draws per vehicle before giving up.
    /// Default: 1000
    pub max_sample_attempts: u32,
}

impl Default for MoveConfig {
    fn default() -> Self {
        Self {
            max_sample_attempts: 1000,
        }
    }
}

// ============================================================================
// Displacement Models
// ============================================================================

/// Computes a vehicle's next position from its current one.
///
/// Implementations are shared across worker threads and must be
/// deterministic given the generator they are handed.
pub trait DisplacementModel: Sync {
    fn next_position(
        &self,
        vehicle_id: VehicleId,
        current: &VehiclePosition,
        rng: &mut ChaCha8Rng,
    ) -> Result<PositionDraft>;
}

/// Bounded random walk: jitter heading and speed, then drift the point.
#[derive(Debug, Clone)]
pub struct RandomWalk {
    config: UpdateConfig,
    speed_noise: Normal<f64>,
}

impl RandomWalk {
    pub fn new(config: UpdateConfig) -> Result<Self> {
        config.validate()?;
        // Two standard deviations reach the clamp
        let speed_noise = Normal::new(0.0, config.max_speed_delta_kph / 2.0)
            .map_err(|e| FleetError::Config(format!("speed noise: {}", e)))?;
        Ok(Self {
            config,
            speed_noise,
        })
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }
}

impl DisplacementModel for RandomWalk {
    fn next_position(
        &self,
        _vehicle_id: VehicleId,
        current: &VehiclePosition,
        rng: &mut ChaCha8Rng,
    ) -> Result<PositionDraft> {
        let c = &self.config;
        let heading_delta = rng.gen_range(-c.max_heading_delta_deg..=c.max_heading_delta_deg);
        let speed_delta = self
            .speed_noise
            .sample(rng)
            .clamp(-c.max_speed_delta_kph, c.max_speed_delta_kph);
        let dx = rng.gen_range(-c.max_offset_m..=c.max_offset_m);
        let dy = rng.gen_range(-c.max_offset_m..=c.max_offset_m);

        Ok(PositionDraft {
            point: displace(current.point, dx, dy),
            heading_deg: current.heading_deg + heading_delta,
            speed_kph: (current.speed_kph + speed_delta).max(0.0),
        })
    }
}

// ============================================================================
// Reports
// ============================================================================

/// Outcome counts for a full-fleet update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Units that ran (committed + failed)
    pub attempted: usize,
    pub committed: usize,
    pub failed: usize,
    /// Units not started because the batch was cancelled
    pub skipped: usize,
    pub cancelled: bool,
}

/// Outcome of moving vehicles into a geofence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveReport {
    pub geofence_id: GeofenceId,
    pub requested: usize,
    /// Vehicles chosen (fewer than requested when the fleet is smaller)
    pub selected: usize,
    /// Vehicles whose move committed, ascending
    pub moved: Vec<VehicleId>,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Committed,
    Failed,
    Skipped,
}

#[derive(Debug, Default)]
struct Tally {
    committed: Vec<VehicleId>,
    failed: usize,
    skipped: usize,
}

fn tally(outcomes: Vec<(VehicleId, Outcome)>) -> Tally {
    let mut t = Tally::default();
    for (id, outcome) in outcomes {
        match outcome {
            Outcome::Committed => t.committed.push(id),
            Outcome::Failed => t.failed += 1,
            Outcome::Skipped => t.skipped += 1,
        }
    }
    t
}

/// Generator for one vehicle's unit of work.
fn vehicle_rng(batch_seed: u64, vehicle_id: VehicleId) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(batch_seed);
    rng.set_stream(vehicle_id);
    rng
}

// ============================================================================
// Pipeline
// ============================================================================

/// Applies updates to a [`FleetStore`], using a [`SpatialIndex`] to resolve
/// geofence targets.
pub struct UpdatePipeline<'a> {
    store: &'a FleetStore,
    index: &'a SpatialIndex,
    move_config: MoveConfig,
}

impl<'a> UpdatePipeline<'a> {
    pub fn new(store: &'a FleetStore, index: &'a SpatialIndex) -> Self {
        Self {
            store,
            index,
            move_config: MoveConfig::default(),
        }
    }

    pub fn with_move_config(mut self, config: MoveConfig) -> Self {
        self.move_config = config;
        self
    }

    /// One random-walk step for every vehicle.
    pub fn run_batch<R: Rng + ?Sized>(
        &self,
        config: &UpdateConfig,
        rng: &mut R,
        cancel: &CancelToken,
    ) -> Result<BatchReport> {
        let model = RandomWalk::new(*config)?;
        Ok(self.run_batch_with(&model, rng, cancel))
    }

    /// One step of `model` for every vehicle with a position.
    pub fn run_batch_with<M, R>(&self, model: &M, rng: &mut R, cancel: &CancelToken) -> BatchReport
    where
        M: DisplacementModel,
        R: Rng + ?Sized,
    {
        let batch_seed: u64 = rng.gen();
        let ids = self.store.positions.ids();
        log::info!("[UpdatePipeline] Updating {} vehicles", ids.len());

        let unit = |vehicle_id: VehicleId| -> (VehicleId, Outcome) {
            if cancel.is_cancelled() {
                return (vehicle_id, Outcome::Skipped);
            }
            let mut vrng = vehicle_rng(batch_seed, vehicle_id);
            let result = self
                .store
                .commit(vehicle_id, |current| model.next_position(vehicle_id, current, &mut vrng));
            match result {
                Ok(_) => (vehicle_id, Outcome::Committed),
                Err(e) => {
                    log::warn!("[UpdatePipeline] Vehicle {} not updated: {}", vehicle_id, e);
                    (vehicle_id, Outcome::Failed)
                }
            }
        };

        #[cfg(feature = "parallel")]
        let outcomes: Vec<(VehicleId, Outcome)> = ids.par_iter().map(|id| unit(*id)).collect();

        #[cfg(not(feature = "parallel"))]
        let outcomes: Vec<(VehicleId, Outcome)> = ids.iter().map(|id| unit(*id)).collect();

        let t = tally(outcomes);
        let report = BatchReport {
            attempted: t.committed.len() + t.failed,
            committed: t.committed.len(),
            failed: t.failed,
            skipped: t.skipped,
            cancelled: t.skipped > 0,
        };
        log::info!(
            "[UpdatePipeline] Batch done: {} committed, {} failed, {} skipped",
            report.committed,
            report.failed,
            report.skipped
        );
        report
    }

    /// Move up to `count` randomly chosen vehicles to random interior points
    /// of a geofence, stopped (heading 0, speed 0).
    ///
    /// Vehicles are chosen uniformly without replacement. A vehicle whose
    /// interior point cannot be sampled within the attempt budget is counted
    /// as failed.
    pub fn move_into_geofence<R: Rng + ?Sized>(
        &self,
        geofence_id: GeofenceId,
        count: usize,
        rng: &mut R,
        cancel: &CancelToken,
    ) -> Result<MoveReport> {
        let geofence = self.index.get(geofence_id).ok_or_geofence(geofence_id)?;

        let ids = self.store.positions.ids();
        let mut chosen: Vec<VehicleId> = ids.choose_multiple(rng, count).copied().collect();
        chosen.sort_unstable();
        let batch_seed: u64 = rng.gen();
        let attempts = self.move_config.max_sample_attempts;

        log::info!(
            "[UpdatePipeline] Moving {} vehicles into geofence {} ({})",
            chosen.len(),
            geofence_id,
            geofence.name
        );

        let unit = |vehicle_id: VehicleId| -> (VehicleId, Outcome) {
            if cancel.is_cancelled() {
                return (vehicle_id, Outcome::Skipped);
            }
            let mut vrng = vehicle_rng(batch_seed, vehicle_id);
            let result = self.store.commit(vehicle_id, |_| {
                let point = geometry::sample_interior(
                    &geofence.boundary,
                    &geofence.bounds,
                    &mut vrng,
                    attempts,
                )
                .map_err(|e| e.for_geofence(geofence_id))?
                .ok_or(FleetError::SamplingExhausted {
                    geofence_id,
                    attempts,
                })?;
                Ok(PositionDraft::at(point))
            });
            match result {
                Ok(_) => (vehicle_id, Outcome::Committed),
                Err(e) => {
                    log::warn!("[UpdatePipeline] Vehicle {} not moved: {}", vehicle_id, e);
                    (vehicle_id, Outcome::Failed)
                }
            }
        };

        #[cfg(feature = "parallel")]
        let outcomes: Vec<(VehicleId, Outcome)> = chosen.par_iter().map(|id| unit(*id)).collect();

        #[cfg(not(feature = "parallel"))]
        let outcomes: Vec<(VehicleId, Outcome)> = chosen.iter().map(|id| unit(*id)).collect();

        let t = tally(outcomes);
        Ok(MoveReport {
            geofence_id,
            requested: count,
            selected: chosen.len(),
            cancelled: t.skipped > 0,
            moved: t.committed,
            failed: t.failed,
            skipped: t.skipped,
        })
    }
}
