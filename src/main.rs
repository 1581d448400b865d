//! fleet-tracker command-line front end.
//!
//! Each invocation opens the SQLite store named by `DATABASE_URL`, loads the
//! fleet into a [`FleetEngine`], runs one command and writes any new position
//! history back in a single transaction.

use std::io::{self, BufRead, Write};
use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;

use fleet_tracker::{
    CancelToken, FleetDatabase, FleetEngine, FleetError, FuzzyConfig, GeofenceId,
    GeofenceOccupancy, Result, SeedConfig, VehicleSummary,
};

#[derive(Parser, Debug)]
#[command(name = "fleet-tracker")]
#[command(about = "Track vehicles, geofences and position history", long_about = None)]
struct Cli {
    /// SQLite database file
    #[arg(long, env = "DATABASE_URL", default_value = "fleet.db", global = true)]
    database_url: String,

    /// Seed for the random generator (random when omitted)
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Minimum trigram similarity for fuzzy matches
    #[arg(long, env = "FLEET_SIMILARITY_THRESHOLD", default_value_t = fleet_tracker::fuzzy::DEFAULT_THRESHOLD, global = true)]
    similarity_threshold: f64,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct IdentifierQuery {
    /// VIN to fuzzy match
    #[arg(long)]
    vin: Option<String>,

    /// License plate to fuzzy match
    #[arg(long)]
    plate: Option<String>,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct GeofenceTarget {
    /// Geofence id to check
    #[arg(long)]
    geofence_id: Option<GeofenceId>,

    /// Fuzzy geofence name search (best match wins)
    #[arg(long)]
    name: Option<String>,
}

#[derive(Args, Debug)]
struct Repeat {
    /// Run continuously
    #[arg(long = "loop")]
    repeat: bool,

    /// Seconds between loops
    #[arg(long, default_value_t = 300)]
    interval: u64,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fuzzy search vehicles by VIN or license plate
    SearchIdentifier {
        #[command(flatten)]
        query: IdentifierQuery,

        /// Max results to show
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// List vehicles inside a geofence
    FindInGeofence {
        #[command(flatten)]
        target: GeofenceTarget,

        /// Max vehicles to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Move random vehicles to random points inside a geofence
    MoveVehicles {
        /// Target geofence id
        #[arg(long)]
        geofence_id: GeofenceId,

        /// Number of vehicles to move
        #[arg(long, default_value_t = 100)]
        count: usize,
    },

    /// Geofences with the most vehicles
    TopGeofences {
        /// How many top geofences to return
        #[arg(long, default_value_t = 1)]
        top: usize,

        /// Sample vehicles to show per geofence
        #[arg(long, default_value_t = 10)]
        sample: usize,

        #[command(flatten)]
        repeat: Repeat,
    },

    /// Random-walk every vehicle one step
    UpdatePositions {
        #[command(flatten)]
        repeat: Repeat,
    },

    /// Generate a synthetic fleet
    Seed {
        #[arg(long, env = "VEHICLE_COUNT", default_value_t = 60_000)]
        vehicles: usize,

        #[arg(long, env = "GEOFENCE_COUNT", default_value_t = 120_000)]
        geofences: usize,
    },

    /// Delete all vehicles, geofences and history
    Wipe {
        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },
}

#[derive(Serialize)]
struct IdentifierHit {
    vehicle_id: u64,
    vin: String,
    license_plate: String,
    make: String,
    model: String,
    year: u16,
    similarity: f64,
}

#[derive(Serialize)]
struct GeofenceVehicles {
    geofence_id: GeofenceId,
    geofence_name: String,
    vehicles: Vec<VehicleSummary>,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let mut db = match FleetDatabase::open(&cli.database_url) {
        Ok(db) => db,
        Err(e) => {
            println!("Failed to connect to database at {}: {}", cli.database_url, e);
            return ExitCode::from(1);
        }
    };

    match run(&cli, &mut db) {
        Ok(code) => code,
        Err(e) => {
            if !e.is_not_found() {
                log::error!("[fleet-tracker] {}", e);
            }
            println!("{}", e);
            ExitCode::from(1)
        }
    }
}

fn rng_for(cli: &Cli) -> ChaCha8Rng {
    match cli.seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_entropy(),
    }
}

fn load_engine(cli: &Cli, db: &FleetDatabase) -> Result<FleetEngine> {
    if !(0.0..=1.0).contains(&cli.similarity_threshold) {
        return Err(FleetError::Config(format!(
            "similarity threshold must be within [0, 1], got {}",
            cli.similarity_threshold
        )));
    }
    Ok(FleetEngine::from_snapshot(db.load()?)?
        .with_fuzzy_config(FuzzyConfig::with_threshold(cli.similarity_threshold)))
}

/// Write history appended since `persisted_seq`, then release it from
/// memory; returns the new high-water mark.
fn persist_updates(engine: &FleetEngine, db: &mut FleetDatabase, persisted_seq: u64) -> Result<u64> {
    let records = engine.history_since(persisted_seq)?;
    let last = records.last().map(|r| r.seq).unwrap_or(persisted_seq);
    db.record_updates(&records)?;
    engine.release_history_through(last)?;
    Ok(last)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run(cli: &Cli, db: &mut FleetDatabase) -> Result<ExitCode> {
    match &cli.command {
        Command::SearchIdentifier { query, limit } => {
            let engine = load_engine(cli, db)?;
            let start = Instant::now();
            let (label, hits) = match (&query.vin, &query.plate) {
                (Some(vin), _) => (format!("VIN '{}'", vin), engine.search_vin(vin, *limit)?),
                (None, Some(plate)) => (format!("plate '{}'", plate), engine.search_plate(plate, *limit)?),
                (None, None) => {
                    println!("You must specify --vin or --plate.");
                    return Ok(ExitCode::from(1));
                }
            };
            let mut rows = Vec::with_capacity(hits.len());
            for hit in hits {
                let v = engine.vehicle(hit.id)?;
                rows.push(IdentifierHit {
                    vehicle_id: v.id,
                    vin: v.vin,
                    license_plate: v.license_plate,
                    make: v.make,
                    model: v.model,
                    year: v.year,
                    similarity: hit.score,
                });
            }
            let elapsed = start.elapsed().as_secs_f64();

            if cli.json {
                return print_json(&rows).map(|_| ExitCode::SUCCESS);
            }
            if rows.is_empty() {
                println!("No vehicles matched {}.", label);
                return Ok(ExitCode::SUCCESS);
            }
            println!("Matches for {}:", label);
            println!("vehicle_id | vin | license_plate | make | model | year | similarity");
            for r in &rows {
                println!(
                    "{} | {} | {} | {} | {} | {} | {:.3}",
                    r.vehicle_id, r.vin, r.license_plate, r.make, r.model, r.year, r.similarity
                );
            }
            println!("Query time: {:.3}s", elapsed);
        }

        Command::FindInGeofence { target, limit } => {
            let engine = load_engine(cli, db)?;
            let start = Instant::now();
            let geofence = match (target.geofence_id, &target.name) {
                (Some(id), _) => engine.geofence(id)?,
                (None, Some(name)) => match engine.find_geofence_by_name(name)? {
                    Some((geofence, _)) => geofence,
                    None => {
                        println!("No geofence matched name '{}'.", name);
                        return Ok(ExitCode::from(1));
                    }
                },
                (None, None) => {
                    println!("You must specify --geofence-id or --name.");
                    return Ok(ExitCode::from(1));
                }
            };
            let vehicles = engine.vehicles_in(geofence.id, *limit)?;
            let elapsed = start.elapsed().as_secs_f64();

            if cli.json {
                let result = GeofenceVehicles {
                    geofence_id: geofence.id,
                    geofence_name: geofence.name,
                    vehicles,
                };
                return print_json(&result).map(|_| ExitCode::SUCCESS);
            }
            if vehicles.is_empty() {
                println!("No vehicles found inside the requested geofence.");
                return Ok(ExitCode::SUCCESS);
            }
            println!("geofence_id | geofence_name | vehicle_id | vin | license_plate | latitude | longitude");
            for v in &vehicles {
                println!(
                    "{} | {} | {} | {} | {} | {} | {}",
                    geofence.id,
                    geofence.name,
                    v.vehicle_id,
                    v.vin,
                    v.license_plate,
                    v.point.latitude,
                    v.point.longitude
                );
            }
            println!("Query time: {:.3}s", elapsed);
        }

        Command::MoveVehicles { geofence_id, count } => {
            let engine = load_engine(cli, db)?;
            let persisted = engine.stats()?.next_history_seq - 1;
            let mut rng = rng_for(cli);
            let start = Instant::now();
            let report = engine.move_vehicles(*geofence_id, *count, &mut rng, &CancelToken::new())?;
            persist_updates(&engine, db, persisted)?;
            let elapsed = start.elapsed().as_secs_f64();

            if cli.json {
                return print_json(&report).map(|_| ExitCode::SUCCESS);
            }
            let name = engine.geofence(*geofence_id)?.name;
            println!(
                "Moved {} vehicles into geofence {} ({}) in {:.3}s.",
                report.moved.len(),
                geofence_id,
                name,
                elapsed
            );
            if report.failed > 0 {
                println!("{} vehicles could not be placed.", report.failed);
            }
        }

        Command::TopGeofences { top, sample, repeat } => loop {
            // Reload each round so updates from other processes show up
            let engine = load_engine(cli, db)?;
            let start = Instant::now();
            let result = engine.top_geofences(*top, *sample)?;
            print_occupancy(&result, start.elapsed().as_secs_f64(), cli.json)?;
            if !repeat.repeat {
                break;
            }
            thread::sleep(Duration::from_secs(repeat.interval));
        },

        Command::UpdatePositions { repeat } => {
            let engine = load_engine(cli, db)?;
            let mut persisted = engine.stats()?.next_history_seq - 1;
            let mut rng = rng_for(cli);
            let cancel = CancelToken::new();
            loop {
                let report = engine.update_positions(&mut rng, &cancel)?;
                persisted = persist_updates(&engine, db, persisted)?;
                if cli.json {
                    print_json(&report)?;
                } else {
                    println!("Updated {} vehicle positions.", report.committed);
                    if report.failed > 0 {
                        println!("{} of {} updates failed.", report.failed, report.attempted);
                    }
                }
                if !repeat.repeat {
                    break;
                }
                thread::sleep(Duration::from_secs(repeat.interval));
            }
        }

        Command::Seed {
            vehicles,
            geofences,
        } => {
            let engine = load_engine(cli, db)?;
            let persisted = engine.stats()?.next_history_seq - 1;
            let mut rng = rng_for(cli);
            let start = Instant::now();
            let config = SeedConfig::with_counts(*vehicles, *geofences);
            let report = engine.seed(&config, &mut rng, &CancelToken::new())?;

            let snapshot = engine.snapshot()?;
            let new_geofences: Vec<_> = snapshot
                .geofences
                .into_iter()
                .filter(|g| report.geofences_created > 0 && g.id >= report.first_geofence_id)
                .collect();
            let new_vehicles: Vec<_> = snapshot
                .vehicles
                .into_iter()
                .filter(|v| report.vehicles_created > 0 && v.id >= report.first_vehicle_id)
                .collect();
            let records = engine.history_since(persisted)?;
            db.insert_seed(&new_geofences, &new_vehicles, &records)?;
            let elapsed = start.elapsed().as_secs_f64();

            if cli.json {
                return print_json(&report).map(|_| ExitCode::SUCCESS);
            }
            println!(
                "Seeded {} geofences and {} vehicles in {:.3}s.",
                report.geofences_created, report.vehicles_created, elapsed
            );
        }

        Command::Wipe { force } => {
            if !force && !confirm_wipe()? {
                println!("Aborted.");
                return Ok(ExitCode::SUCCESS);
            }
            let start = Instant::now();
            db.wipe()?;
            println!(
                "Wiped vehicles and geofences in {:.3}s.",
                start.elapsed().as_secs_f64()
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn confirm_wipe() -> Result<bool> {
    print!("This will delete all vehicles, geofences and position history. Type 'yes' to continue: ");
    io::stdout()
        .flush()
        .map_err(|e| FleetError::Config(format!("stdout: {}", e)))?;
    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .map_err(|e| FleetError::Config(format!("stdin: {}", e)))?;
    Ok(answer.trim() == "yes")
}

fn print_occupancy(result: &[GeofenceOccupancy], elapsed: f64, json: bool) -> Result<()> {
    if json {
        return print_json(&result);
    }
    if result.is_empty() {
        println!("No geofences found.");
        return Ok(());
    }
    println!("Query time: {:.3}s", elapsed);
    for g in result {
        println!(
            "Geofence {} | name={} | type={} | vehicles={} | tags={:?}",
            g.geofence_id, g.name, g.fence_type, g.vehicle_count, g.tags
        );
        if g.vehicles.is_empty() {
            println!("  No vehicles currently inside.");
            continue;
        }
        println!("  Sample vehicles (id | vin | plate | lat | lon):");
        for v in &g.vehicles {
            println!(
                "    {} | {} | {} | {:.5} | {:.5}",
                v.vehicle_id, v.vin, v.license_plate, v.point.latitude, v.point.longitude
            );
        }
    }
    Ok(())
}
