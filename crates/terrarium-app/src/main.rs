//! Terrarium simulation shell: seeds a small roster of robots, steps
//! the world until a winner emerges or the tick budget runs out, and
//! prints the closing event log.
//!
//! Environment knobs:
//!   TERRARIUM_DB       path to a DuckDB snapshot store (in-memory otherwise)
//!   TERRARIUM_SEED     RNG seed for a reproducible run
//!   TERRARIUM_TICKS    tick budget (default 600)
//!   TERRARIUM_TICK_MS  delay between ticks in milliseconds (default 50)

use anyhow::Result;
use std::env;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use terrarium_behavior::{KeywordInterpreter, register_builtins};
use terrarium_core::{DisplayColor, RobotSpec, WorldConfig, WorldState};
use terrarium_storage::Storage;
use tracing::{info, warn};

fn main() -> Result<()> {
    init_tracing();
    let mut world = bootstrap_world()?;
    info!("Starting Terrarium simulation shell");
    let outcome = run(&mut world);
    world.shutdown();
    outcome
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn env_u64(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|value| value.parse().ok())
}

fn bootstrap_world() -> Result<WorldState> {
    let config = WorldConfig {
        rng_seed: env_u64("TERRARIUM_SEED"),
        ..WorldConfig::default()
    };

    let mut world = match env::var("TERRARIUM_DB") {
        Ok(path) => {
            info!(path = %path, "using DuckDB snapshot store");
            WorldState::with_port(config, Box::new(Storage::open(&path)?))?
        }
        Err(_) => WorldState::new(config)?,
    };
    world.set_interpreter(Arc::new(KeywordInterpreter));
    seed_roster(&mut world)?;
    Ok(world)
}

fn seed_roster(world: &mut WorldState) -> Result<()> {
    let builtins = register_builtins(world.behavior_registry_mut());
    let roster = [
        ("Amble", DisplayColor::Cyan, 80, builtins.wanderer),
        ("Burrow", DisplayColor::Green, 100, builtins.homesteader),
        ("Creed", DisplayColor::Red, 120, builtins.raider),
        ("Dapple", DisplayColor::Yellow, 100, builtins.homesteader),
    ];
    for (name, color, max_energy, key) in roster {
        let id = world.add_robot(RobotSpec::new(name, color, max_energy))?;
        if !world.bind_behavior(id, key) {
            warn!(robot = %id, "behavior binding failed");
        }
    }
    info!(robots = world.robot_count(), "roster seeded");
    Ok(())
}

fn run(world: &mut WorldState) -> Result<()> {
    let max_ticks = env_u64("TERRARIUM_TICKS").unwrap_or(600);
    let tick_rate = Duration::from_millis(env_u64("TERRARIUM_TICK_MS").unwrap_or(50));

    loop {
        let report = world.step()?;

        if report.tick.0.is_multiple_of(25) {
            info!(
                tick = report.tick.0,
                robots = report.robots,
                battles = report.battles,
                captures = report.captures,
                deaths = report.deaths,
                "tick summary",
            );
        }

        // Exercise the command path once per run.
        if report.tick.0 == 40 {
            let first = world.robots().next().map(|(id, r)| (id, r.name.clone()));
            if let Some((id, record)) = first {
                info!(robot = %record, "issuing a demo command");
                world.issue_command(id, "say still ticking")?;
            }
        }

        if let Some(winner) = world.winner() {
            println!(
                "{} ({}) wins! Last robot standing with {} territory cells.",
                winner.name, winner.icon, winner.territory
            );
            break;
        }
        if report.robots == 0 {
            println!("The terrarium fell silent: no robots remain.");
            break;
        }
        if report.tick.0 >= max_ticks {
            println!("Tick budget of {max_ticks} reached.");
            break;
        }
        thread::sleep(tick_rate);
    }

    println!("--- closing event log ---");
    for line in world.event_log() {
        println!("{line}");
    }
    Ok(())
}
