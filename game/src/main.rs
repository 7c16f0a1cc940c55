//! Headless host driving the physics world at a fixed tick rate
//!
//! Usage: `game [--config physics.json] [--mesh level.obj] [--gravity 800] [--ticks 500]`
//! Without `--mesh` the demo floor and sphere are spawned instead.

use physics_world::prelude::*;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    mesh: Option<PathBuf>,
    gravity: Option<f32>,
    ticks: Option<u64>,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args::default();
    let mut iter = std::env::args().skip(1);
    while let Some(flag) = iter.next() {
        let mut value = || iter.next().ok_or_else(|| format!("{flag} needs a value"));
        match flag.as_str() {
            "--config" => args.config = Some(PathBuf::from(value()?)),
            "--mesh" => args.mesh = Some(PathBuf::from(value()?)),
            "--gravity" => {
                let raw = value()?;
                args.gravity = Some(raw.parse().map_err(|_| format!("invalid gravity '{raw}'"))?)
            }
            "--ticks" => {
                let raw = value()?;
                args.ticks = Some(raw.parse().map_err(|_| format!("invalid tick count '{raw}'"))?)
            }
            other => return Err(format!("unknown argument '{other}'")),
        }
    }
    Ok(args)
}

fn main() -> ExitCode {
    physics_world::init_logging();

    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            error!("{message}");
            return ExitCode::FAILURE;
        }
    };

    let mut config = match &args.config {
        Some(path) => match PhysicsConfig::from_json_file(path) {
            Ok(config) => config,
            Err(e) => {
                error!(path = %path.display(), "Failed to load physics config: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => PhysicsConfig::default(),
    };
    config.seed_demo_bodies = args.mesh.is_none();

    let mut cvars: HashMap<String, f32> = HashMap::new();
    if let Some(gravity) = args.gravity {
        cvars.insert(config.gravity_cvar.clone(), gravity);
    }

    let mut physics = PhysicsSystem::new(config);
    if let Err(e) = physics.init(&cvars) {
        error!("Physics init failed: {e}");
        return ExitCode::FAILURE;
    }

    if let Some(mesh) = &args.mesh {
        match physics.import_static_mesh(mesh) {
            Ok((body, shape)) => {
                info!(?body, triangles = shape.triangle_count(), "Level geometry loaded")
            }
            // The level still runs without its collision geometry
            Err(e) => warn!(path = %mesh.display(), "Mesh import failed: {e}"),
        }
    }

    let ticks = args.ticks.unwrap_or(500);
    info!(ticks, "Running fixed ticks");
    for _ in 0..ticks {
        match physics.update() {
            Ok(stats) if stats.step % 100 == 0 => info!(
                step = stats.step,
                active = stats.active_bodies,
                contacts = stats.contacts,
                scratch = stats.scratch_bytes,
                "Tick"
            ),
            Ok(_) => {}
            Err(e) if e.is_fatal() => {
                error!("Physics step failed: {e}");
                let _ = physics.cleanup();
                return ExitCode::FAILURE;
            }
            Err(e) => warn!("Physics step failed: {e}"),
        }
    }

    if let Ok(world) = physics.world() {
        info!(
            bodies = world.body_count(),
            active = world.active_body_count(),
            scratch_high_water = world.scratch_high_water(),
            "Simulation finished"
        );
    }

    if let Err(e) = physics.cleanup() {
        error!("Physics cleanup failed: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
