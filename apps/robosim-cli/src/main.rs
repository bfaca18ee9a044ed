use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use robosim_author::{load_scene, save_scene};
use robosim_bridge::{Bridge, DeviceTable, ReadingData, shared};
use robosim_kernel::{SceneDescription, World};
use robosim_physics::EngineRegistry;
use robosim_stats::{Aggregate, SignalStats};
use robosim_tools::WorldInspector;
use tracing_subscriber::EnvFilter;

const PENDULUM_SCENE: &str = include_str!("../../../scenes/inertia_ratio_pendulum.yaml");

#[derive(Parser)]
#[command(name = "robosim-cli", about = "CLI tool for robosim operations")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version, crate info and available physics back-ends
    Info,
    /// Load a scene file and step it
    Run {
        /// Scene file (.yaml, .yml or .json)
        scene: PathBuf,
        /// Number of steps to simulate
        #[arg(short, long, default_value = "1000")]
        steps: u64,
        /// Override the scene's physics back-end
        #[arg(short, long)]
        engine: Option<String>,
        /// Override the scene's step size in seconds
        #[arg(long)]
        step_size: Option<f64>,
        /// Print the entity tree before stepping
        #[arg(long)]
        tree: bool,
        /// Write the final scene state to this file
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// Run the inertia-ratio double pendulum and check it stays planar
    Pendulum {
        /// Back-end to validate; all registered back-ends when omitted
        #[arg(short, long)]
        engine: Option<String>,
        #[arg(short, long, default_value = "3000")]
        steps: u64,
        /// Largest allowed pitch or yaw of either link, in radians
        #[arg(long, default_value = "0.2")]
        tolerance: f64,
    },
    /// Step a scene while polling devices through the bridge
    Devices {
        scene: PathBuf,
        /// Device table, one `robot:interface:index [model link]` per line
        table: PathBuf,
        #[arg(short, long, default_value = "100")]
        steps: u64,
        /// Steps between polls
        #[arg(long, default_value = "10")]
        every: u64,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match cli.command {
        Commands::Info => {
            println!("robosim-cli v{}", env!("CARGO_PKG_VERSION"));
            println!("common: {}", robosim_common::crate_info());
            println!("physics: {}", robosim_physics::crate_info());
            println!("kernel: {}", robosim_kernel::crate_info());
            println!("author: {}", robosim_author::crate_info());
            println!("bridge: {}", robosim_bridge::crate_info());
            println!("stats: {}", robosim_stats::crate_info());
            println!("tools: {}", robosim_tools::crate_info());
            let registry = EngineRegistry::builtin();
            let engines: Vec<&str> = registry.names().collect();
            println!("engines: {}", engines.join(", "));
        }
        Commands::Run {
            scene,
            steps,
            engine,
            step_size,
            tree,
            save,
        } => {
            let mut description = load_scene(&scene)
                .with_context(|| format!("loading {}", scene.display()))?;
            if let Some(engine) = engine {
                description.world.engine = engine;
            }
            if let Some(step_size) = step_size {
                description.world.step_size = step_size;
            }
            let mut world = World::from_scene(&description)?;
            if tree {
                print!("{}", WorldInspector::tree(&world));
            }

            world.step(steps)?;
            println!("{}", WorldInspector::summary(&world));
            for link in world.links() {
                if let Some(info) = WorldInspector::inspect_link(&world, link.id()) {
                    println!("  {info}");
                }
            }
            for contact in world.contacts() {
                let a = world.link_scoped_name(contact.link_a).unwrap_or_default();
                let b = world.link_scoped_name(contact.link_b).unwrap_or_default();
                println!("  contact {a} <-> {b} depth={:.5}", contact.max_depth());
            }
            if let Some(path) = save {
                save_scene(&path, &world.scene_description())?;
                println!("saved {}", path.display());
            }
        }
        Commands::Pendulum {
            engine,
            steps,
            tolerance,
        } => {
            let engines = match engine {
                Some(engine) => vec![engine],
                None => EngineRegistry::builtin()
                    .names()
                    .map(str::to_string)
                    .collect(),
            };
            let mut failed = Vec::new();
            for engine in engines {
                let worst = run_pendulum(&engine, steps)?;
                let verdict = if worst <= tolerance { "OK" } else { "FAIL" };
                println!("{engine}: max |pitch|,|yaw| = {worst:.5} rad ({verdict})");
                if worst > tolerance {
                    failed.push(engine);
                }
            }
            if !failed.is_empty() {
                bail!(
                    "pendulum left its swing plane on: {}",
                    failed.join(", ")
                );
            }
        }
        Commands::Devices {
            scene,
            table,
            steps,
            every,
        } => {
            let world = World::from_scene(&load_scene(&scene)?)?;
            let text = std::fs::read_to_string(&table)
                .with_context(|| format!("reading {}", table.display()))?;
            let devices = DeviceTable::parse(&text)?;
            let addrs: Vec<_> = devices.iter().map(|(a, _)| a.clone()).collect();

            let mut bridge = Bridge::new(shared(world), devices);
            for addr in &addrs {
                bridge.subscribe(addr)?;
            }
            let every = every.max(1);
            let mut done = 0;
            while done < steps {
                let n = every.min(steps - done);
                bridge.world().write().step(n)?;
                done += n;
                for reading in bridge.poll()? {
                    match reading.data {
                        ReadingData::Simulation { iterations, .. } => {
                            println!("{} t={:.4} iterations={iterations}", reading.addr, reading.sim_time);
                        }
                        ReadingData::Body { pose, twist } => {
                            println!(
                                "{} t={:.4} pose={pose} vel={:.3}",
                                reading.addr, reading.sim_time, twist.linear
                            );
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

/// Worst pitch or yaw magnitude of either pendulum link over the run.
fn run_pendulum(engine: &str, steps: u64) -> anyhow::Result<f64> {
    let mut scene: SceneDescription = serde_yaml::from_str(PENDULUM_SCENE)?;
    scene.world.engine = engine.to_string();
    let mut world = World::from_scene(&scene)?;
    let links = [
        world.link("inertia_ratio", "upper_link")?.id(),
        world.link("inertia_ratio", "lower_link")?.id(),
    ];

    let mut stats: Vec<SignalStats> = Vec::new();
    for _ in 0..links.len() * 2 {
        let mut s = SignalStats::new();
        s.insert_statistics("MaxAbs,Rms")?;
        stats.push(s);
    }
    for _ in 0..steps {
        world.step(1)?;
        for (i, id) in links.iter().enumerate() {
            let rpy = world.link_sample(*id)?.pose.rpy();
            stats[2 * i].insert_data(rpy.y);
            stats[2 * i + 1].insert_data(rpy.z);
        }
    }
    for (s, label) in stats.iter().zip(["upper pitch", "upper yaw", "lower pitch", "lower yaw"]) {
        tracing::debug!(engine, signal = label, stats = ?s.map(), "pendulum");
    }
    Ok(stats
        .iter()
        .filter_map(|s| s.get(Aggregate::MaxAbs))
        .fold(0.0, f64::max))
}
