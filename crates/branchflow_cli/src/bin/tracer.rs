//! Ray tracer front end.

use std::fs::File;
use std::io::{BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;

use branchflow_cli::{
    make_dynamics, make_initial_conditions, make_observers, observers_need_monodromy,
    potential_info,
};
use branchflow_core::memory::MemoryBudget;
use branchflow_core::potential::Potential;
use branchflow_core::tracer::ic::InitialConditionConfig;
use branchflow_core::tracer::{IntegratorKind, Tracer};

/// Traces ensembles of rays through a generated potential and reduces the
/// trajectories into observer statistics.
#[derive(Parser, Debug)]
#[command(name = "tracer", version)]
struct Args {
    /// Number of particles to trace.
    #[arg(short = 'n', long = "num-particles", default_value_t = 1000)]
    num_particles: u64,

    /// Override the strength stored in the potential file.
    #[arg(short = 's', long = "potential-strength")]
    potential_strength: Option<f64>,

    /// Use periodic boundary conditions.
    #[arg(long)]
    periodic: bool,

    /// File from which to load the potential.
    potential: PathBuf,

    /// Form of the incoming wavefront: <name> [args...].
    #[arg(long, num_args = 1.., default_values_t = vec!["planar".to_owned()])]
    incoming: Vec<String>,

    /// Observers to attach: <name> [args...] [<name> [args...]]...
    #[arg(long, num_args = 1.., default_values_t = vec!["density".to_owned()])]
    observers: Vec<String>,

    /// Ray dynamics to use: <name> [args...].
    #[arg(long, num_args = 1.., default_values_t = vec!["particle_potential".to_owned()])]
    dynamics: Vec<String>,

    /// Maximum relative error for adaptive integration.
    #[arg(long = "rel-err-bound", default_value_t = 1e-6)]
    rel_err_bound: f64,

    /// Maximum absolute error for adaptive integration.
    #[arg(long = "abs-err-bound", default_value_t = 1e-6)]
    abs_err_bound: f64,

    /// Particle time after which the integration stops.
    #[arg(short = 'e', long = "end-time", default_value_t = 1.0)]
    end_time: f64,

    /// Directory receiving one file per observer plus config.txt.
    #[arg(short = 'r', long = "result-path", default_value = "result")]
    result_path: PathBuf,

    /// Do not normalise the particles' starting energy.
    #[arg(long = "no-norm-energy")]
    no_norm_energy: bool,

    /// Maximum number of worker threads; zero selects the hardware count.
    #[arg(short = 't', long, default_value_t = 0)]
    threads: usize,

    /// Memory the density observers may use, in MB.
    #[arg(long)]
    memory: Option<usize>,

    /// Integration scheme: adaptive or euler.
    #[arg(long, default_value = "adaptive")]
    integrator: String,

    /// Fixed time step (euler) and observation interval override.
    #[arg(long = "time-step")]
    time_step: Option<f64>,
}

fn run(args: &Args) -> Result<()> {
    let setup_start = Instant::now();

    std::fs::create_dir_all(&args.result_path)
        .with_context(|| format!("could not create result directory {:?}", args.result_path))?;

    let file = File::open(&args.potential)
        .with_context(|| format!("could not open potential file {:?}", args.potential))?;
    let mut potential = Potential::read_from(&mut BufReader::new(file))?;

    if let Some(strength) = args.potential_strength {
        potential.set_strength(strength);
    }

    let budget = Arc::new(match args.memory {
        Some(megabytes) => MemoryBudget::new(megabytes * 1024 * 1024),
        None => MemoryBudget::unlimited(),
    });

    let monodromy = observers_need_monodromy(&args.observers);
    let dynamics = make_dynamics(&args.dynamics, &potential, args.periodic, monodromy)?;
    let observers = make_observers(&args.observers, &potential, &budget)?;

    let mut tracer = Tracer::new(&potential, dynamics);
    for observer in observers.locals {
        tracer.add_local_observer(observer);
    }
    for observer in observers.shared {
        tracer.add_shared_observer(observer);
    }
    tracer.set_error_bounds(args.abs_err_bound, args.rel_err_bound);
    tracer.set_end_time(args.end_time);
    if args.threads > 0 {
        tracer.set_max_threads(args.threads);
    }
    tracer.set_integrator(match args.integrator.as_str() {
        "adaptive" => IntegratorKind::Adaptive,
        "euler" => IntegratorKind::Euler,
        other => bail!("unknown integrator {other:?}, expected adaptive or euler"),
    });
    if let Some(dt) = args.time_step {
        tracer.set_time_step(dt);
    }

    // record the run configuration next to the results
    let info = potential_info(&potential);
    let mut config = File::create(args.result_path.join("config.txt"))?;
    writeln!(config, "# command line")?;
    let command_line: Vec<String> = std::env::args().collect();
    writeln!(config, "{}\n", command_line.join(" "))?;
    writeln!(config, "# potential data\n{info}")?;
    writeln!(config, "# tracing info")?;
    writeln!(config, "  energy normalization {}", !args.no_norm_energy)?;
    println!("potinfo: {info}");

    let generator = make_initial_conditions(&args.incoming, potential.dimension())?;
    println!("setup took {:.3}s", setup_start.elapsed().as_secs_f64());

    let trace_start = Instant::now();
    let ic_config = InitialConditionConfig {
        particle_count: args.num_particles,
        normalize_energy: !args.no_norm_energy,
        ..Default::default()
    };
    let result = tracer.trace(&generator, ic_config)?;
    println!("calculation took {:.3}s", trace_start.elapsed().as_secs_f64());

    println!(
        "maximum energy deviation: {}%",
        result.max_relative_energy_error * 100.0
    );
    if result.max_relative_energy_error > 1e-3 {
        println!(
            "this is an indicator for numerical problems and could mean that the potential \
             resolution is too low or its strength too high. The mean energy deviation was {}%.",
            result.mean_relative_energy_error * 100.0
        );
    }

    tracer.master().save_all(&args.result_path)?;
    writeln!(config, "# particles {}", result.particle_count)?;
    Ok(())
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(err) = run(&args) {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}
