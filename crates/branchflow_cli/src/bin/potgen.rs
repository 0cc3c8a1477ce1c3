//! Random potential generator front end.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;

use branchflow_cli::make_correlation;
use branchflow_core::fft::FftContext;
use branchflow_core::grid::{Grid, IndexMode};
use branchflow_core::potgen::{discretize_for_fft, generate_potential, PotgenOptions};

/// Generates a stationary random potential with a prescribed spatial
/// correlation, together with its derivatives, and writes it to a binary
/// potential file.
#[derive(Parser, Debug)]
#[command(name = "potgen", version)]
struct Args {
    /// Number of spatial dimensions (1 to 3).
    #[arg(short = 'd', long, default_value_t = 2)]
    dimension: usize,

    /// Grid cells per axis; a single value is used for all axes.
    #[arg(short = 's', long, num_args = 1.., required = true)]
    size: Vec<usize>,

    /// Strength factor stored in the potential file.
    #[arg(long, default_value_t = 1.0)]
    strength: f64,

    /// Correlation length of the random field.
    #[arg(short = 'l', long = "corrlength", default_value_t = 0.1)]
    corrlength: f64,

    /// Correlation function specification: gauss|gaussian [anisotropy...],
    /// sech, or pow|power <alpha>.
    #[arg(short = 'c', long = "correlation", num_args = 1.., default_values_t = vec!["gauss".to_owned()])]
    correlation: Vec<String>,

    /// Linear transformation applied to the correlation argument, given as
    /// 1, 4 or 9 whitespace-separated matrix entries.
    #[arg(long)]
    trafo: Option<String>,

    /// Random seed.
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Highest total derivative order to precompute.
    #[arg(long = "derivative-order", default_value_t = 2)]
    derivative_order: i64,

    /// Maximum number of worker threads; zero selects the hardware count.
    #[arg(short = 't', long, default_value_t = 0)]
    threads: usize,

    /// Print stage timings after the run.
    #[arg(long = "print-profile")]
    print_profile: bool,

    /// Only write the discretised correlation function, skipping the field
    /// synthesis.
    #[arg(long = "correlation-only")]
    correlation_only: bool,

    /// Output file.
    #[arg(short = 'o', long = "output", value_name = "PATH")]
    output: Option<PathBuf>,

    /// Output file, as a positional alternative to -o.
    #[arg(value_name = "OUTPUT")]
    output_positional: Option<PathBuf>,
}

impl Args {
    fn output_path(&self) -> Result<&PathBuf> {
        self.output
            .as_ref()
            .or(self.output_positional.as_ref())
            .context("no output path given")
    }
}

fn run(args: &Args) -> Result<()> {
    if args.dimension < 1 || args.dimension > 3 {
        bail!("invalid dimension {} specified", args.dimension);
    }

    let mut extents = args.size.clone();
    if extents.len() == 1 {
        extents = vec![extents[0]; args.dimension];
    }
    if extents.len() != args.dimension {
        bail!(
            "got {} size values for {} dimensions",
            extents.len(),
            args.dimension
        );
    }

    // create the output file up front: a bad path should fail before the
    // computation, not after
    let output = args.output_path()?;
    let file = File::create(output)
        .with_context(|| format!("could not open result file {output:?}"))?;
    let mut out = BufWriter::with_capacity(512 * 1024, file);

    let correlation = make_correlation(&args.correlation, args.corrlength, args.trafo.as_deref())?;

    // the support keeps the aspect ratio of the extents, normalised so the
    // smallest axis spans one length unit
    let min_extent = *extents.iter().min().expect("at least one extent") as f64;
    let support: Vec<f64> = extents.iter().map(|&e| e as f64 / min_extent).collect();

    info!(
        "generate potential of size {}",
        extents
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("x")
    );

    let start = Instant::now();
    if args.correlation_only {
        let grid = discretize_for_fft(&extents, &support, &correlation, args.threads)?;

        let mut real = Grid::<f64>::try_new(&extents, IndexMode::Identity)?;
        for (out_cell, value) in real.data_mut().iter_mut().zip(grid.as_slice()) {
            *out_cell = value.re;
        }

        println!("saving correlation to {output:?}");
        real.dump(&mut out)?;
    } else {
        let fft = FftContext::new(args.threads)?;
        let options = PotgenOptions {
            seed: args.seed,
            max_derivative_order: args.derivative_order,
            correlation_length: args.corrlength,
            threads: args.threads,
            randomize: true,
        };

        let mut potential = generate_potential(&extents, &support, &correlation, &options, &fft)?;

        // control output: the field should be centred with unit variance
        let data = potential.potential()?.as_slice();
        let mean: f64 = data.iter().sum::<f64>() / data.len() as f64;
        let variance: f64 = data.iter().map(|v| v * v).sum::<f64>() / data.len() as f64;
        println!("Avg: {mean}");
        println!("Var: {variance}");

        potential.set_strength(args.strength);

        println!("saving potential to {output:?}");
        potential.write_to(&mut out)?;
    }
    out.flush()?;

    if args.print_profile {
        println!("total time: {:.3}s", start.elapsed().as_secs_f64());
    }
    Ok(())
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(err) = run(&args) {
        eprintln!("an error occurred: {err:#}");
        std::process::exit(1);
    }
}
