//! Name-to-constructor registries for the command line front ends.
//!
//! Correlations, initial conditions, dynamics and observers are selected by
//! name on the command line, each followed by its own arguments. Observer
//! argument lists are grouped by splitting at registered observer names, so
//! any token that is not a name belongs to the observer before it.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};

use branchflow_core::correlation::{self, CorrelationFn};
use branchflow_core::memory::MemoryBudget;
use branchflow_core::potential::Potential;
use branchflow_core::tracer::dynamics::{ParticleInPotential, RayDynamics};
use branchflow_core::tracer::ic::{
    InitialConditionGenerator, Manifold, Planar, Radial2D, Radial3D, RandomPlanar, RandomRadial,
};
use branchflow_core::tracer::observers::{
    AngularHistogramObserver, CausticObserver, DensityObserver, ExtractFn, LocalObserver,
    RadialDensityObserver, SharedObserver, VelocityHistogramObserver, VelocityTransitionObserver,
};
use branchflow_core::tracer::state::{State, Vect};

/// Seed for the random initial-condition manifolds; fixed so repeated runs
/// trace the same ensemble.
const IC_SEED: u64 = 0;

// ---------------------------------------------------------------------------
// correlation functions
// ---------------------------------------------------------------------------

pub const CORRELATION_NAMES: &[&str] = &["gauss", "gaussian", "sech", "pow", "power"];

/// Builds a correlation function from its command line specification
/// `<type> [args...]`, optionally wrapped in a linear transformation.
pub fn make_correlation(
    specs: &[String],
    length: f64,
    trafo: Option<&str>,
) -> Result<CorrelationFn> {
    let kind = specs
        .first()
        .ok_or_else(|| anyhow!("empty correlation specification"))?;

    let base = match kind.as_str() {
        "gauss" | "gaussian" => {
            if specs.len() == 1 {
                correlation::gaussian(length)
            } else {
                let anisotropy: Vec<f64> = specs[1..]
                    .iter()
                    .map(|s| s.parse::<f64>().context("invalid anisotropy factor"))
                    .collect::<Result<_>>()?;
                correlation::anisotropic_gaussian(length, &anisotropy)
            }
        }
        "sech" => correlation::sech(length),
        "pow" | "power" => {
            let alpha = specs
                .get(1)
                .ok_or_else(|| anyhow!("power correlation requires an exponent"))?
                .parse::<f64>()
                .context("invalid power correlation exponent")?;
            correlation::power(length, alpha)
        }
        other => bail!(
            "correlation type {other:?} is not valid; registered types: {}",
            CORRELATION_NAMES.join(", ")
        ),
    };

    match trafo {
        None => Ok(base),
        Some(text) => {
            let matrix = correlation::parse_trafo_matrix(text)?;
            Ok(correlation::transformed(base, matrix))
        }
    }
}

// ---------------------------------------------------------------------------
// token helpers
// ---------------------------------------------------------------------------

/// Cursor over one name's argument group.
struct TokenCursor<'a> {
    tokens: &'a [String],
    position: usize,
    owner: &'a str,
}

impl<'a> TokenCursor<'a> {
    fn new(owner: &'a str, tokens: &'a [String]) -> Self {
        TokenCursor {
            tokens,
            position: 0,
            owner,
        }
    }

    fn peek(&self) -> Option<&'a str> {
        self.tokens.get(self.position).map(String::as_str)
    }

    fn next(&mut self) -> Option<&'a str> {
        let token = self.peek();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn value(&mut self, name: &str) -> Result<&'a str> {
        self.next()
            .ok_or_else(|| anyhow!("missing value for argument {name:?} of {:?}", self.owner))
    }

    /// Consumes tokens as long as they parse as numbers.
    fn numbers(&mut self, name: &str) -> Result<Vec<f64>> {
        let mut values = Vec::new();
        while let Some(token) = self.peek() {
            match token.parse::<f64>() {
                Ok(value) => {
                    values.push(value);
                    self.position += 1;
                }
                Err(_) => break,
            }
        }
        if values.is_empty() {
            bail!("argument {name:?} of {:?} expects numeric values", self.owner);
        }
        Ok(values)
    }

    fn finish(self) -> Result<()> {
        match self.peek() {
            None => Ok(()),
            Some(token) => bail!("unexpected argument {token:?} for {:?}", self.owner),
        }
    }
}

fn parse_vect(values: &[f64], dimension: usize, what: &str) -> Result<Vect> {
    if values.len() != dimension {
        bail!("{what} needs {dimension} components, got {}", values.len());
    }
    Ok(Vect::from_slice(values))
}

// ---------------------------------------------------------------------------
// initial conditions
// ---------------------------------------------------------------------------

pub const INITIAL_CONDITION_NAMES: &[&str] =
    &["planar", "random_planar", "radial", "random_radial"];

/// Builds the initial-condition generator from `<name> [args...]`.
pub fn make_initial_conditions(
    tokens: &[String],
    dimension: usize,
) -> Result<InitialConditionGenerator> {
    let name = tokens
        .first()
        .ok_or_else(|| anyhow!("empty initial condition specification"))?;
    let mut cursor = TokenCursor::new(name, &tokens[1..]);

    let manifold: Box<dyn Manifold> = match name.as_str() {
        "planar" => {
            let mut planar = Planar::new(dimension, dimension - 1)?;
            while let Some(token) = cursor.next() {
                match token {
                    "velocity" | "vel" => {
                        let values = cursor.numbers("velocity")?;
                        planar.set_velocity(parse_vect(&values, dimension, "velocity")?)?;
                    }
                    "origin" | "pos" => {
                        let values = cursor.numbers("origin")?;
                        planar.set_origin(parse_vect(&values, dimension, "origin")?)?;
                    }
                    other => bail!("unexpected argument {other:?} for \"planar\""),
                }
            }
            Box::new(planar)
        }
        "random_planar" => {
            let mut wave = RandomPlanar::new(dimension, IC_SEED)?;
            while let Some(token) = cursor.next() {
                match token {
                    "velocity" | "vel" => {
                        let values = cursor.numbers("velocity")?;
                        wave.set_fixed_velocity(parse_vect(&values, dimension, "velocity")?)?;
                    }
                    "origin" | "pos" => {
                        let values = cursor.numbers("origin")?;
                        wave.set_fixed_position(parse_vect(&values, dimension, "origin")?)?;
                    }
                    other => bail!("unexpected argument {other:?} for \"random_planar\""),
                }
            }
            Box::new(wave)
        }
        "radial" => {
            let mut origin = None;
            while let Some(token) = cursor.next() {
                match token {
                    "origin" | "pos" => {
                        let values = cursor.numbers("origin")?;
                        origin = Some(parse_vect(&values, dimension, "origin")?);
                    }
                    other => bail!("unexpected argument {other:?} for \"radial\""),
                }
            }
            match dimension {
                2 => {
                    let mut wave = Radial2D::new(dimension)?;
                    if let Some(origin) = origin {
                        wave.set_origin(origin)?;
                    }
                    Box::new(wave)
                }
                3 => {
                    let mut wave = Radial3D::new(dimension)?;
                    if let Some(origin) = origin {
                        wave.set_origin(origin)?;
                    }
                    Box::new(wave)
                }
                d => bail!("radial initial conditions need dimension 2 or 3, got {d}"),
            }
        }
        "random_radial" => Box::new(RandomRadial::new(dimension, IC_SEED)?),
        other => bail!(
            "{other:?} is not an initial condition name; registered names: {}",
            INITIAL_CONDITION_NAMES.join(", ")
        ),
    };

    Ok(InitialConditionGenerator::new(manifold)?)
}

// ---------------------------------------------------------------------------
// dynamics
// ---------------------------------------------------------------------------

pub const DYNAMICS_NAMES: &[&str] = &["particle_potential"];

/// Builds the ray dynamics from `<name> [args...]`.
pub fn make_dynamics(
    tokens: &[String],
    potential: &Potential,
    periodic: bool,
    monodromy: bool,
) -> Result<Arc<dyn RayDynamics>> {
    let name = tokens
        .first()
        .ok_or_else(|| anyhow!("empty dynamics specification"))?;
    let cursor = TokenCursor::new(name, &tokens[1..]);

    match name.as_str() {
        "particle_potential" => {
            cursor.finish()?;
            Ok(Arc::new(ParticleInPotential::new(
                potential, periodic, monodromy,
            )?))
        }
        other => bail!(
            "{other:?} is not a dynamics name; registered names: {}",
            DYNAMICS_NAMES.join(", ")
        ),
    }
}

// ---------------------------------------------------------------------------
// observers
// ---------------------------------------------------------------------------

pub const OBSERVER_NAMES: &[&str] = &[
    "angle_histogram",
    "caustics",
    "density",
    "radial_density",
    "velocity_histogram",
    "velocity_transitions",
];

/// Observer handles ready to register with the tracer.
pub struct ObserverSet {
    pub locals: Vec<Arc<Mutex<dyn LocalObserver>>>,
    pub shared: Vec<Arc<Mutex<dyn SharedObserver>>>,
    pub needs_monodromy: bool,
}

/// Splits the observer token stream into per-observer groups. Grouping is by
/// registered names only: a token that is no observer name belongs to the
/// observer named before it.
fn group_observer_tokens(tokens: &[String]) -> Result<Vec<(usize, usize)>> {
    let mut groups: Vec<(usize, usize)> = Vec::new();
    for (position, token) in tokens.iter().enumerate() {
        if OBSERVER_NAMES.contains(&token.as_str()) {
            if let Some(last) = groups.last_mut() {
                last.1 = position;
            }
            groups.push((position, tokens.len()));
        } else if groups.is_empty() {
            bail!(
                "{token:?} is not an observer name; registered names: {}",
                OBSERVER_NAMES.join(", ")
            );
        }
    }
    Ok(groups)
}

/// Whether an observer configuration requires monodromy integration.
pub fn observers_need_monodromy(tokens: &[String]) -> bool {
    tokens.iter().any(|token| token == "caustics")
}

/// Builds all observers from the command line token stream.
pub fn make_observers(
    tokens: &[String],
    potential: &Potential,
    budget: &Arc<MemoryBudget>,
) -> Result<ObserverSet> {
    let dimension = potential.dimension();
    let mut set = ObserverSet {
        locals: Vec::new(),
        shared: Vec::new(),
        needs_monodromy: observers_need_monodromy(tokens),
    };

    for (start, end) in group_observer_tokens(tokens)? {
        let name = tokens[start].as_str();
        let mut cursor = TokenCursor::new(name, &tokens[start + 1..end]);

        match name {
            "caustics" => {
                let mut break_on_first = false;
                let mut file_name = "caustics.dat".to_owned();
                if let Some(token) = cursor.peek() {
                    if let Ok(flag) = token.parse::<bool>() {
                        break_on_first = flag;
                        cursor.next();
                    }
                }
                while let Some(token) = cursor.next() {
                    match token {
                        "file_name" => file_name = cursor.value("file_name")?.to_owned(),
                        other => bail!("unexpected argument {other:?} for \"caustics\""),
                    }
                }
                set.locals.push(Arc::new(Mutex::new(CausticObserver::new(
                    dimension,
                    break_on_first,
                    file_name,
                )?)));
            }
            "density" => {
                let mut center = false;
                let mut size: Vec<usize> = Vec::new();
                let mut support: Vec<f64> = Vec::new();
                let mut extractor = vec!["dens".to_owned()];
                let mut file_name = "density.dat".to_owned();

                while let Some(token) = cursor.next() {
                    match token {
                        "center" | "c" => center = true,
                        "size" | "s" => {
                            size = cursor
                                .numbers("size")?
                                .into_iter()
                                .map(|v| v as usize)
                                .collect();
                        }
                        "support" | "supp" => support = cursor.numbers("support")?,
                        "extractor" | "e" => {
                            extractor = vec![cursor.value("extractor")?.to_owned()];
                            if extractor[0] == "vel" || extractor[0] == "velocity" {
                                extractor.push(cursor.value("extractor direction")?.to_owned());
                            }
                        }
                        "file_name" => file_name = cursor.value("file_name")?.to_owned(),
                        other => bail!("unexpected argument {other:?} for \"density\""),
                    }
                }

                if size.is_empty() {
                    size = potential.extents().to_vec();
                } else if size.len() == 1 {
                    size = vec![size[0]; dimension];
                }
                if size.len() != dimension {
                    bail!("invalid size specified for density observer");
                }

                if support.is_empty() {
                    support = potential.support().to_vec();
                } else if support.len() == 1 {
                    support = vec![support[0]; dimension];
                }
                if support.len() != dimension {
                    bail!("invalid support specified for density observer");
                }

                let extract: ExtractFn = match extractor[0].as_str() {
                    "dens" => Arc::new(|_state: &State| 1.0),
                    "vel" | "velocity" => {
                        let direction = extractor[1]
                            .parse::<usize>()
                            .context("invalid direction for velocity extraction")?;
                        if direction >= dimension {
                            bail!(
                                "invalid direction {direction} for velocity extraction \
                                 in density observer"
                            );
                        }
                        file_name = format!("velocity{direction}.dat");
                        Arc::new(move |state: &State| state.velocity()[direction])
                    }
                    other => bail!("unknown extractor {other:?} specified in density observer"),
                };

                set.locals.push(Arc::new(Mutex::new(DensityObserver::new(
                    size,
                    support,
                    file_name,
                    center,
                    extract,
                    Arc::clone(budget),
                )?)));
            }
            "velocity_transitions" => {
                let interval = cursor
                    .value("interval")?
                    .parse::<f64>()
                    .context("invalid velocity transition interval")?;
                let mut bin_count = 100usize;
                if let Some(token) = cursor.peek() {
                    if let Ok(bins) = token.parse::<usize>() {
                        bin_count = bins;
                        cursor.next();
                    }
                }

                let mut start_time = 0.0;
                let mut end_time = 1e100;
                let mut mode = String::new();
                let mut increment = false;
                let mut file_name = "velocity_transitions.dat".to_owned();
                while let Some(token) = cursor.next() {
                    match token {
                        "start_time" => {
                            start_time = cursor.value("start_time")?.parse()
                                .context("invalid start_time")?;
                        }
                        "end_time" => {
                            end_time = cursor.value("end_time")?.parse()
                                .context("invalid end_time")?;
                        }
                        "mode" => mode = cursor.value("mode")?.to_owned(),
                        "increment" => increment = true,
                        "file_name" => file_name = cursor.value("file_name")?.to_owned(),
                        other => {
                            bail!("unexpected argument {other:?} for \"velocity_transitions\"")
                        }
                    }
                }

                // by default, drop the mean-flow component on both sides
                let mut mask_in = vec![true; dimension];
                let mut mask_out = vec![true; dimension];
                mask_in[0] = false;
                mask_out[0] = false;
                if !mode.is_empty() {
                    let bits: Vec<bool> = mode.chars().map(|c| c == '1').collect();
                    if bits.len() != 2 * dimension {
                        bail!("velocity transition mode needs {} bits", 2 * dimension);
                    }
                    mask_in.copy_from_slice(&bits[..dimension]);
                    mask_out.copy_from_slice(&bits[dimension..]);
                }

                set.shared
                    .push(Arc::new(Mutex::new(VelocityTransitionObserver::new(
                        dimension,
                        interval,
                        bin_count,
                        start_time,
                        end_time,
                        &mask_in,
                        &mask_out,
                        increment,
                        file_name,
                    )?)));
            }
            "velocity_histogram" => {
                let mut times: Vec<f64> = (1..=50).map(|i| i as f64 / 50.0).collect();
                let mut bin_count = 100usize;
                let mut file_name = "velocity_histograms.dat".to_owned();

                // optional positional: a file holding the observation times
                if let Some(token) = cursor.peek() {
                    if token != "file_name" && token.parse::<usize>().is_err() {
                        let path = cursor.next().expect("peeked token");
                        let text = std::fs::read_to_string(path).with_context(|| {
                            format!("could not read velocity histogram times from {path:?}")
                        })?;
                        times = text
                            .split_whitespace()
                            .map(|t| t.parse::<f64>().context("invalid time value"))
                            .collect::<Result<_>>()?;
                    }
                }
                if let Some(token) = cursor.peek() {
                    if let Ok(bins) = token.parse::<usize>() {
                        bin_count = bins;
                        cursor.next();
                    }
                }
                while let Some(token) = cursor.next() {
                    match token {
                        "file_name" => file_name = cursor.value("file_name")?.to_owned(),
                        other => {
                            bail!("unexpected argument {other:?} for \"velocity_histogram\"")
                        }
                    }
                }

                set.locals
                    .push(Arc::new(Mutex::new(VelocityHistogramObserver::new(
                        dimension, times, bin_count, file_name,
                    )?)));
            }
            "radial_density" => {
                if dimension != 2 {
                    bail!("radial density observation currently only supports 2D tracing");
                }
                let resolution = cursor
                    .value("resolution")?
                    .parse::<usize>()
                    .context("invalid angular resolution for radial density observer")?;

                let mut radii: Vec<f64> = Vec::new();
                let mut file_name = "angular_density.dat".to_owned();
                while let Some(token) = cursor.next() {
                    match token {
                        "radii" => radii = cursor.numbers("radii")?,
                        "file_name" => file_name = cursor.value("file_name")?.to_owned(),
                        other => bail!("unexpected argument {other:?} for \"radial_density\""),
                    }
                }
                if radii.is_empty() {
                    bail!("radial density observation requires a list of radii");
                }

                set.locals
                    .push(Arc::new(Mutex::new(RadialDensityObserver::new(
                        resolution, radii, file_name,
                    )?)));
            }
            "angle_histogram" => {
                let mut times: Vec<f64> = (1..=100).map(|i| i as f64 / 100.0).collect();
                let mut interval = 0.01;
                let mut file_name = "angle_histograms.dat".to_owned();

                // optional positional: a file holding the observation times
                if let Some(token) = cursor.peek() {
                    if token != "file_name" && token.parse::<f64>().is_err() {
                        let path = cursor.next().expect("peeked token");
                        let text = std::fs::read_to_string(path).with_context(|| {
                            format!("could not read angle histogram times from {path:?}")
                        })?;
                        times = text
                            .split_whitespace()
                            .map(|t| t.parse::<f64>().context("invalid time value"))
                            .collect::<Result<_>>()?;
                    }
                }
                if let Some(token) = cursor.peek() {
                    if let Ok(value) = token.parse::<f64>() {
                        interval = value;
                        cursor.next();
                    }
                }
                while let Some(token) = cursor.next() {
                    match token {
                        "file_name" => file_name = cursor.value("file_name")?.to_owned(),
                        other => bail!("unexpected argument {other:?} for \"angle_histogram\""),
                    }
                }

                set.locals
                    .push(Arc::new(Mutex::new(AngularHistogramObserver::new(
                        times, interval, file_name,
                    )?)));
            }
            other => bail!(
                "{other:?} is not an observer name; registered names: {}",
                OBSERVER_NAMES.join(", ")
            ),
        }
    }

    Ok(set)
}

/// Potential metadata block for `config.txt` and the console.
pub fn potential_info(potential: &Potential) -> String {
    let join = |values: Vec<String>, sep: &str| values.join(sep);
    let extents: Vec<String> = potential.extents().iter().map(|e| e.to_string()).collect();
    let support: Vec<String> = potential.support().iter().map(|s| s.to_string()).collect();
    format!(
        "size: {}\nsupport: {}\nseed: {}\ncorr length: {}\nstrength: {}\nversion: {}\n",
        join(extents, "x"),
        join(support, "x"),
        potential.seed(),
        potential.correlation_length(),
        potential.strength(),
        potential.version(),
    )
}
