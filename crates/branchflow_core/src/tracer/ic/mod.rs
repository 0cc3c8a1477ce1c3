//! Initial-condition manifolds.
//!
//! A manifold parametrises starting states by coordinates `u ∈ [0,1]^m`. The
//! generator walks an integer lattice over the manifold, derives each state's
//! finite-difference deltas, and hands out initial conditions to any number
//! of concurrent workers without gaps or duplicates.

mod planar;
mod radial;

pub use planar::{Planar, RandomPlanar};
pub use radial::{Radial2D, Radial3D, RandomRadial};

use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::index::{MultiIndex, MAX_INDEX_DIMENSION};
use crate::tracer::dynamics::RayDynamics;
use crate::tracer::state::{State, Vect};

/// Finite-difference step along the manifold for the delta states.
const DELTA_STEP: f64 = 1e-5;

/// Run configuration shared by all manifolds.
#[derive(Clone)]
pub struct InitialConditionConfig {
    pub particle_count: u64,
    pub support: Vec<f64>,
    pub offset: Vec<f64>,
    /// Scale generated positions by the support before applying the offset.
    pub relative_coordinates: bool,
    /// Rescale every velocity so the total energy is ½.
    pub normalize_energy: bool,
    pub dynamics: Option<Arc<dyn RayDynamics>>,
}

impl Default for InitialConditionConfig {
    fn default() -> Self {
        InitialConditionConfig {
            particle_count: 0,
            support: Vec::new(),
            offset: Vec::new(),
            relative_coordinates: true,
            normalize_energy: true,
            dynamics: None,
        }
    }
}

/// One starting state plus the finite-difference derivatives along the
/// manifold axes, used by caustic detection.
#[derive(Debug, Clone)]
pub struct InitialCondition {
    pub state: State,
    pub deltas: Vec<State>,
    pub manifold_index: Vec<i64>,
    pub manifold_coordinates: Vec<f64>,
}

/// A family of starting states indexed by manifold coordinates.
pub trait Manifold: Send {
    fn name(&self) -> &'static str;

    fn world_dimension(&self) -> usize;

    fn manifold_dimension(&self) -> usize;

    /// Sets the iteration bounds. The default distributes `⌊N^{1/m}⌋` cells
    /// per axis; subtypes override this for non-rectangular samplings.
    fn init_index(&mut self, particle_count: u64, index: &mut MultiIndex) -> Result<()> {
        let root = (particle_count as f64).powf(1.0 / self.manifold_dimension() as f64);
        index.set_upper_bound(root.floor() as i64)
    }

    /// Hook called once per trajectory before `generate`; may draw random
    /// state or adjust trailing iteration bounds.
    fn next_trajectory(&mut self, _pos: &[f64], _index: &mut MultiIndex) -> Result<()> {
        Ok(())
    }

    /// Produces the raw state for manifold coordinates `pos`, before support
    /// scaling, offset and energy normalisation.
    fn generate(&self, pos: &[f64], position: &mut Vect, velocity: &mut Vect);
}

struct GeneratorInner {
    manifold: Box<dyn Manifold>,
    index: MultiIndex,
    manifold_pos: [f64; MAX_INDEX_DIMENSION],
    config: InitialConditionConfig,
    exhausted: bool,
}

/// Thread-safe source of initial conditions. `next` is serialised by a mutex
/// so concurrent workers consume the manifold lattice exactly once.
pub struct InitialConditionGenerator {
    world_dimension: usize,
    manifold_dimension: usize,
    inner: Mutex<GeneratorInner>,
}

impl InitialConditionGenerator {
    pub fn new(manifold: Box<dyn Manifold>) -> Result<Self> {
        let world_dimension = manifold.world_dimension();
        let manifold_dimension = manifold.manifold_dimension();
        if manifold_dimension == 0 || manifold_dimension > 2 * world_dimension {
            return Err(Error::shape(format!(
                "incompatible dimensions: manifold {manifold_dimension} in world {world_dimension}"
            )));
        }
        let index = MultiIndex::new(manifold_dimension)?;
        Ok(InitialConditionGenerator {
            world_dimension,
            manifold_dimension,
            inner: Mutex::new(GeneratorInner {
                manifold,
                index,
                manifold_pos: [0.0; MAX_INDEX_DIMENSION],
                config: InitialConditionConfig::default(),
                exhausted: true,
            }),
        })
    }

    pub fn world_dimension(&self) -> usize {
        self.world_dimension
    }

    pub fn manifold_dimension(&self) -> usize {
        self.manifold_dimension
    }

    /// Prepares iteration for a run. Must be called before `next`.
    pub fn init(&self, config: InitialConditionConfig) -> Result<()> {
        if config.particle_count < 1 {
            return Err(Error::programming(
                "initial condition generator initialised without particles",
            ));
        }
        if config.normalize_energy && config.dynamics.is_none() {
            return Err(Error::programming(
                "energy normalisation requested but no dynamics set",
            ));
        }
        if config.support.len() != self.world_dimension {
            return Err(Error::shape(format!(
                "{}-dimensional support in {}-dimensional world",
                config.support.len(),
                self.world_dimension
            )));
        }
        if config.offset.len() != self.world_dimension {
            return Err(Error::shape(format!(
                "{}-dimensional offset in {}-dimensional world",
                config.offset.len(),
                self.world_dimension
            )));
        }

        let mut inner = self.inner.lock().expect("generator mutex poisoned");
        let inner = &mut *inner;
        inner.config = config;

        inner.index = MultiIndex::new(self.manifold_dimension)?;
        inner.index.set_lower_bound(0)?;
        inner
            .manifold
            .init_index(inner.config.particle_count, &mut inner.index)?;
        inner.index.init()?;
        inner.exhausted = false;
        update_manifold_position(inner);
        Ok(())
    }

    /// Produces the next initial condition, or `None` when the manifold is
    /// exhausted. Safe to call from many threads.
    pub fn next(&self) -> Result<Option<InitialCondition>> {
        let mut inner = self.inner.lock().expect("generator mutex poisoned");
        let inner = &mut *inner;
        if inner.exhausted || !inner.index.valid() {
            return Ok(None);
        }

        let m = self.manifold_dimension;
        let pos = inner.manifold_pos;
        inner.manifold.next_trajectory(&pos[..m], &mut inner.index)?;

        let mut state = State::new(self.world_dimension);
        generate_normalized(inner, &pos[..m], &mut state)?;

        let manifold_index = inner.index.as_vec();
        let manifold_coordinates = inner.manifold_pos[..m].to_vec();

        // deltas: forward difference of the fully normalised state
        let mut deltas = Vec::with_capacity(m);
        for axis in 0..m {
            let mut shifted_pos = inner.manifold_pos;
            shifted_pos[axis] += DELTA_STEP;

            let mut shifted = State::new(self.world_dimension);
            generate_normalized(inner, &shifted_pos[..m], &mut shifted)?;

            let mut delta = State::new(self.world_dimension);
            *delta.position_mut() = shifted
                .position()
                .sub(state.position())
                .scaled(1.0 / DELTA_STEP);
            *delta.velocity_mut() = shifted
                .velocity()
                .sub(state.velocity())
                .scaled(1.0 / DELTA_STEP);
            deltas.push(delta);
        }

        inner.index.increment();
        if inner.index.valid() {
            update_manifold_position(inner);
        } else {
            inner.exhausted = true;
        }

        Ok(Some(InitialCondition {
            state,
            deltas,
            manifold_index,
            manifold_coordinates,
        }))
    }
}

fn update_manifold_position(inner: &mut GeneratorInner) {
    for axis in 0..inner.index.dimension() {
        inner.manifold_pos[axis] =
            (inner.index.get(axis) as f64 + 0.5) / inner.index.upper_bound(axis) as f64;
    }
}

fn generate_normalized(inner: &GeneratorInner, pos: &[f64], state: &mut State) -> Result<()> {
    let mut position = Vect::zeros(inner.manifold.world_dimension());
    let mut velocity = Vect::zeros(inner.manifold.world_dimension());
    inner.manifold.generate(pos, &mut position, &mut velocity);

    if inner.config.relative_coordinates {
        for (i, &support) in inner.config.support.iter().enumerate() {
            position[i] *= support;
        }
    }
    for (i, &offset) in inner.config.offset.iter().enumerate() {
        position[i] += offset;
    }

    *state.position_mut() = position;
    *state.velocity_mut() = velocity;

    if inner.config.normalize_energy {
        let dynamics = inner
            .config
            .dynamics
            .as_ref()
            .ok_or_else(|| Error::programming("energy normalisation without dynamics"))?;
        dynamics.normalize_energy(state, 0.5)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn plain_config(count: u64, dim: usize) -> InitialConditionConfig {
        InitialConditionConfig {
            particle_count: count,
            support: vec![1.0; dim],
            offset: vec![0.0; dim],
            relative_coordinates: false,
            normalize_energy: false,
            dynamics: None,
        }
    }

    #[test]
    fn lattice_is_floor_of_count_root() {
        let generator =
            InitialConditionGenerator::new(Box::new(Planar::new(2, 1).unwrap())).unwrap();
        generator.init(plain_config(10, 2)).unwrap();

        let mut count = 0;
        while generator.next().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 10); // ⌊10^(1/1)⌋ = 10

        let generator =
            InitialConditionGenerator::new(Box::new(Planar::new(3, 2).unwrap())).unwrap();
        generator.init(plain_config(10, 3)).unwrap();
        let mut count = 0;
        while generator.next().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 9); // ⌊10^(1/2)⌋² = 9
    }

    #[test]
    fn concurrent_consumers_see_every_index_once() {
        let generator = Arc::new(
            InitialConditionGenerator::new(Box::new(Planar::new(3, 2).unwrap())).unwrap(),
        );
        generator.init(plain_config(170, 3)).unwrap(); // 13² cells

        let mut handles = Vec::new();
        for _ in 0..4 {
            let generator = Arc::clone(&generator);
            handles.push(std::thread::spawn(move || {
                let mut indices = Vec::new();
                while let Some(ic) = generator.next().unwrap() {
                    indices.push(ic.manifold_index.clone());
                }
                indices
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.join().unwrap());
        }

        let unique: HashSet<_> = all.iter().cloned().collect();
        assert_eq!(all.len(), 169);
        assert_eq!(unique.len(), 169);
    }

    #[test]
    fn coordinates_are_cell_centred() {
        let generator =
            InitialConditionGenerator::new(Box::new(Planar::new(2, 1).unwrap())).unwrap();
        generator.init(plain_config(4, 2)).unwrap();

        let first = generator.next().unwrap().unwrap();
        assert!((first.manifold_coordinates[0] - 0.125).abs() < 1e-12);
        let second = generator.next().unwrap().unwrap();
        assert!((second.manifold_coordinates[0] - 0.375).abs() < 1e-12);
    }

    #[test]
    fn offset_and_support_are_applied() {
        let generator =
            InitialConditionGenerator::new(Box::new(Planar::new(2, 1).unwrap())).unwrap();
        let config = InitialConditionConfig {
            particle_count: 2,
            support: vec![4.0, 4.0],
            offset: vec![0.5, 0.25],
            relative_coordinates: true,
            normalize_energy: false,
            dynamics: None,
        };
        generator.init(config).unwrap();

        // planar manifold spans the last axis, origin zero
        let ic = generator.next().unwrap().unwrap();
        assert!((ic.state.position()[0] - 0.5).abs() < 1e-12);
        assert!((ic.state.position()[1] - (0.25 * 4.0 + 0.25)).abs() < 1e-12);
    }

    #[test]
    fn deltas_are_difference_quotients() {
        let generator =
            InitialConditionGenerator::new(Box::new(Planar::new(2, 1).unwrap())).unwrap();
        generator.init(plain_config(4, 2)).unwrap();

        let ic = generator.next().unwrap().unwrap();
        assert_eq!(ic.deltas.len(), 1);
        // planar: dp/du is the spanning vector, dv/du = 0
        assert!((ic.deltas[0].position()[1] - 1.0).abs() < 1e-6);
        assert!(ic.deltas[0].position()[0].abs() < 1e-9);
        assert!(ic.deltas[0].velocity().norm() < 1e-9);
    }

    #[test]
    fn init_validates_configuration() {
        let generator =
            InitialConditionGenerator::new(Box::new(Planar::new(2, 1).unwrap())).unwrap();
        assert!(generator.init(plain_config(0, 2)).is_err());
        assert!(generator.init(plain_config(4, 3)).is_err());

        let mut bad = plain_config(4, 2);
        bad.normalize_energy = true;
        assert!(generator.init(bad).is_err());
    }
}
