//! Planar starting manifolds.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, UnitSphere};

use crate::error::{Error, Result};
use crate::index::{MultiIndex, MAX_INDEX_DIMENSION};
use crate::tracer::ic::Manifold;
use crate::tracer::state::Vect;

/// Rays start on a plane (or line) spanned by configurable vectors, all with
/// the same velocity.
pub struct Planar {
    world_dimension: usize,
    manifold_dimension: usize,
    origin: Vect,
    velocity: Vect,
    spans: Vec<Vect>,
}

impl Planar {
    pub fn new(world_dimension: usize, manifold_dimension: usize) -> Result<Self> {
        if manifold_dimension > world_dimension {
            return Err(Error::shape(format!(
                "manifold dimension {manifold_dimension} exceeds world dimension {world_dimension}"
            )));
        }

        let mut velocity = Vect::zeros(world_dimension);
        velocity[0] = 1.0;

        // span the trailing axes, innermost first
        let mut spans = Vec::with_capacity(manifold_dimension);
        for i in 0..manifold_dimension {
            let mut span = Vect::zeros(world_dimension);
            span[world_dimension - 1 - i] = 1.0;
            spans.push(span);
        }

        Ok(Planar {
            world_dimension,
            manifold_dimension,
            origin: Vect::zeros(world_dimension),
            velocity,
            spans,
        })
    }

    fn check_dimension(&self, vector: &Vect, what: &str) -> Result<()> {
        if vector.len() != self.world_dimension {
            return Err(Error::shape(format!(
                "{}-dimensional {what} supplied for {}-dimensional world",
                vector.len(),
                self.world_dimension
            )));
        }
        Ok(())
    }

    pub fn set_velocity(&mut self, velocity: Vect) -> Result<()> {
        self.check_dimension(&velocity, "initial velocity")?;
        self.velocity = velocity;
        Ok(())
    }

    pub fn set_origin(&mut self, origin: Vect) -> Result<()> {
        self.check_dimension(&origin, "origin")?;
        self.origin = origin;
        Ok(())
    }

    pub fn set_spanning_vector(&mut self, index: usize, span: Vect) -> Result<()> {
        if index >= self.spans.len() {
            return Err(Error::domain(format!(
                "spanning vector index {index} not valid for a {}-dimensional manifold",
                self.manifold_dimension
            )));
        }
        self.check_dimension(&span, "spanning vector")?;
        if span.dot(&span) < 1e-5 {
            return Err(Error::domain(format!(
                "spanning vector for index {index} has zero length"
            )));
        }
        self.spans[index] = span;
        Ok(())
    }
}

impl Manifold for Planar {
    fn name(&self) -> &'static str {
        "planar"
    }

    fn world_dimension(&self) -> usize {
        self.world_dimension
    }

    fn manifold_dimension(&self) -> usize {
        self.manifold_dimension
    }

    fn generate(&self, pos: &[f64], position: &mut Vect, velocity: &mut Vect) {
        let mut p = self.origin;
        for (span, &u) in self.spans.iter().zip(pos) {
            p = p.add_scaled(span, u);
        }
        *position = p;
        *velocity = self.velocity;
    }
}

/// Every trajectory draws a random direction (uniform on the sphere) and a
/// random position in the unit box, unless fixed; the deltas span the
/// hyperplane orthogonal to the velocity, as if neighbouring rays of a plane
/// wave started in the same direction.
pub struct RandomPlanar {
    world_dimension: usize,
    fixed_position: Option<Vect>,
    fixed_velocity: Option<Vect>,
    rng: ChaCha20Rng,
    position: Vect,
    velocity: Vect,
    directions: Vec<Vect>,
    manifold_start: [f64; MAX_INDEX_DIMENSION],
}

impl RandomPlanar {
    pub fn new(world_dimension: usize, seed: u64) -> Result<Self> {
        if world_dimension < 2 {
            return Err(Error::shape(
                "random planar initial conditions require at least two dimensions",
            ));
        }
        Ok(RandomPlanar {
            world_dimension,
            fixed_position: None,
            fixed_velocity: None,
            rng: ChaCha20Rng::seed_from_u64(seed),
            position: Vect::zeros(world_dimension),
            velocity: Vect::zeros(world_dimension),
            directions: vec![Vect::zeros(world_dimension); world_dimension - 1],
            manifold_start: [0.0; MAX_INDEX_DIMENSION],
        })
    }

    pub fn set_fixed_position(&mut self, position: Vect) -> Result<()> {
        if position.len() != self.world_dimension {
            return Err(Error::shape(format!(
                "{}-dimensional position for {}-dimensional world",
                position.len(),
                self.world_dimension
            )));
        }
        self.fixed_position = Some(position);
        Ok(())
    }

    pub fn set_fixed_velocity(&mut self, velocity: Vect) -> Result<()> {
        if velocity.len() != self.world_dimension {
            return Err(Error::shape(format!(
                "{}-dimensional velocity for {}-dimensional world",
                velocity.len(),
                self.world_dimension
            )));
        }
        self.fixed_velocity = Some(velocity);
        Ok(())
    }

    fn draw_position(&mut self) {
        if let Some(fixed) = self.fixed_position {
            self.position = fixed;
            return;
        }
        for i in 0..self.world_dimension {
            self.position[i] = self.rng.gen::<f64>();
        }
    }

    fn draw_velocity(&mut self) {
        if let Some(fixed) = self.fixed_velocity {
            self.velocity = fixed;
            return;
        }
        if self.world_dimension == 2 {
            let angle = self.rng.gen::<f64>() * std::f64::consts::TAU;
            self.velocity[0] = angle.sin();
            self.velocity[1] = angle.cos();
        } else {
            let point: [f64; 3] = UnitSphere.sample(&mut self.rng);
            self.velocity = Vect::from_slice(&point);
        }
    }
}

impl Manifold for RandomPlanar {
    fn name(&self) -> &'static str {
        "random_planar"
    }

    fn world_dimension(&self) -> usize {
        self.world_dimension
    }

    fn manifold_dimension(&self) -> usize {
        self.world_dimension - 1
    }

    fn next_trajectory(&mut self, pos: &[f64], _index: &mut MultiIndex) -> Result<()> {
        self.manifold_start[..pos.len()].copy_from_slice(pos);
        self.draw_position();
        self.draw_velocity();

        if self.world_dimension == 2 {
            // rotate the velocity by 90°: (x, y) x e_z
            self.directions[0][0] = -self.velocity[1];
            self.directions[0][1] = self.velocity[0];
        } else {
            // build two directions orthogonal to the velocity out of the
            // standard basis, skipping nearly-parallel candidates
            let mut found = 0;
            for i in 0..3 {
                let mut basis = Vect::zeros(3);
                basis[i] = 1.0;
                let candidate = Vect::cross(&basis, &self.velocity);
                let norm = candidate.norm();
                if norm > 0.2 {
                    self.directions[found] = candidate.scaled(1.0 / norm);
                    found += 1;
                    if found == 2 {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn generate(&self, pos: &[f64], position: &mut Vect, velocity: &mut Vect) {
        let mut p = self.position;
        for (j, direction) in self.directions.iter().enumerate() {
            p = p.add_scaled(direction, pos[j] - self.manifold_start[j]);
        }
        *position = p;
        *velocity = self.velocity;
    }
}
