//! Hamiltonian dynamics of a point mass in a random potential.

use crate::error::{Error, Result};
use crate::grid::{Grid, IndexMode};
use crate::interp;
use crate::potential::Potential;
use crate::tracer::state::{State, MAX_WORLD_DIMENSION};

/// Sentinel raised by the state update when a non-periodic trajectory leaves
/// the sampled domain. The integrator turns it into a trajectory-level stop;
/// it never escapes a worker.
#[derive(Debug, Clone, Copy)]
pub struct OutOfDomain;

/// The dynamics driving a trajectory ensemble.
pub trait RayDynamics: Send + Sync {
    fn dimension(&self) -> usize;

    /// Whether states carry (and the update advances) a monodromy matrix.
    fn has_monodromy(&self) -> bool;

    fn periodic_boundary(&self) -> bool;

    /// Writes `d state / dt` into `dxdt`. Layout as in [`RayState`].
    fn state_update(&self, x: &[f64], dxdt: &mut [f64], t: f64)
        -> std::result::Result<(), OutOfDomain>;

    /// Rescales the velocity so the total energy becomes `total_energy`.
    fn normalize_energy(&self, state: &mut State, total_energy: f64) -> Result<()>;

    /// Total energy `½‖v‖² + Φ(p)` of a state.
    fn energy(&self, state: &State) -> f64;
}

/// `dp/dt = v`, `dv/dt = −∇Φ(p·E/S)`, with optional monodromy advance
/// `dM/dt = ((0,I),(−H,0))·M` from the interpolated Hessian.
pub struct ParticleInPotential {
    dimension: usize,
    periodic: bool,
    monodromy: bool,
    scale: [f64; MAX_WORLD_DIMENSION],
    grid_size: [f64; MAX_WORLD_DIMENSION],
    potential: Grid<f64>,
    first_derivatives: Vec<Grid<f64>>,
    second_derivatives: Vec<Grid<f64>>,
}

fn unit_orders(dimension: usize, axes: &[usize]) -> Vec<i64> {
    let mut orders = vec![0i64; dimension];
    for &axis in axes {
        orders[axis] += 1;
    }
    orders
}

impl ParticleInPotential {
    pub fn new(potential: &Potential, periodic: bool, monodromy: bool) -> Result<Self> {
        let dimension = potential.dimension();
        if dimension > MAX_WORLD_DIMENSION {
            return Err(Error::shape(format!(
                "tracing supports at most {MAX_WORLD_DIMENSION} dimensions, got {dimension}"
            )));
        }

        let mut scale = [0.0; MAX_WORLD_DIMENSION];
        let mut grid_size = [0.0; MAX_WORLD_DIMENSION];
        for i in 0..dimension {
            scale[i] = potential.extents()[i] as f64 / potential.support()[i];
            grid_size[i] = potential.extents()[i] as f64;
        }

        // interpolation always samples periodically; non-periodic runs are
        // kept away from the boundary by the domain check instead
        let field = potential
            .potential()?
            .share_with_mode(IndexMode::Periodic)?;

        let mut first_derivatives = Vec::with_capacity(dimension);
        for i in 0..dimension {
            first_derivatives.push(
                potential
                    .derivative(&unit_orders(dimension, &[i]))?
                    .share_with_mode(IndexMode::Periodic)?,
            );
        }

        let mut second_derivatives = Vec::new();
        if monodromy {
            if !potential.has_derivatives_of_order(2, crate::potential::DEFAULT_QUANTITY) {
                return Err(Error::shape(
                    "monodromy integration requires derivatives of second order",
                ));
            }
            for i in 0..dimension {
                for j in 0..dimension {
                    second_derivatives.push(
                        potential
                            .derivative(&unit_orders(dimension, &[i, j]))?
                            .share_with_mode(IndexMode::Periodic)?,
                    );
                }
            }
        }

        Ok(ParticleInPotential {
            dimension,
            periodic,
            monodromy,
            scale,
            grid_size,
            potential: field,
            first_derivatives,
            second_derivatives,
        })
    }

    /// Sampling position in grid coordinates, with the out-of-domain check
    /// for non-periodic tracing. A margin of one cell keeps interpolation
    /// away from cells that only exist through wrapping.
    #[inline]
    fn grid_position(&self, position: &[f64]) -> std::result::Result<[f64; 3], OutOfDomain> {
        let mut p = [0.0; 3];
        for i in 0..self.dimension {
            p[i] = position[i] * self.scale[i];
            if !self.periodic && (p[i] < 1.0 || p[i] > self.grid_size[i] - 2.0) {
                return Err(OutOfDomain);
            }
        }
        Ok(p)
    }

    /// Negated Hessian at the sampled position, symmetric by construction.
    #[inline]
    fn monodromy_coefficients(&self, p: &[f64]) -> [f64; 9] {
        let dim = self.dimension;
        let mut coeffs = [0.0; 9];
        for x in 0..dim {
            for y in 0..=x {
                let value = interp::interpolate(&self.second_derivatives[x * dim + y], &p[..dim]);
                coeffs[x * dim + y] = -value;
                coeffs[y * dim + x] = -value;
            }
        }
        coeffs
    }
}

/// `out = ((0,I),(coeffs,0)) · input` for row-major `2D×2D` matrices: the
/// upper row block is copied from the lower block of `input`, the lower block
/// is `coeffs` times the upper block.
#[inline]
pub fn monodromy_multiply(dimension: usize, out: &mut [f64], coeffs: &[f64; 9], input: &[f64]) {
    let row = 2 * dimension;
    let half = row * dimension;

    out[..half].copy_from_slice(&input[half..2 * half]);

    for i in 0..dimension {
        for j in 0..dimension {
            let mut left = 0.0;
            let mut right = 0.0;
            for k in 0..dimension {
                let coeff = coeffs[i * dimension + k];
                left += coeff * input[k * row + j];
                right += coeff * input[k * row + j + dimension];
            }
            out[half + i * row + j] = left;
            out[half + i * row + j + dimension] = right;
        }
    }
}

impl RayDynamics for ParticleInPotential {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn has_monodromy(&self) -> bool {
        self.monodromy
    }

    fn periodic_boundary(&self) -> bool {
        self.periodic
    }

    fn state_update(
        &self,
        x: &[f64],
        dxdt: &mut [f64],
        _t: f64,
    ) -> std::result::Result<(), OutOfDomain> {
        let dim = self.dimension;
        let p = self.grid_position(&x[..dim])?;

        // dp/dt = v
        dxdt[..dim].copy_from_slice(&x[dim..2 * dim]);

        // dv/dt = -∇Φ
        for i in 0..dim {
            dxdt[dim + i] = -interp::interpolate(&self.first_derivatives[i], &p[..dim]);
        }

        if self.monodromy {
            let coeffs = self.monodromy_coefficients(&p);
            monodromy_multiply(dim, &mut dxdt[2 * dim..], &coeffs, &x[2 * dim..]);
        }
        Ok(())
    }

    fn normalize_energy(&self, state: &mut State, total_energy: f64) -> Result<()> {
        let dim = self.dimension;
        let mut p = [0.0; 3];
        for i in 0..dim {
            p[i] = state.position()[i] * self.scale[i];
        }

        let potential_energy = interp::interpolate(&self.potential, &p[..dim]);
        let difference = total_energy - potential_energy;
        if difference < 0.0 {
            return Err(Error::domain(format!(
                "cannot normalise particle energy: potential energy {potential_energy} \
                 already exceeds total energy {total_energy}"
            )));
        }

        // ½ v² + Φ = E  =>  |v| = √(2(E - Φ))
        let target_speed = (2.0 * difference).sqrt();
        let speed = state.velocity().norm();
        *state.velocity_mut() = state.velocity().scaled(target_speed / speed);
        Ok(())
    }

    fn energy(&self, state: &State) -> f64 {
        let dim = self.dimension;
        let mut p = [0.0; 3];
        for i in 0..dim {
            p[i] = state.position()[i] * self.scale[i];
        }
        let potential_energy = interp::interpolate(&self.potential, &p[..dim]);
        let kinetic = 0.5 * state.velocity().dot(state.velocity());
        potential_energy + kinetic
    }
}
