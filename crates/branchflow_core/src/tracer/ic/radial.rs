//! Radial (point-source) starting manifolds.

use std::f64::consts::{PI, TAU};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::error::{Error, Result};
use crate::index::{MultiIndex, MAX_INDEX_DIMENSION};
use crate::tracer::ic::Manifold;
use crate::tracer::state::Vect;

/// All rays start from one origin, evenly distributed over the circle.
pub struct Radial2D {
    world_dimension: usize,
    origin: Vect,
}

impl Radial2D {
    pub fn new(world_dimension: usize) -> Result<Self> {
        if world_dimension < 2 {
            return Err(Error::shape(format!(
                "radial initial conditions require at least two dimensions, got {world_dimension}"
            )));
        }
        let mut origin = Vect::zeros(world_dimension);
        for i in 0..world_dimension {
            origin[i] = 0.5;
        }
        Ok(Radial2D {
            world_dimension,
            origin,
        })
    }

    pub fn set_origin(&mut self, origin: Vect) -> Result<()> {
        if origin.len() != self.world_dimension {
            return Err(Error::shape(format!(
                "{}-dimensional origin for {}-dimensional world",
                origin.len(),
                self.world_dimension
            )));
        }
        self.origin = origin;
        Ok(())
    }
}

impl Manifold for Radial2D {
    fn name(&self) -> &'static str {
        "radial"
    }

    fn world_dimension(&self) -> usize {
        self.world_dimension
    }

    fn manifold_dimension(&self) -> usize {
        1
    }

    fn generate(&self, pos: &[f64], position: &mut Vect, velocity: &mut Vect) {
        let angle = pos[0] * TAU;
        *position = self.origin;
        let mut v = Vect::zeros(self.world_dimension);
        v[0] = angle.cos();
        v[1] = angle.sin();
        *velocity = v;
    }
}

/// Point source in three dimensions with approximately equal-area sampling
/// of the sphere: polar rows of width `√(4π/N)`, each row carrying a number
/// of azimuth cells proportional to its circumference.
pub struct Radial3D {
    origin: Vect,
    step: f64,
}

impl Radial3D {
    pub fn new(world_dimension: usize) -> Result<Self> {
        if world_dimension != 3 {
            return Err(Error::shape(format!(
                "radial 3d initial conditions require three dimensions, got {world_dimension}"
            )));
        }
        Ok(Radial3D {
            origin: Vect::from_slice(&[0.5, 0.5, 0.5]),
            step: 0.0,
        })
    }

    pub fn set_origin(&mut self, origin: Vect) -> Result<()> {
        if origin.len() != 3 {
            return Err(Error::shape(format!(
                "{}-dimensional origin for a three-dimensional world",
                origin.len()
            )));
        }
        self.origin = origin;
        Ok(())
    }
}

impl Manifold for Radial3D {
    fn name(&self) -> &'static str {
        "radial_3d"
    }

    fn world_dimension(&self) -> usize {
        3
    }

    fn manifold_dimension(&self) -> usize {
        2
    }

    fn init_index(&mut self, particle_count: u64, index: &mut MultiIndex) -> Result<()> {
        // area per particle on the unit sphere is 4π/N; for a roughly square
        // cell that gives the polar step, the azimuth bound follows per row
        self.step = (4.0 * PI / particle_count as f64).sqrt();
        let rows = (PI / self.step).ceil() as i64;
        index.set_upper_bound_at(0, rows.max(1))?;
        index.set_upper_bound_at(1, 1)?;
        Ok(())
    }

    fn next_trajectory(&mut self, pos: &[f64], index: &mut MultiIndex) -> Result<()> {
        // at the start of each polar row, scale the azimuth cell count with
        // the circumference of that row
        if index.get(1) == 0 {
            let theta = (2.0 * pos[0] - 1.0) * PI / 2.0;
            let circumference = theta.cos() * TAU;
            let cells = (circumference / self.step).ceil() as i64;
            index.set_upper_bound_dynamic(1, cells.max(1))?;
        }
        Ok(())
    }

    fn generate(&self, pos: &[f64], position: &mut Vect, velocity: &mut Vect) {
        let theta = (2.0 * pos[0] - 1.0) * PI / 2.0;
        let phi = pos[1] * TAU;

        *position = self.origin;
        *velocity = Vect::from_slice(&[
            theta.cos() * phi.sin(),
            theta.cos() * phi.cos(),
            theta.sin(),
        ]);
    }
}

/// Every trajectory starts from a random position in a random direction; the
/// deltas behave as if the ray belonged to a coherent spherical wave from
/// that point, so caustic detection keeps working.
pub struct RandomRadial {
    world_dimension: usize,
    rng: ChaCha20Rng,
    position: Vect,
    angles: [f64; 2],
    fixed_angles: [f64; 2],
    manifold_start: [f64; MAX_INDEX_DIMENSION],
}

impl RandomRadial {
    pub fn new(world_dimension: usize, seed: u64) -> Result<Self> {
        if world_dimension < 2 {
            return Err(Error::shape(
                "random radial initial conditions require at least two dimensions",
            ));
        }
        Ok(RandomRadial {
            world_dimension,
            rng: ChaCha20Rng::seed_from_u64(seed),
            position: Vect::zeros(world_dimension),
            angles: [0.0; 2],
            // negative means "not fixed"
            fixed_angles: [-1.0; 2],
            manifold_start: [0.0; MAX_INDEX_DIMENSION],
        })
    }

    pub fn set_fixed_angle(&mut self, axis: usize, angle: f64) {
        self.fixed_angles[axis] = angle;
    }
}

impl Manifold for RandomRadial {
    fn name(&self) -> &'static str {
        "random_radial"
    }

    fn world_dimension(&self) -> usize {
        self.world_dimension
    }

    fn manifold_dimension(&self) -> usize {
        self.world_dimension - 1
    }

    fn next_trajectory(&mut self, pos: &[f64], _index: &mut MultiIndex) -> Result<()> {
        self.manifold_start[..pos.len()].copy_from_slice(pos);

        for i in 0..self.world_dimension {
            self.position[i] = self.rng.gen::<f64>();
        }

        if self.world_dimension == 2 {
            self.angles[0] = self.rng.gen::<f64>() * TAU;
        } else {
            // uniform sphere point picking in angle form
            let u = self.rng.gen::<f64>();
            let v = self.rng.gen::<f64>();
            self.angles[0] = u * TAU;
            self.angles[1] = (2.0 * v - 1.0).acos();
        }

        for i in 0..self.world_dimension - 1 {
            if self.fixed_angles[i] >= 0.0 {
                self.angles[i] = self.fixed_angles[i];
            }
        }
        Ok(())
    }

    fn generate(&self, pos: &[f64], position: &mut Vect, velocity: &mut Vect) {
        *position = self.position;

        let mut v = Vect::zeros(self.world_dimension);
        if self.world_dimension == 3 {
            let phi = self.angles[0] + (pos[1] - self.manifold_start[1]) * TAU;
            let theta = self.angles[1] + (pos[0] - self.manifold_start[0]) * PI;
            v[0] = phi.cos() * theta.sin();
            v[1] = phi.sin() * theta.sin();
            v[2] = theta.cos();
        } else {
            let phi = self.angles[0] + (pos[0] - self.manifold_start[0]) * TAU;
            v[0] = phi.cos();
            v[1] = phi.sin();
        }
        *velocity = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn radial_2d_velocities_are_unit_and_even() {
        let radial = Radial2D::new(2).unwrap();
        let mut p = Vect::zeros(2);
        let mut v = Vect::zeros(2);

        radial.generate(&[0.0], &mut p, &mut v);
        assert_eq!(p.as_slice(), &[0.5, 0.5]);
        assert!((v[0] - 1.0).abs() < 1e-12 && v[1].abs() < 1e-12);

        radial.generate(&[0.25], &mut p, &mut v);
        assert!(v[0].abs() < 1e-12 && (v[1] - 1.0).abs() < 1e-12);

        for k in 0..16 {
            radial.generate(&[k as f64 / 16.0], &mut p, &mut v);
            assert!((v.norm() - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn radial_2d_angles_are_uniform() {
        // Kolmogorov-Smirnov distance of the generated angle distribution
        // against the uniform distribution on [0, 2π)
        use crate::tracer::ic::{InitialConditionConfig, InitialConditionGenerator};

        let n = 2000u64;
        let generator =
            InitialConditionGenerator::new(Box::new(Radial2D::new(2).unwrap())).unwrap();
        generator
            .init(InitialConditionConfig {
                particle_count: n,
                support: vec![1.0, 1.0],
                offset: vec![0.0, 0.0],
                relative_coordinates: false,
                normalize_energy: false,
                dynamics: None,
            })
            .unwrap();

        let mut angles = Vec::new();
        while let Some(ic) = generator.next().unwrap() {
            let v = ic.state.velocity();
            let mut angle = v[1].atan2(v[0]);
            if angle < 0.0 {
                angle += TAU;
            }
            angles.push(angle / TAU);
        }
        angles.sort_by(|a, b| a.partial_cmp(b).unwrap());

        let count = angles.len() as f64;
        let mut statistic = 0.0f64;
        for (i, &value) in angles.iter().enumerate() {
            statistic = statistic
                .max((value - i as f64 / count).abs())
                .max(((i + 1) as f64 / count - value).abs());
        }
        assert!(statistic <= 1.628 / count.sqrt(), "ks statistic {statistic}");
    }

    #[test]
    fn radial_3d_rows_scale_with_circumference() {
        let mut radial = Radial3D::new(3).unwrap();
        let mut index = MultiIndex::new(2).unwrap();
        index.set_lower_bound(0).unwrap();
        radial.init_index(1000, &mut index).unwrap();
        index.init().unwrap();

        // near the pole the row holds a single cell, near the equator many
        radial.next_trajectory(&[0.01, 0.5], &mut index).unwrap();
        let polar_cells = index.upper_bound(1);
        let mut equator = MultiIndex::new(2).unwrap();
        equator.set_lower_bound(0).unwrap();
        radial.init_index(1000, &mut equator).unwrap();
        equator.init().unwrap();
        radial.next_trajectory(&[0.5, 0.5], &mut equator).unwrap();
        let equator_cells = equator.upper_bound(1);

        assert!(equator_cells > 4 * polar_cells);
    }

    #[test]
    fn radial_3d_velocity_is_unit() {
        let radial = Radial3D::new(3).unwrap();
        let mut p = Vect::zeros(3);
        let mut v = Vect::zeros(3);
        for &u0 in &[0.1, 0.5, 0.9] {
            for &u1 in &[0.0, 0.3, 0.7] {
                radial.generate(&[u0, u1], &mut p, &mut v);
                assert!((v.norm() - 1.0).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn random_radial_keeps_origin_fixed_per_trajectory() {
        let mut manifold = RandomRadial::new(2, 5).unwrap();
        let mut index = MultiIndex::with_bounds(1, 0, 4).unwrap();
        manifold.next_trajectory(&[0.5], &mut index).unwrap();

        let mut p1 = Vect::zeros(2);
        let mut v1 = Vect::zeros(2);
        manifold.generate(&[0.5], &mut p1, &mut v1);

        let mut p2 = Vect::zeros(2);
        let mut v2 = Vect::zeros(2);
        manifold.generate(&[0.5 + 1e-5], &mut p2, &mut v2);

        // position fixed, direction rotating with the manifold coordinate
        assert_eq!(p1.as_slice(), p2.as_slice());
        assert!((v1.norm() - 1.0).abs() < 1e-12);
        assert!(v1.sub(&v2).norm() > 1e-6);
        assert!(v1.sub(&v2).norm() < 1e-3);
    }
}
