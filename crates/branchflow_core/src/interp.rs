//! Multi-linear interpolation and point splatting.
//!
//! Both entry points sit on the tracer's hot path; the per-dimension kernels
//! are written out by hand and selected once per call.

use crate::grid::{Grid, IndexMode};

#[inline]
pub fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * t
}

#[inline]
fn wrap(i: i64, extent: usize) -> usize {
    i.rem_euclid(extent as i64) as usize
}

#[inline]
fn split_fraction(x: f64) -> (i64, f64) {
    let base = x.floor();
    (base as i64, x - base)
}

/// Linear interpolation of `grid` at the real-valued position `x`.
///
/// The grid must use periodic access so that both neighbours of every axis
/// are defined regardless of `x`.
#[inline]
pub fn interpolate(grid: &Grid<f64>, x: &[f64]) -> f64 {
    debug_assert_eq!(grid.mode(), IndexMode::Periodic);
    debug_assert_eq!(grid.dimension(), x.len());
    match grid.dimension() {
        1 => interpolate_1d(grid, x),
        2 => interpolate_2d(grid, x),
        3 => interpolate_3d(grid, x),
        d => panic!("interpolation supports dimensions 1..=3, got {d}"),
    }
}

#[inline]
fn interpolate_1d(grid: &Grid<f64>, x: &[f64]) -> f64 {
    let e0 = grid.extents()[0];
    let (i0, f0) = split_fraction(x[0]);
    let data = grid.as_slice();
    lerp(data[wrap(i0, e0)], data[wrap(i0 + 1, e0)], f0)
}

#[inline]
fn interpolate_2d(grid: &Grid<f64>, x: &[f64]) -> f64 {
    let [e0, e1] = [grid.extents()[0], grid.extents()[1]];
    let (i0, f0) = split_fraction(x[0]);
    let (i1, f1) = split_fraction(x[1]);

    let r0 = wrap(i0, e0) * e1;
    let r1 = wrap(i0 + 1, e0) * e1;
    let c0 = wrap(i1, e1);
    let c1 = wrap(i1 + 1, e1);

    let data = grid.as_slice();
    lerp(
        lerp(data[r0 + c0], data[r0 + c1], f1),
        lerp(data[r1 + c0], data[r1 + c1], f1),
        f0,
    )
}

#[inline]
fn interpolate_3d(grid: &Grid<f64>, x: &[f64]) -> f64 {
    let [e0, e1, e2] = [grid.extents()[0], grid.extents()[1], grid.extents()[2]];
    let (i0, f0) = split_fraction(x[0]);
    let (i1, f1) = split_fraction(x[1]);
    let (i2, f2) = split_fraction(x[2]);

    let p0 = wrap(i0, e0) * e1;
    let p1 = wrap(i0 + 1, e0) * e1;
    let q0 = wrap(i1, e1);
    let q1 = wrap(i1 + 1, e1);
    let c0 = wrap(i2, e2);
    let c1 = wrap(i2 + 1, e2);

    let data = grid.as_slice();
    let plane = |p: usize| {
        let r0 = (p + q0) * e2;
        let r1 = (p + q1) * e2;
        lerp(
            lerp(data[r0 + c0], data[r0 + c1], f2),
            lerp(data[r1 + c0], data[r1 + c1], f2),
            f1,
        )
    };
    lerp(plane(p0), plane(p1), f0)
}

/// Additively deposits `weight` onto the `2^D` cells neighbouring `x`, with
/// multi-linear corner weights. Periodic access required, as for
/// [`interpolate`].
#[inline]
pub fn splat(grid: &mut Grid<f32>, x: &[f64], weight: f64) {
    debug_assert_eq!(grid.mode(), IndexMode::Periodic);
    debug_assert_eq!(grid.dimension(), x.len());
    match grid.dimension() {
        1 => splat_1d(grid, x, weight),
        2 => splat_2d(grid, x, weight),
        3 => splat_3d(grid, x, weight),
        d => panic!("splatting supports dimensions 1..=3, got {d}"),
    }
}

#[inline]
fn splat_1d(grid: &mut Grid<f32>, x: &[f64], weight: f64) {
    let e0 = grid.extents()[0];
    let (i0, f0) = split_fraction(x[0]);
    let (a, b) = (wrap(i0, e0), wrap(i0 + 1, e0));
    let data = grid.data_mut();
    data[a] += (weight * (1.0 - f0)) as f32;
    data[b] += (weight * f0) as f32;
}

#[inline]
fn splat_2d(grid: &mut Grid<f32>, x: &[f64], weight: f64) {
    let [e0, e1] = [grid.extents()[0], grid.extents()[1]];
    let (i0, f0) = split_fraction(x[0]);
    let (i1, f1) = split_fraction(x[1]);

    let r0 = wrap(i0, e0) * e1;
    let r1 = wrap(i0 + 1, e0) * e1;
    let c0 = wrap(i1, e1);
    let c1 = wrap(i1 + 1, e1);

    let data = grid.data_mut();
    data[r0 + c0] += (weight * (1.0 - f0) * (1.0 - f1)) as f32;
    data[r0 + c1] += (weight * (1.0 - f0) * f1) as f32;
    data[r1 + c0] += (weight * f0 * (1.0 - f1)) as f32;
    data[r1 + c1] += (weight * f0 * f1) as f32;
}

#[inline]
fn splat_3d(grid: &mut Grid<f32>, x: &[f64], weight: f64) {
    let [e0, e1, e2] = [grid.extents()[0], grid.extents()[1], grid.extents()[2]];
    let (i0, f0) = split_fraction(x[0]);
    let (i1, f1) = split_fraction(x[1]);
    let (i2, f2) = split_fraction(x[2]);

    let p = [wrap(i0, e0) * e1, wrap(i0 + 1, e0) * e1];
    let q = [wrap(i1, e1), wrap(i1 + 1, e1)];
    let c = [wrap(i2, e2), wrap(i2 + 1, e2)];
    let w0 = [1.0 - f0, f0];
    let w1 = [1.0 - f1, f1];
    let w2 = [1.0 - f2, f2];

    let data = grid.data_mut();
    for a in 0..2 {
        for b in 0..2 {
            let row = (p[a] + q[b]) * e2;
            for d in 0..2 {
                data[row + c[d]] += (weight * w0[a] * w1[b] * w2[d]) as f32;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::IndexMode;

    fn ramp_grid(extents: &[usize]) -> Grid<f64> {
        let mut grid = Grid::try_new(extents, IndexMode::Periodic).unwrap();
        for (i, cell) in grid.data_mut().iter_mut().enumerate() {
            *cell = (i as f64).sin() * 3.0 + i as f64;
        }
        grid
    }

    #[test]
    fn exact_at_grid_nodes() {
        let grid = ramp_grid(&[5, 7]);
        for i in 0..5i64 {
            for j in 0..7i64 {
                let expected = grid.at(&[i, j]);
                let got = interpolate(&grid, &[i as f64, j as f64]);
                assert!((got - expected).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn midpoints_average_the_neighbours() {
        let grid = ramp_grid(&[6, 4]);
        let exact = 0.5 * (grid.at(&[2, 1]) + grid.at(&[3, 1]));
        assert!((interpolate(&grid, &[2.5, 1.0]) - exact).abs() < 1e-12);

        let exact = 0.5 * (grid.at(&[2, 1]) + grid.at(&[2, 2]));
        assert!((interpolate(&grid, &[2.0, 1.5]) - exact).abs() < 1e-12);
    }

    #[test]
    fn wraps_across_the_boundary() {
        let grid = ramp_grid(&[4]);
        let expected = 0.75 * grid.at(&[3]) + 0.25 * grid.at(&[0]);
        assert!((interpolate(&grid, &[3.25]) - expected).abs() < 1e-12);

        // negative positions wrap as well
        let expected = 0.5 * (grid.at(&[3]) + grid.at(&[0]));
        assert!((interpolate(&grid, &[-0.5]) - expected).abs() < 1e-12);
    }

    #[test]
    fn trilinear_blends_all_eight_corners() {
        let grid = ramp_grid(&[3, 3, 3]);
        let x = [0.5, 0.5, 0.5];
        let mut expected = 0.0;
        for a in 0..2i64 {
            for b in 0..2i64 {
                for c in 0..2i64 {
                    expected += 0.125 * grid.at(&[a, b, c]);
                }
            }
        }
        assert!((interpolate(&grid, &x) - expected).abs() < 1e-12);
    }

    #[test]
    fn splat_conserves_total_weight() {
        for x in [[1.3, 2.7], [0.0, 0.0], [3.9, 0.1]] {
            let mut grid = Grid::<f32>::try_new(&[4, 4], IndexMode::Periodic).unwrap();
            splat(&mut grid, &x, 2.5);
            let total: f32 = grid.as_slice().iter().sum();
            assert!((total - 2.5).abs() < 1e-6);
        }
    }

    #[test]
    fn splat_at_node_hits_single_cell() {
        let mut grid = Grid::<f32>::try_new(&[4, 4], IndexMode::Periodic).unwrap();
        splat(&mut grid, &[2.0, 3.0], 1.0);
        assert_eq!(grid.at(&[2, 3]), 1.0);
        let total: f32 = grid.as_slice().iter().sum();
        assert_eq!(total, 1.0);
    }
}
