//! Spatial derivatives of the field, computed by k-space multiplication.

use std::f64::consts::PI;

use log::warn;
use num_complex::Complex64;
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::fft::FftContext;
use crate::grid::{Grid, IndexMode};
use crate::index::MultiIndex;
use crate::potential::Potential;

use super::randomize::fft_indexing;

#[inline]
fn pow_small(base: f64, exponent: i64) -> f64 {
    match exponent {
        0 => 1.0,
        1 => base,
        2 => base * base,
        3 => base * base * base,
        _ => base.powi(exponent as i32),
    }
}

/// Computes `∂^α f` in position space from the spectrum `f_k`.
///
/// Cell `n` of the spectrum is multiplied by `(iπ)^{|α|} · ∏ (2nⱼ)^{αⱼ}`,
/// which is the derivative multiplier for a field living on the unit box
/// `[-½, ½]^D`; the caller converts to physical support afterwards through
/// [`Potential::set_support`].
pub fn derivative_grid(
    orders: &[i64],
    f_k: &Grid<Complex64>,
    fft: &FftContext,
) -> Result<Grid<f64>> {
    if orders.len() != f_k.dimension() {
        return Err(Error::shape(format!(
            "derivative index has {} components for {}-dimensional data",
            orders.len(),
            f_k.dimension()
        )));
    }
    if f_k.mode() != IndexMode::FftCentred {
        return Err(Error::programming(
            "derivative computation expects the spectrum in fft-centred mode",
        ));
    }
    if orders.iter().any(|&o| o < 0) {
        return Err(Error::domain(format!(
            "negative derivative order supplied in {orders:?}"
        )));
    }

    let mut spectrum = f_k.try_clone()?;
    let total: i64 = orders.iter().sum();
    let i_factor = Complex64::new(0.0, PI).powu(total as u32);

    let extents = spectrum.extents().to_vec();
    let mut index = fft_indexing(&extents)?;
    let dimension = index.dimension();
    let data = spectrum.data_mut();
    while index.valid() {
        // f'(k) = i k f(k), one factor of 2k per derivative order
        let mut r_factor = 1.0;
        for axis in 0..dimension {
            if orders[axis] != 0 {
                r_factor *= pow_small(2.0 * index.get(axis) as f64, orders[axis]);
            }
        }
        let offset = fft_offset(&index, &extents);
        data[offset] *= r_factor * i_factor;
        index.increment();
    }

    fft.ifft(&mut spectrum)?;

    let mut result = Grid::try_new(&extents, IndexMode::Identity)?;
    for (out, value) in result.data_mut().iter_mut().zip(spectrum.as_slice()) {
        *out = value.re;
    }
    Ok(result)
}

#[inline]
fn fft_offset(index: &MultiIndex, extents: &[usize]) -> usize {
    let mut offset = 0usize;
    for (axis, &e) in extents.iter().enumerate() {
        let i = index.get(axis);
        let wrapped = if i < 0 { e as i64 + i } else { i };
        offset = offset * e + wrapped as usize;
    }
    offset
}

/// Enumerates all derivative multi-indices with `0 < |α| ≤ max_order`.
pub fn derivative_orders(dimension: usize, max_order: i64) -> Result<Vec<Vec<i64>>> {
    let mut orders = Vec::new();
    let mut index = MultiIndex::with_bounds(dimension, 0, max_order + 1)?;
    while index.valid() {
        let total = index.accumulated();
        if total > 0 && total <= max_order {
            orders.push(index.as_vec());
        }
        index.increment();
    }
    Ok(orders)
}

/// Computes every requested derivative and stores it into the potential,
/// scaled by `√(cell count)` so the generator's final renormalisation leaves
/// the derivatives consistent with the field.
///
/// Derivatives are computed in parallel; each task clones the spectrum, so
/// when memory runs out the whole stage is retried sequentially.
pub fn compute_all_derivatives(
    potential: &mut Potential,
    f_k: &Grid<Complex64>,
    max_order: i64,
    fft: &FftContext,
) -> Result<()> {
    let orders = derivative_orders(potential.dimension(), max_order)?;
    let post_scale = (f_k.len() as f64).sqrt();

    let compute = |order: &Vec<i64>| -> Result<Grid<f64>> {
        let mut grid = derivative_grid(order, f_k, fft)?;
        for cell in grid.data_mut() {
            *cell *= post_scale;
        }
        Ok(grid)
    };

    let mut results: Vec<Result<Grid<f64>>> = orders.par_iter().map(compute).collect();

    if results.iter().any(|r| matches!(r, Err(e) if e.is_out_of_memory())) {
        warn!(
            "out of memory during parallel derivative computation, \
             retrying sequentially to reduce the footprint"
        );
        results = orders.iter().map(compute).collect();
    }

    for (order, result) in orders.into_iter().zip(results) {
        potential.set_derivative(order, result?)?;
    }
    Ok(())
}
