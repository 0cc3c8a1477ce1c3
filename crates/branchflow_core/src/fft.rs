//! Multi-dimensional complex FFT on grids.

use std::sync::{Arc, Mutex};

use num_complex::Complex64;
use rayon::prelude::*;
use rustfft::{Fft, FftPlanner};

use crate::error::{Error, Result};
use crate::grid::Grid;

/// Process-wide FFT state: the plan cache and the worker pool.
///
/// Plan creation is serialised behind the planner mutex; executing a plan is
/// safe from many threads as long as the buffers are disjoint, which the
/// slab-wise partitioning below guarantees.
pub struct FftContext {
    planner: Mutex<FftPlanner<f64>>,
    pool: rayon::ThreadPool,
}

impl FftContext {
    /// Creates a context running on `threads` workers; zero selects the
    /// hardware thread count.
    pub fn new(threads: usize) -> Result<Self> {
        let threads = if threads == 0 {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            threads
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|e| Error::programming(format!("could not build fft thread pool: {e}")))?;
        Ok(FftContext {
            planner: Mutex::new(FftPlanner::new()),
            pool,
        })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// In-place forward DFT over all axes. No normalisation.
    pub fn fft(&self, grid: &mut Grid<Complex64>) -> Result<()> {
        self.transform(grid, false)
    }

    /// In-place inverse DFT over all axes, scaled by `1/∏Eⱼ` so that
    /// `ifft(fft(x)) = x` up to rounding.
    pub fn ifft(&self, grid: &mut Grid<Complex64>) -> Result<()> {
        self.transform(grid, true)?;
        let scale = 1.0 / grid.len() as f64;
        let data = grid.data_mut();
        self.pool.install(|| {
            data.par_iter_mut().for_each(|v| *v *= scale);
        });
        Ok(())
    }

    fn plan(&self, len: usize, inverse: bool) -> Arc<dyn Fft<f64>> {
        let mut planner = self.planner.lock().expect("fft planner mutex poisoned");
        if inverse {
            planner.plan_fft_inverse(len)
        } else {
            planner.plan_fft_forward(len)
        }
    }

    /// Applies the 1D transform along every axis in turn. The data is cut
    /// into disjoint slabs of `extent · inner` cells, one slab per parallel
    /// task; lines with a stride are gathered into a scratch line first.
    fn transform(&self, grid: &mut Grid<Complex64>, inverse: bool) -> Result<()> {
        let extents = grid.extents().to_vec();
        let data = grid.data_mut();

        for axis in 0..extents.len() {
            let n = extents[axis];
            if n < 2 {
                continue;
            }
            let inner: usize = extents[axis + 1..].iter().product();
            let plan = self.plan(n, inverse);
            let scratch_len = plan.get_inplace_scratch_len();

            self.pool.install(|| {
                data.par_chunks_mut(n * inner).for_each_init(
                    || (vec![Complex64::default(); n], vec![Complex64::default(); scratch_len]),
                    |(line, scratch), slab| {
                        if inner == 1 {
                            plan.process_with_scratch(slab, scratch);
                            return;
                        }
                        for offset in 0..inner {
                            for k in 0..n {
                                line[k] = slab[k * inner + offset];
                            }
                            plan.process_with_scratch(line, scratch);
                            for k in 0..n {
                                slab[k * inner + offset] = line[k];
                            }
                        }
                    },
                );
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::IndexMode;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha20Rng;

    fn random_grid(extents: &[usize], seed: u64) -> Grid<Complex64> {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let mut grid = Grid::try_new(extents, IndexMode::Identity).unwrap();
        for cell in grid.data_mut() {
            *cell = Complex64::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0));
        }
        grid
    }

    fn max_norm(grid: &Grid<Complex64>) -> f64 {
        grid.as_slice().iter().map(|v| v.norm()).fold(0.0, f64::max)
    }

    #[test]
    fn constant_signal_transforms_to_dc_bin() {
        let ctx = FftContext::new(1).unwrap();
        let mut grid = Grid::try_new(&[8], IndexMode::Identity).unwrap();
        for cell in grid.data_mut() {
            *cell = Complex64::new(2.0, 0.0);
        }

        ctx.fft(&mut grid).unwrap();
        assert!((grid.as_slice()[0] - Complex64::new(16.0, 0.0)).norm() < 1e-12);
        for &bin in &grid.as_slice()[1..] {
            assert!(bin.norm() < 1e-12);
        }
    }

    #[test]
    fn inverse_undoes_forward_within_tolerance() {
        let ctx = FftContext::new(2).unwrap();
        for extents in [vec![16], vec![4, 6], vec![2, 4, 6]] {
            let original = random_grid(&extents, 7);
            let mut grid = original.clone();

            ctx.fft(&mut grid).unwrap();
            ctx.ifft(&mut grid).unwrap();

            let bound = 1000.0 * f64::EPSILON * max_norm(&original);
            for (a, b) in grid.as_slice().iter().zip(original.as_slice()) {
                assert!((a - b).norm() <= bound, "{a} differs from {b}");
            }
        }
    }

    #[test]
    fn real_even_input_has_real_spectrum() {
        // A symmetric real signal must transform to a real spectrum; this is
        // the property the potential generator relies on.
        let ctx = FftContext::new(1).unwrap();
        let n = 16usize;
        let mut grid = Grid::try_new(&[n], IndexMode::Identity).unwrap();
        for (i, cell) in grid.data_mut().iter_mut().enumerate() {
            // symmetric under i -> (n - i) % n
            let x = i.min(n - i) as f64 / n as f64;
            *cell = Complex64::new((-x * x * 20.0).exp(), 0.0);
        }

        ctx.fft(&mut grid).unwrap();
        for bin in grid.as_slice() {
            assert!(bin.im.abs() < 1e-12);
        }
    }
}
