//! Hermitian-preserving phase randomisation of the k-space field.

use std::f64::consts::TAU;

use num_complex::Complex64;
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::error::{Error, Result};
use crate::grid::Grid;
use crate::index::{MultiIndex, MAX_INDEX_DIMENSION};

/// Cells of the grid shared across the randomisation workers.
///
/// Safety contract: for every conjugate pair `(n, -n)` only the worker whose
/// partition contains the smaller storage offset writes, and it writes both
/// offsets. Every cell therefore has exactly one writer, so the unsynchronised
/// shared mutation cannot race.
struct SharedCells {
    ptr: *mut Complex64,
    len: usize,
}

unsafe impl Send for SharedCells {}
unsafe impl Sync for SharedCells {}

impl SharedCells {
    #[inline]
    unsafe fn multiply(&self, offset: usize, factor: Complex64) {
        debug_assert!(offset < self.len);
        *self.ptr.add(offset) *= factor;
    }
}

/// Builds the FFT-centred iteration index `[-E/2, E/2)^D` for a grid.
pub fn fft_indexing(extents: &[usize]) -> Result<MultiIndex> {
    let mut index = MultiIndex::new(extents.len())?;
    for (axis, &extent) in extents.iter().enumerate() {
        if extent % 2 != 0 {
            return Err(Error::shape(format!(
                "fft indexing requires even extents, axis {axis} has {extent}"
            )));
        }
        index.set_lower_bound_at(axis, -((extent / 2) as i64))?;
        index.set_upper_bound_at(axis, (extent / 2) as i64)?;
    }
    index.init()?;
    Ok(index)
}

/// Number of worker partitions for a grid of `cells` cells.
///
/// Deliberately independent of the hardware so that results reproduce across
/// machines: one partition per 128³ cells, at least one, at most 64.
pub fn partition_count(cells: usize) -> usize {
    (cells / (128 * 128 * 128)).clamp(1, 64)
}

/// Multiplies every k-space cell by a random unit phase while keeping
/// `G[n] = conj(G[-n])`; self-conjugate cells flip sign with probability ½.
///
/// Reproducibility: a seed engine derived from `seed` hands one 256-bit seed
/// to each partition in order, so the output depends only on the seed and the
/// grid shape.
pub fn randomize_phases(grid: &mut Grid<Complex64>, seed: u64) -> Result<()> {
    let extents = grid.extents().to_vec();
    let index = fft_indexing(&extents)?;
    let partitions = index.split(partition_count(grid.len()))?;

    let mut seeder = ChaCha20Rng::seed_from_u64(seed);
    let data = grid.data_mut();
    let cells = SharedCells {
        ptr: data.as_mut_ptr(),
        len: data.len(),
    };
    let cells = &cells;

    std::thread::scope(|scope| {
        for partition in partitions {
            let mut worker_seed = [0u8; 32];
            seeder.fill_bytes(&mut worker_seed);
            let rng = ChaCha20Rng::from_seed(worker_seed);

            let extents = &extents;
            scope.spawn(move || randomize_partition(cells, partition, extents, rng));
        }
    });

    Ok(())
}

#[inline]
fn fft_offset(index: &[i64], extents: &[usize]) -> usize {
    let mut offset = 0usize;
    for (&i, &e) in index.iter().zip(extents) {
        let wrapped = if i < 0 { e as i64 + i } else { i };
        offset = offset * e + wrapped as usize;
    }
    offset
}

fn randomize_partition(
    cells: &SharedCells,
    mut index: MultiIndex,
    extents: &[usize],
    mut rng: ChaCha20Rng,
) {
    let dimension = index.dimension();
    let mut inverted = [0i64; MAX_INDEX_DIMENSION];

    while index.valid() {
        for axis in 0..dimension {
            inverted[axis] = -index.get(axis);
        }

        let offset = fft_offset(index.position(), extents);
        let mirror = fft_offset(&inverted[..dimension], extents);

        if offset < mirror {
            let phase = rng.gen::<f64>() * TAU;
            let factor = Complex64::new(phase.cos(), phase.sin());
            // each pair is touched by exactly one partition, see SharedCells
            unsafe {
                cells.multiply(offset, factor);
                cells.multiply(mirror, factor.conj());
            }
        } else if offset == mirror {
            let sign = if rng.gen::<bool>() { 1.0 } else { -1.0 };
            unsafe {
                cells.multiply(offset, Complex64::new(sign, 0.0));
            }
        }

        index.increment();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::IndexMode;

    fn spectrum_grid(extents: &[usize]) -> Grid<Complex64> {
        // a real, conjugate-symmetric starting spectrum
        let mut grid = Grid::try_new(extents, IndexMode::FftCentred).unwrap();
        let flat: Vec<f64> = (0..grid.len()).map(|i| 1.0 + (i as f64 * 0.37).cos()).collect();
        let extents = grid.extents().to_vec();
        let mut index = fft_indexing(&extents).unwrap();
        let dim = index.dimension();
        let data = grid.data_mut();
        while index.valid() {
            let inverted: Vec<i64> = index.position().iter().map(|&i| -i).collect();
            let a = fft_offset(index.position(), &extents);
            let b = fft_offset(&inverted[..dim], &extents);
            let value = flat[a.min(b)];
            data[a] = Complex64::new(value, 0.0);
            index.increment();
        }
        grid
    }

    #[test]
    fn hermitian_symmetry_is_preserved() {
        for extents in [vec![16], vec![8, 6], vec![4, 4, 4]] {
            let mut grid = spectrum_grid(&extents);
            randomize_phases(&mut grid, 1234).unwrap();

            let mut index = fft_indexing(&extents).unwrap();
            let dim = index.dimension();
            while index.valid() {
                let inverted: Vec<i64> = index.position().iter().map(|&i| -i).collect();
                let a = grid.as_slice()[fft_offset(index.position(), &extents)];
                let b = grid.as_slice()[fft_offset(&inverted[..dim], &extents)];
                assert!((a - b.conj()).norm() < 1e-12, "{a} is not conj of {b}");
                index.increment();
            }
        }
    }

    #[test]
    fn magnitudes_are_untouched() {
        let mut grid = spectrum_grid(&[8, 8]);
        let before: Vec<f64> = grid.as_slice().iter().map(|v| v.norm()).collect();
        randomize_phases(&mut grid, 99).unwrap();
        for (a, b) in grid.as_slice().iter().zip(before) {
            assert!((a.norm() - b).abs() < 1e-12);
        }
    }

    #[test]
    fn same_seed_reproduces_phases() {
        let mut first = spectrum_grid(&[8, 8]);
        let mut second = spectrum_grid(&[8, 8]);
        randomize_phases(&mut first, 7).unwrap();
        randomize_phases(&mut second, 7).unwrap();
        assert_eq!(first.as_slice(), second.as_slice());

        let mut third = spectrum_grid(&[8, 8]);
        randomize_phases(&mut third, 8).unwrap();
        assert_ne!(first.as_slice(), third.as_slice());
    }

    #[test]
    fn partition_count_is_hardware_independent() {
        assert_eq!(partition_count(64 * 64 * 64), 1);
        assert_eq!(partition_count(256 * 128 * 128), 2);
        assert_eq!(partition_count(1 << 40), 64);
    }
}
