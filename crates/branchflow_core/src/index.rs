//! Bounded multidimensional counting index.

use crate::error::{Error, Result};

/// Maximum dimension of a [`MultiIndex`].
///
/// All index state lives in fixed-size arrays so that iteration needs no heap
/// traffic; three dimensions are needed, the fourth is slack.
pub const MAX_INDEX_DIMENSION: usize = 4;

/// An integer index iterating a box `[lᵢ, uᵢ)` in row-major order: the last
/// axis varies fastest, a carry on the first axis invalidates the index.
///
/// Usage is staged: construct with a dimension, set the bounds, call
/// [`MultiIndex::init`], then iterate with [`MultiIndex::increment`] while
/// [`MultiIndex::valid`] holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiIndex {
    lower: [i64; MAX_INDEX_DIMENSION],
    upper: [i64; MAX_INDEX_DIMENSION],
    pos: [i64; MAX_INDEX_DIMENSION],
    dimension: usize,
    is_valid: bool,
}

impl MultiIndex {
    /// Creates an index with all bounds at zero. Not valid until `init`.
    pub fn new(dimension: usize) -> Result<Self> {
        if dimension == 0 || dimension > MAX_INDEX_DIMENSION {
            return Err(Error::shape(format!(
                "multi index dimension {dimension} outside supported range 1..={MAX_INDEX_DIMENSION}"
            )));
        }
        Ok(MultiIndex {
            lower: [0; MAX_INDEX_DIMENSION],
            upper: [0; MAX_INDEX_DIMENSION],
            pos: [0; MAX_INDEX_DIMENSION],
            dimension,
            is_valid: false,
        })
    }

    /// Creates an index over `[lower, upper)` on every axis, already initialised.
    pub fn with_bounds(dimension: usize, lower: i64, upper: i64) -> Result<Self> {
        let mut index = MultiIndex::new(dimension)?;
        index.set_lower_bound(lower)?;
        index.set_upper_bound(upper)?;
        index.init()?;
        Ok(index)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn valid(&self) -> bool {
        self.is_valid
    }

    fn check_not_in_use(&self) -> Result<()> {
        if self.is_valid {
            return Err(Error::programming(
                "changing multi index bounds while the index is in use",
            ));
        }
        Ok(())
    }

    pub fn set_lower_bound(&mut self, lower: i64) -> Result<()> {
        self.check_not_in_use()?;
        self.lower[..self.dimension].fill(lower);
        Ok(())
    }

    pub fn set_upper_bound(&mut self, upper: i64) -> Result<()> {
        self.check_not_in_use()?;
        self.upper[..self.dimension].fill(upper);
        Ok(())
    }

    pub fn set_lower_bound_at(&mut self, axis: usize, lower: i64) -> Result<()> {
        self.check_not_in_use()?;
        self.lower[axis] = lower;
        Ok(())
    }

    pub fn set_upper_bound_at(&mut self, axis: usize, upper: i64) -> Result<()> {
        self.check_not_in_use()?;
        self.upper[axis] = upper;
        Ok(())
    }

    /// Changes an upper bound while the index is running. Only meaningful on
    /// trailing axes; the new bound must stay ahead of the current position.
    pub fn set_upper_bound_dynamic(&mut self, axis: usize, upper: i64) -> Result<()> {
        if self.lower[axis] >= upper {
            return Err(Error::programming(format!(
                "dynamic upper bound {upper} for axis {axis} does not exceed lower bound {}",
                self.lower[axis]
            )));
        }
        if upper <= self.pos[axis] {
            return Err(Error::programming(format!(
                "dynamic upper bound {upper} for axis {axis} is behind current position {}",
                self.pos[axis]
            )));
        }
        self.upper[axis] = upper;
        Ok(())
    }

    pub fn lower_bound(&self, axis: usize) -> i64 {
        self.lower[axis]
    }

    pub fn upper_bound(&self, axis: usize) -> i64 {
        self.upper[axis]
    }

    /// Moves the position to the lower bounds and marks the index valid.
    pub fn init(&mut self) -> Result<()> {
        self.check_not_in_use()?;
        for axis in 0..self.dimension {
            if self.lower[axis] >= self.upper[axis] {
                return Err(Error::programming(format!(
                    "multi index lower bound {} for axis {axis} does not precede upper bound {}",
                    self.lower[axis], self.upper[axis]
                )));
            }
        }
        self.pos = self.lower;
        self.is_valid = true;
        Ok(())
    }

    #[inline]
    pub fn get(&self, axis: usize) -> i64 {
        debug_assert!(self.is_valid);
        self.pos[axis]
    }

    #[inline]
    pub fn position(&self) -> &[i64] {
        debug_assert!(self.is_valid);
        &self.pos[..self.dimension]
    }

    /// Advances by one in row-major order. Returns the most significant axis
    /// that was incremented; a carry past the first axis invalidates the index.
    #[inline]
    pub fn increment(&mut self) -> usize {
        debug_assert!(self.is_valid);
        for axis in (0..self.dimension).rev() {
            self.pos[axis] += 1;
            if self.pos[axis] < self.upper[axis] {
                return axis;
            }
            self.pos[axis] = self.lower[axis];
        }
        self.is_valid = false;
        0
    }

    /// Sum of the current components.
    pub fn accumulated(&self) -> i64 {
        self.position().iter().sum()
    }

    pub fn as_vec(&self) -> Vec<i64> {
        self.position().to_vec()
    }

    /// Partitions this index range along the outermost axis into at most
    /// `parts` sub-indices that together cover the original box. Used for
    /// distributing grid sweeps across threads.
    pub fn split(&self, parts: usize) -> Result<Vec<MultiIndex>> {
        if parts == 0 {
            return Err(Error::domain("cannot split a multi index into zero parts"));
        }

        let range = self.upper[0] - self.lower[0];
        let mut result = Vec::with_capacity(parts);
        let mut last_boundary = self.lower[0];
        for part in 0..parts {
            let next = (part as i64 + 1) * range / parts as i64 + self.lower[0];
            if next == last_boundary {
                continue;
            }
            let mut sub = self.clone();
            sub.is_valid = false;
            sub.lower[0] = last_boundary;
            sub.upper[0] = next;
            sub.init()?;
            result.push(sub);
            last_boundary = next;
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iterates_row_major() {
        let mut index = MultiIndex::new(2).unwrap();
        index.set_lower_bound(0).unwrap();
        index.set_upper_bound_at(0, 2).unwrap();
        index.set_upper_bound_at(1, 3).unwrap();
        index.init().unwrap();

        let mut seen = Vec::new();
        while index.valid() {
            seen.push((index.get(0), index.get(1)));
            index.increment();
        }
        assert_eq!(seen, vec![(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (1, 2)]);
    }

    #[test]
    fn negative_bounds_cover_fft_range() {
        let mut index = MultiIndex::with_bounds(1, -2, 2).unwrap();
        let mut seen = Vec::new();
        while index.valid() {
            seen.push(index.get(0));
            index.increment();
        }
        assert_eq!(seen, vec![-2, -1, 0, 1]);
    }

    #[test]
    fn bounds_are_locked_while_valid() {
        let mut index = MultiIndex::with_bounds(2, 0, 4).unwrap();
        assert!(index.set_upper_bound(5).is_err());
    }

    #[test]
    fn init_rejects_empty_ranges() {
        let mut index = MultiIndex::new(1).unwrap();
        index.set_lower_bound(3).unwrap();
        index.set_upper_bound(3).unwrap();
        assert!(index.init().is_err());
    }

    #[test]
    fn split_partitions_outer_axis_exactly() {
        let index = MultiIndex::with_bounds(2, 0, 10).unwrap();
        let parts = index.split(3).unwrap();
        assert_eq!(parts.len(), 3);

        let mut cells = Vec::new();
        for mut part in parts {
            assert_eq!(part.lower_bound(1), 0);
            assert_eq!(part.upper_bound(1), 10);
            while part.valid() {
                cells.push((part.get(0), part.get(1)));
                part.increment();
            }
        }
        cells.sort_unstable();
        cells.dedup();
        assert_eq!(cells.len(), 100);
    }

    #[test]
    fn split_drops_empty_parts() {
        let index = MultiIndex::with_bounds(1, 0, 2).unwrap();
        let parts = index.split(8).unwrap();
        assert_eq!(parts.len(), 2);
    }

    #[test]
    fn dynamic_upper_bound_extends_row() {
        let mut index = MultiIndex::new(2).unwrap();
        index.set_lower_bound(0).unwrap();
        index.set_upper_bound_at(0, 2).unwrap();
        index.set_upper_bound_at(1, 1).unwrap();
        index.init().unwrap();

        index.set_upper_bound_dynamic(1, 3).unwrap();
        let mut count = 0;
        while index.valid() && index.get(0) == 0 {
            count += 1;
            index.increment();
        }
        assert_eq!(count, 3);
    }
}
