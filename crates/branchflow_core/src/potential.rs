//! The potential container: generated field data plus all its derivatives.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};

use crate::error::{Error, Result};
use crate::grid::Grid;
use crate::io;

/// Quantity name under which the scalar field itself is stored. Alternative
/// dynamics use their own reserved names (`velocity0`, `velocity1`, ...).
pub const DEFAULT_QUANTITY: &str = "potential";

const FILE_MAGIC: &[u8] = b"bpot5";

/// Map key: quantity name plus the per-axis derivative orders.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct DerivativeKey {
    name: String,
    orders: Vec<i64>,
}

/// A stationary random field with its spatial derivatives and the metadata
/// needed to reproduce or rescale it.
///
/// Every stored grid has the dimension and extents of the potential; the
/// sorted map keeps file output deterministic, which the reproducibility
/// guarantee of the generator depends on.
#[derive(Debug)]
pub struct Potential {
    dimension: usize,
    extents: Vec<usize>,
    support: Vec<f64>,
    seed: u64,
    version: u64,
    correlation_length: f64,
    strength: f64,
    grids: BTreeMap<DerivativeKey, Grid<f64>>,
}

fn scale_grid(grid: &mut Grid<f64>, factor: f64) {
    for cell in grid.data_mut() {
        *cell *= factor;
    }
}

impl Potential {
    pub fn new(extents: Vec<usize>, support: Vec<f64>) -> Result<Self> {
        if extents.len() != support.len() {
            return Err(Error::shape(format!(
                "{}-dimensional extents with {}-dimensional support",
                extents.len(),
                support.len()
            )));
        }
        Ok(Potential {
            dimension: extents.len(),
            extents,
            support,
            seed: 0,
            version: 3,
            correlation_length: -1.0,
            strength: 1.0,
            grids: BTreeMap::new(),
        })
    }

    pub fn set_creation_info(&mut self, seed: u64, version: u64, correlation_length: f64) {
        self.seed = seed;
        self.version = version;
        self.correlation_length = correlation_length;
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn extents(&self) -> &[usize] {
        &self.extents
    }

    pub fn support(&self) -> &[f64] {
        &self.support
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn correlation_length(&self) -> f64 {
        self.correlation_length
    }

    pub fn strength(&self) -> f64 {
        self.strength
    }

    pub fn grid_count(&self) -> usize {
        self.grids.len()
    }

    fn check_orders(&self, orders: &[i64]) -> Result<()> {
        if orders.len() != self.dimension {
            return Err(Error::shape(format!(
                "derivative index has {} components, but the potential dimension is {}",
                orders.len(),
                self.dimension
            )));
        }
        if orders.iter().any(|&o| o < 0) {
            return Err(Error::domain(format!(
                "negative derivative order in {orders:?}"
            )));
        }
        Ok(())
    }

    /// The field itself, i.e. the zeroth derivative of the default quantity.
    pub fn potential(&self) -> Result<&Grid<f64>> {
        self.derivative(&vec![0; self.dimension])
    }

    pub fn derivative(&self, orders: &[i64]) -> Result<&Grid<f64>> {
        self.derivative_named(DEFAULT_QUANTITY, orders)
    }

    pub fn derivative_named(&self, name: &str, orders: &[i64]) -> Result<&Grid<f64>> {
        self.check_orders(orders)?;
        let key = DerivativeKey {
            name: name.to_owned(),
            orders: orders.to_vec(),
        };
        self.grids.get(&key).ok_or_else(|| {
            Error::shape(format!(
                "potential holds no derivative {orders:?} of quantity {name:?}"
            ))
        })
    }

    pub fn has_derivative(&self, name: &str, orders: &[i64]) -> bool {
        self.derivative_named(name, orders).is_ok()
    }

    /// True when every derivative multi-index of exactly the given total
    /// order is present.
    pub fn has_derivatives_of_order(&self, order: i64, name: &str) -> bool {
        let mut index =
            match crate::index::MultiIndex::with_bounds(self.dimension, 0, order + 1) {
                Ok(index) => index,
                Err(_) => return false,
            };
        while index.valid() {
            if index.accumulated() == order && !self.has_derivative(name, index.position()) {
                return false;
            }
            index.increment();
        }
        true
    }

    pub fn set_potential(&mut self, grid: Grid<f64>) -> Result<()> {
        self.set_derivative(vec![0; self.dimension], grid)
    }

    pub fn set_derivative(&mut self, orders: Vec<i64>, grid: Grid<f64>) -> Result<()> {
        self.set_derivative_named(DEFAULT_QUANTITY, orders, grid)
    }

    pub fn set_derivative_named(
        &mut self,
        name: &str,
        orders: Vec<i64>,
        grid: Grid<f64>,
    ) -> Result<()> {
        self.check_orders(&orders)?;
        if grid.dimension() != self.dimension || grid.extents() != self.extents.as_slice() {
            return Err(Error::shape(format!(
                "grid of shape {:?} stored into potential of shape {:?}",
                grid.extents(),
                self.extents
            )));
        }
        self.grids.insert(
            DerivativeKey {
                name: name.to_owned(),
                orders,
            },
            grid,
        );
        Ok(())
    }

    /// Multiplies every grid (of one quantity, or of all quantities) by a
    /// constant factor.
    pub fn scale(&mut self, factor: f64, name: Option<&str>) {
        for (key, grid) in self.grids.iter_mut() {
            if name.map_or(true, |n| key.name == n) {
                scale_grid(grid, factor);
            }
        }
    }

    /// Changes the physical support. Each derivative picks up the factor
    /// `∏ (old_j / new_j)^{order_j}` from the change of the sampling step.
    pub fn set_support(&mut self, support: Vec<f64>) -> Result<()> {
        if support.len() != self.dimension {
            return Err(Error::shape(format!(
                "{}-dimensional support for a {}-dimensional potential",
                support.len(),
                self.dimension
            )));
        }
        if support == self.support {
            return Ok(());
        }

        let ratios: Vec<f64> = self
            .support
            .iter()
            .zip(&support)
            .map(|(old, new)| old / new)
            .collect();

        for (key, grid) in self.grids.iter_mut() {
            let mut factor = 1.0;
            for (ratio, &order) in ratios.iter().zip(&key.orders) {
                factor *= ratio.powi(order as i32);
            }
            scale_grid(grid, factor);
        }

        self.support = support;
        Ok(())
    }

    /// Rescales all data so the field carries the new strength.
    pub fn set_strength(&mut self, strength: f64) {
        self.scale(strength / self.strength, None);
        self.strength = strength;
    }

    fn human_comment(&self) -> String {
        let join = |values: &[String]| values.join(", ");
        let extents: Vec<String> = self.extents.iter().map(|e| e.to_string()).collect();
        let support: Vec<String> = self.support.iter().map(|s| s.to_string()).collect();
        format!(
            "\npotgen generated potential:\n seed    = {}\n corlen  = {}\n version = {}\n extents = ({})\n support = ({})\n\n",
            self.seed,
            self.correlation_length,
            self.version,
            join(&extents),
            join(&support),
        )
    }

    /// Serialises the potential in the `bpot5` format.
    pub fn write_to(&self, out: &mut impl Write) -> Result<()> {
        out.write_all(FILE_MAGIC)?;

        // human-readable block, length-prefixed as ASCII so `head` shows it
        let comment = self.human_comment();
        write!(out, " {}", comment.len())?;
        out.write_all(comment.as_bytes())?;

        io::write_u64(out, self.dimension as u64)?;
        for &s in &self.support {
            io::write_f64(out, s)?;
        }
        for &e in &self.extents {
            io::write_u64(out, e as u64)?;
        }
        io::write_u64(out, self.seed)?;
        io::write_u64(out, self.version)?;
        io::write_u64(out, self.grids.len() as u64)?;
        io::write_f64(out, self.correlation_length)?;
        io::write_f64(out, self.strength)?;

        for (key, grid) in &self.grids {
            io::write_u64(out, key.name.len() as u64)?;
            out.write_all(key.name.as_bytes())?;
            for &order in &key.orders {
                io::write_i64(out, order)?;
            }
            grid.dump(out)?;
        }
        Ok(())
    }

    pub fn read_from(input: &mut impl BufRead) -> Result<Self> {
        io::expect_magic(input, FILE_MAGIC)?;
        let comment_len = io::read_ascii_u64(input)?;
        io::skip_bytes(input, comment_len)?;

        let dimension = io::read_u64(input)? as usize;
        let mut support = vec![0.0; dimension];
        for s in &mut support {
            *s = io::read_f64(input)?;
        }
        let mut extents = vec![0usize; dimension];
        for e in &mut extents {
            *e = io::read_u64(input)? as usize;
        }
        let seed = io::read_u64(input)?;
        let version = io::read_u64(input)?;
        let grid_count = io::read_u64(input)?;
        let correlation_length = io::read_f64(input)?;
        let strength = io::read_f64(input)?;

        let mut potential = Potential::new(extents, support)?;
        potential.set_creation_info(seed, version, correlation_length);
        potential.strength = strength;

        for _ in 0..grid_count {
            let name_len = io::read_u64(input)? as usize;
            let mut name_bytes = vec![0u8; name_len];
            input.read_exact(&mut name_bytes)?;
            let name = String::from_utf8(name_bytes)
                .map_err(|_| Error::format("quantity name is not valid utf-8"))?;

            let mut orders = vec![0i64; dimension];
            for order in &mut orders {
                *order = io::read_i64(input)?;
            }

            let grid = Grid::load(input)?;
            potential.set_derivative_named(&name, orders, grid)?;
        }

        Ok(potential)
    }
}
