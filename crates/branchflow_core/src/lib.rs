pub mod correlation;
pub mod error;
pub mod fft;
pub mod grid;
pub mod index;
pub mod interp;
pub mod io;
pub mod memory;
pub mod potential;
/// The `branchflow_core` crate implements the two numerical engines for
/// branched-flow studies and their shared infrastructure.
///
/// Key components:
/// - **Grids**: N-dimensional storage with identity, FFT-centred and
///   periodic indexing (`grid`, `index`).
/// - **Generator**: spectral synthesis of stationary random fields with a
///   prescribed correlation, including all derivatives (`potgen`, `fft`,
///   `correlation`, `potential`).
/// - **Tracer**: parallel integration of ray ensembles through the field,
///   with thread-local and thread-shared observers reducing the results
///   (`tracer`).
pub mod potgen;
pub mod tracer;

pub use error::{Error, Result};
