use thiserror::Error;

/// Failure kinds surfaced by the numerical core.
///
/// The core surfaces every failure immediately; recovery happens at exactly
/// two boundaries (the derivative stage falls back to a sequential sweep on
/// `Resource`, and the density worker back-pressures instead of erroring).
#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// Wrong magic bytes, element-type mismatch, unexpected end of file.
    #[error("bad file format: {0}")]
    Format(String),

    /// Extent/dimension disagreements, odd extents where even is required.
    #[error("shape mismatch: {0}")]
    Shape(String),

    /// Request that is valid in form but unsatisfiable in value.
    #[error("domain violation: {0}")]
    Domain(String),

    /// The discretised correlation has a power spectrum with negative or
    /// imaginary components beyond tolerance.
    #[error(
        "power spectrum contains negative or imaginary components \
         ({value} at offset {offset}); check the correlation function"
    )]
    NonPsdCorrelation { offset: usize, value: f64 },

    #[error("allocation of {bytes} bytes failed")]
    OutOfMemory { bytes: usize },

    /// API misuse that a correct caller can never trigger.
    #[error("invalid use: {0}")]
    Programming(String),
}

impl Error {
    pub fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }

    pub fn shape(msg: impl Into<String>) -> Self {
        Error::Shape(msg.into())
    }

    pub fn domain(msg: impl Into<String>) -> Self {
        Error::Domain(msg.into())
    }

    pub fn programming(msg: impl Into<String>) -> Self {
        Error::Programming(msg.into())
    }

    /// True for allocation failures, the only kind with a fallback path.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Error::OutOfMemory { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
