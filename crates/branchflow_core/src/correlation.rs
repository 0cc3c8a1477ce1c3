//! Correlation functions for the random-field generator.
//!
//! A correlation is an opaque `ℝ^D → ℝ` callable; the constructors below
//! cover the built-in families, and [`transformed`] wraps any correlation
//! with a linear change of coordinates.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use crate::error::{Error, Result};

pub type CorrelationFn = Arc<dyn Fn(&[f64]) -> f64 + Send + Sync>;

/// Isotropic Gaussian, `exp(-|x|² / ℓ²)`.
pub fn gaussian(corrlength: f64) -> CorrelationFn {
    let scale = -1.0 / (corrlength * corrlength);
    Arc::new(move |x| {
        let r2: f64 = x.iter().map(|v| v * v).sum();
        (r2 * scale).exp()
    })
}

/// Gaussian with a per-axis anisotropy factor, `exp(-Σ aⱼ² xⱼ² / ℓ²)`.
pub fn anisotropic_gaussian(corrlength: f64, anisotropy: &[f64]) -> CorrelationFn {
    let factors: Vec<f64> = anisotropy
        .iter()
        .map(|a| a * a / (corrlength * corrlength))
        .collect();
    Arc::new(move |x| {
        let sum: f64 = x
            .iter()
            .zip(&factors)
            .map(|(v, f)| -v * v * f)
            .sum();
        sum.exp()
    })
}

/// Hyperbolic secant profile, `sech(|x| / ℓ)`.
pub fn sech(corrlength: f64) -> CorrelationFn {
    let scale = 1.0 / corrlength;
    Arc::new(move |x| {
        let r: f64 = x.iter().map(|v| v * v).sum::<f64>().sqrt();
        1.0 / (r * scale).cosh()
    })
}

/// Algebraic decay, `(1 + |x|²/ℓ²)^{-α}`.
pub fn power(corrlength: f64, alpha: f64) -> CorrelationFn {
    let scale = 1.0 / (corrlength * corrlength);
    Arc::new(move |x| {
        let base = 1.0 + x.iter().map(|v| v * v).sum::<f64>() * scale;
        base.powf(-alpha)
    })
}

/// Applies `matrix` to the argument before evaluating `inner`.
pub fn transformed(inner: CorrelationFn, matrix: DMatrix<f64>) -> CorrelationFn {
    Arc::new(move |x| {
        let v = &matrix * DVector::from_column_slice(x);
        inner(v.as_slice())
    })
}

/// Parses a whitespace-separated list of 1, 4 or 9 numbers into the square
/// transformation matrix for [`transformed`]. Surrounding quotes are allowed,
/// as command lines often carry them through.
pub fn parse_trafo_matrix(text: &str) -> Result<DMatrix<f64>> {
    let trimmed = text.trim().trim_matches('"');
    let entries: Vec<f64> = trimmed
        .split_whitespace()
        .map(|token| {
            token
                .parse::<f64>()
                .map_err(|_| Error::domain(format!("invalid matrix entry {token:?}")))
        })
        .collect::<Result<_>>()?;

    let dim = match entries.len() {
        1 => 1,
        4 => 2,
        9 => 3,
        n => {
            return Err(Error::shape(format!(
                "transformation matrix must be square with dimension <= 3, got {n} entries"
            )))
        }
    };
    Ok(DMatrix::from_row_slice(dim, dim, &entries))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gaussian_peaks_at_origin() {
        let c = gaussian(0.1);
        assert_eq!(c(&[0.0, 0.0]), 1.0);
        assert!((c(&[0.1, 0.0]) - (-1.0f64).exp()).abs() < 1e-12);
        assert!(c(&[0.5, 0.5]) < 1e-10);
    }

    #[test]
    fn anisotropic_gaussian_scales_each_axis() {
        let c = anisotropic_gaussian(0.1, &[1.0, 2.0]);
        let base = gaussian(0.1);
        assert!((c(&[0.05, 0.0]) - base(&[0.05, 0.0])).abs() < 1e-12);
        // twice the anisotropy acts like twice the distance
        assert!((c(&[0.0, 0.05]) - base(&[0.1, 0.0])).abs() < 1e-12);
    }

    #[test]
    fn power_falls_off_algebraically() {
        let c = power(1.0, 2.0);
        assert_eq!(c(&[0.0]), 1.0);
        assert!((c(&[1.0]) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn transformed_applies_matrix_first() {
        let matrix = parse_trafo_matrix("2 0 0 1").unwrap();
        let c = transformed(gaussian(0.1), matrix);
        let base = gaussian(0.1);
        assert!((c(&[0.05, 0.0]) - base(&[0.1, 0.0])).abs() < 1e-12);
    }

    #[test]
    fn trafo_matrix_rejects_bad_sizes() {
        assert!(parse_trafo_matrix("1 2 3").is_err());
        assert!(parse_trafo_matrix("\"1 0 0 1\"").is_ok());
    }
}
