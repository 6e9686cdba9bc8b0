//! Dense linear algebra kernel on top of `nalgebra`.
//!
//! Arithmetic (add, sub, mul, transpose) comes straight from `nalgebra`; this
//! module adds the checked operations the filter bank relies on:
//! - inversion that fails explicitly on (near-)singular input,
//! - symmetry / PSD checks and symmetrization,
//! - Gaussian log-density of an innovation,
//! - moment matching of a weighted Gaussian mixture (IMM mixing/combination).

use crate::{
    error::{ImmError, ImmResult},
    types::{DMat, DVec},
};
use std::f64::consts::PI;

/// Fail with `DimensionMismatch` unless `m` is `rows × cols`.
pub fn ensure_shape(m: &DMat, rows: usize, cols: usize, context: &str) -> ImmResult<()> {
    if m.nrows() != rows {
        return Err(ImmError::mismatch(format!("{context} rows"), rows, m.nrows()));
    }
    if m.ncols() != cols {
        return Err(ImmError::mismatch(format!("{context} cols"), cols, m.ncols()));
    }
    Ok(())
}

/// Invert a square matrix through LU decomposition.
///
/// The matrix counts as singular when the smallest absolute pivot is not
/// larger than `tolerance` times the largest one.
pub fn invert(m: &DMat, tolerance: f64, context: &str) -> ImmResult<DMat> {
    if !m.is_square() {
        return Err(ImmError::mismatch(
            format!("{context} (inverse of non-square matrix)"),
            m.nrows(),
            m.ncols(),
        ));
    }
    if m.nrows() == 0 {
        return Ok(DMat::zeros(0, 0));
    }

    let lu = m.clone().lu();
    let pivots = lu.u().diagonal();
    let largest = pivots.iter().fold(0.0_f64, |acc, p| acc.max(p.abs()));
    let smallest = pivots.iter().fold(f64::INFINITY, |acc, p| acc.min(p.abs()));

    if !(largest > 0.0) || !largest.is_finite() || smallest <= tolerance * largest {
        return Err(ImmError::numerical(
            context,
            format!("singular matrix (pivot ratio {:.3e})", smallest / largest),
        ));
    }

    lu.try_inverse()
        .ok_or_else(|| ImmError::numerical(context, "LU inverse failed"))
}

/// `(M + Mᵀ) / 2`
pub fn symmetrize(m: &DMat) -> DMat {
    (m + m.transpose()) * 0.5
}

fn scale_of(m: &DMat) -> f64 {
    m.iter().fold(1.0_f64, |acc, v| acc.max(v.abs()))
}

/// Symmetric within `tol`, relative to the largest entry (and at least 1).
pub fn is_symmetric(m: &DMat, tol: f64) -> bool {
    if !m.is_square() {
        return false;
    }
    let bound = tol * scale_of(m);
    let n = m.nrows();
    (0..n).all(|i| (i + 1..n).all(|j| (m[(i, j)] - m[(j, i)]).abs() <= bound))
}

/// Smallest eigenvalue of the symmetric part of `m`.
pub fn min_eigenvalue(m: &DMat) -> f64 {
    if m.nrows() == 0 {
        return 0.0;
    }
    symmetrize(m)
        .symmetric_eigen()
        .eigenvalues
        .iter()
        .fold(f64::INFINITY, |acc, v| acc.min(*v))
}

/// Symmetric and positive-semidefinite within `tol` (relative).
pub fn is_symmetric_psd(m: &DMat, tol: f64) -> bool {
    is_symmetric(m, tol) && min_eigenvalue(m) >= -tol * scale_of(m)
}

/// Log of the zero-mean Gaussian density of `y` under covariance `s`:
/// `-½ (yᵀ S⁻¹ y + ln det S + m ln 2π)`.
pub fn gaussian_log_density(y: &DVec, s: &DMat, tolerance: f64) -> ImmResult<f64> {
    let m = y.len();
    ensure_shape(s, m, m, "innovation covariance")?;

    let s_inv = invert(s, tolerance, "innovation covariance")?;
    // ln det S from the Cholesky factor; det S itself overflows for large S.
    let chol = s.clone().cholesky().ok_or_else(|| {
        ImmError::numerical("innovation covariance", "not positive definite")
    })?;
    let log_det = 2.0 * chol.l().diagonal().iter().map(|d| d.ln()).sum::<f64>();

    let maha2 = (y.transpose() * &s_inv * y)[(0, 0)];
    Ok(-0.5 * (maha2 + log_det + m as f64 * (2.0 * PI).ln()))
}

/// First two moments of a weighted Gaussian mixture:
/// `x = Σ wᵢ xᵢ`, `P = Σ wᵢ (Pᵢ + (xᵢ − x)(xᵢ − x)ᵀ)`, symmetrized.
///
/// This is both the IMM mixing formula and the output combination.
pub fn mixture_moments<'a, I>(components: I, dim: usize) -> (DVec, DMat)
where
    I: IntoIterator<Item = (f64, &'a DVec, &'a DMat)> + Clone,
{
    let mut mean = DVec::zeros(dim);
    for (w, x, _) in components.clone() {
        mean += x * w;
    }

    let mut cov = DMat::zeros(dim, dim);
    for (w, x, p) in components {
        let dx = x - &mean;
        cov += (p + &dx * dx.transpose()) * w;
    }
    (mean, symmetrize(&cov))
}
