//! Model space adapter: moves states and covariances between a model's native
//! space (`n` dimensions) and the fused space (`N` dimensions).
//!
//! ## Expansion
//! The native state is padded with ones up to `N` and multiplied by the
//! `expansion_matrix`. The native covariance is padded with an identity block
//! on the unestimated dimensions and sandwiched by one of the covariance
//! expansion matrices, `E · P · Eᵀ`. A coefficient `c` placed on a padded
//! column therefore yields variance `c²` on that fused dimension, never zero.
//! The padding block is the identity, not all ones: padded dimensions carry
//! no cross-covariance with the estimated dimensions or with each other.
//!
//! ## Shrinking
//! `x_n = S · x`, `P_n = S · P · Sᵀ` with the `n × N` `shrinking_matrix`.
//!
//! Models whose native space already is the fused space use the identity.

use crate::{
    error::{ImmError, ImmResult},
    linalg::{ensure_shape, symmetrize},
    types::{DMat, DVec},
};
use serde::{Deserialize, Serialize};

/// Which covariance expansion matrix to apply.
///
/// Both variants inflate unestimated dimensions; they differ only in the
/// coefficient configured for them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CovarianceExpansion {
    /// `expansion_matrix_covariance`
    #[serde(alias = "expansion_matrix_covariance")]
    Covariance,
    /// `expansion_matrix_s`
    #[serde(alias = "expansion_matrix_s")]
    Innovation,
}

/// Immutable set of projection matrices for one native dimensionality.
#[derive(Clone, Debug, PartialEq)]
pub struct Projection {
    expansion: DMat,
    expansion_covariance: DMat,
    expansion_s: DMat,
    shrinking: DMat,
}

impl Projection {
    pub fn new(
        expansion: DMat,
        expansion_covariance: DMat,
        expansion_s: DMat,
        shrinking: DMat,
    ) -> ImmResult<Self> {
        let fused = expansion.nrows();
        ensure_shape(&expansion, fused, fused, "expansion_matrix")?;
        ensure_shape(&expansion_covariance, fused, fused, "expansion_matrix_covariance")?;
        ensure_shape(&expansion_s, fused, fused, "expansion_matrix_s")?;
        if shrinking.ncols() != fused {
            return Err(ImmError::mismatch("shrinking_matrix cols", fused, shrinking.ncols()));
        }
        if shrinking.nrows() == 0 || shrinking.nrows() > fused {
            return Err(ImmError::config(format!(
                "shrinking_matrix must have between 1 and {fused} rows, got {}",
                shrinking.nrows()
            )));
        }
        Ok(Self {
            expansion,
            expansion_covariance,
            expansion_s,
            shrinking,
        })
    }

    pub fn fused_dim(&self) -> usize {
        self.expansion.nrows()
    }

    pub fn native_dim(&self) -> usize {
        self.shrinking.nrows()
    }

    pub fn covariance_matrix(&self, variant: CovarianceExpansion) -> &DMat {
        match variant {
            CovarianceExpansion::Covariance => &self.expansion_covariance,
            CovarianceExpansion::Innovation => &self.expansion_s,
        }
    }

    pub fn expand_state(&self, x: &DVec) -> ImmResult<DVec> {
        let (n, big_n) = (self.native_dim(), self.fused_dim());
        if x.len() != n {
            return Err(ImmError::mismatch("native state", n, x.len()));
        }
        let padded = DVec::from_fn(big_n, |i, _| if i < n { x[i] } else { 1.0 });
        Ok(&self.expansion * padded)
    }

    pub fn expand_covariance(&self, p: &DMat, variant: CovarianceExpansion) -> ImmResult<DMat> {
        let (n, big_n) = (self.native_dim(), self.fused_dim());
        ensure_shape(p, n, n, "native covariance")?;
        let mut padded = DMat::identity(big_n, big_n);
        padded.view_mut((0, 0), (n, n)).copy_from(p);
        let e = self.covariance_matrix(variant);
        Ok(symmetrize(&(e * padded * e.transpose())))
    }

    pub fn shrink_state(&self, x: &DVec) -> ImmResult<DVec> {
        if x.len() != self.fused_dim() {
            return Err(ImmError::mismatch("fused state", self.fused_dim(), x.len()));
        }
        Ok(&self.shrinking * x)
    }

    pub fn shrink_covariance(&self, p: &DMat) -> ImmResult<DMat> {
        let big_n = self.fused_dim();
        ensure_shape(p, big_n, big_n, "fused covariance")?;
        Ok(symmetrize(&(&self.shrinking * p * self.shrinking.transpose())))
    }

    /// Linear part of the state expansion: the first `n` columns of
    /// `expansion_matrix`.
    pub fn native_columns(&self) -> DMat {
        self.expansion.columns(0, self.native_dim()).into_owned()
    }
}

/// Per-model projections into and out of the fused space.
#[derive(Clone, Debug)]
pub struct SpaceAdapter {
    fused_dim: usize,
    projections: Vec<Option<Projection>>,
}

impl SpaceAdapter {
    /// `projections[i]` is `None` for models living in the fused space.
    pub fn new(fused_dim: usize, projections: Vec<Option<Projection>>) -> ImmResult<Self> {
        for p in projections.iter().flatten() {
            if p.fused_dim() != fused_dim {
                return Err(ImmError::mismatch("projection fused dimension", fused_dim, p.fused_dim()));
            }
        }
        Ok(Self {
            fused_dim,
            projections,
        })
    }

    pub fn fused_dim(&self) -> usize {
        self.fused_dim
    }

    pub fn native_dim(&self, model: usize) -> ImmResult<usize> {
        Ok(self
            .projection(model)?
            .map_or(self.fused_dim, Projection::native_dim))
    }

    pub fn projection(&self, model: usize) -> ImmResult<Option<&Projection>> {
        self.projections
            .get(model)
            .map(Option::as_ref)
            .ok_or_else(|| ImmError::mismatch("model index bound", self.projections.len(), model))
    }

    pub fn expand_state(&self, x: &DVec, model: usize) -> ImmResult<DVec> {
        match self.projection(model)? {
            Some(p) => p.expand_state(x),
            None => self.identity_state(x),
        }
    }

    pub fn expand_covariance(
        &self,
        p: &DMat,
        model: usize,
        variant: CovarianceExpansion,
    ) -> ImmResult<DMat> {
        match self.projection(model)? {
            Some(proj) => proj.expand_covariance(p, variant),
            None => self.identity_covariance(p),
        }
    }

    pub fn shrink_state(&self, x: &DVec, model: usize) -> ImmResult<DVec> {
        match self.projection(model)? {
            Some(p) => p.shrink_state(x),
            None => self.identity_state(x),
        }
    }

    pub fn shrink_covariance(&self, p: &DMat, model: usize) -> ImmResult<DMat> {
        match self.projection(model)? {
            Some(proj) => proj.shrink_covariance(p),
            None => self.identity_covariance(p),
        }
    }

    /// Native → fused.
    pub fn to_fused(
        &self,
        x: &DVec,
        p: &DMat,
        model: usize,
        variant: CovarianceExpansion,
    ) -> ImmResult<(DVec, DMat)> {
        Ok((
            self.expand_state(x, model)?,
            self.expand_covariance(p, model, variant)?,
        ))
    }

    /// Fused → native.
    pub fn to_native(&self, x: &DVec, p: &DMat, model: usize) -> ImmResult<(DVec, DMat)> {
        Ok((self.shrink_state(x, model)?, self.shrink_covariance(p, model)?))
    }

    /// Express an observation matrix written over the fused state in the
    /// model's native space.
    pub fn observation_to_native(&self, h: &DMat, model: usize) -> ImmResult<DMat> {
        if h.ncols() != self.fused_dim {
            return Err(ImmError::mismatch("observation matrix cols", self.fused_dim, h.ncols()));
        }
        match self.projection(model)? {
            Some(p) => Ok(h * p.native_columns()),
            None => Ok(h.clone()),
        }
    }

    fn identity_state(&self, x: &DVec) -> ImmResult<DVec> {
        if x.len() != self.fused_dim {
            return Err(ImmError::mismatch("state", self.fused_dim, x.len()));
        }
        Ok(x.clone())
    }

    fn identity_covariance(&self, p: &DMat) -> ImmResult<DMat> {
        ensure_shape(p, self.fused_dim, self.fused_dim, "covariance")?;
        Ok(p.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// Native space `[x, vx, y, vy]`, fused `[x, vx, ax, y, vy, ay]`.
    pub(crate) fn planar_projection() -> Projection {
        #[rustfmt::skip]
        let expansion = DMat::from_row_slice(6, 6, &[
            1., 0., 0., 0., 0., 0.,
            0., 1., 0., 0., 0., 0.,
            0., 0., 0., 0., 0., 0.,
            0., 0., 1., 0., 0., 0.,
            0., 0., 0., 1., 0., 0.,
            0., 0., 0., 0., 0., 0.,
        ]);
        let inflate = |c: f64| {
            #[rustfmt::skip]
            let m = DMat::from_row_slice(6, 6, &[
                1., 0., 0., 0., 0., 0.,
                0., 1., 0., 0., 0., 0.,
                0., 0., 0., 0., c,  0.,
                0., 0., 1., 0., 0., 0.,
                0., 0., 0., 1., 0., 0.,
                0., 0., 0., 0., 0., c,
            ]);
            m
        };
        #[rustfmt::skip]
        let shrinking = DMat::from_row_slice(4, 6, &[
            1., 0., 0., 0., 0., 0.,
            0., 1., 0., 0., 0., 0.,
            0., 0., 0., 1., 0., 0.,
            0., 0., 0., 0., 1., 0.,
        ]);
        Projection::new(expansion, inflate(9.0), inflate(1.05), shrinking).unwrap()
    }

    fn native_sample() -> (DVec, DMat) {
        let x = DVec::from_vec(vec![10.0, 2.0, -5.0, 0.5]);
        #[rustfmt::skip]
        let p = DMat::from_row_slice(4, 4, &[
            4.0, 0.5, 0.1, 0.0,
            0.5, 2.0, 0.0, 0.2,
            0.1, 0.0, 3.0, 0.4,
            0.0, 0.2, 0.4, 1.0,
        ]);
        (x, p)
    }

    #[test]
    fn expansion_places_native_components() {
        let adapter = SpaceAdapter::new(6, vec![Some(planar_projection())]).unwrap();
        let (x, p) = native_sample();
        let (xf, pf) = adapter.to_fused(&x, &p, 0, CovarianceExpansion::Covariance).unwrap();

        let expected = [10.0, 2.0, 0.0, -5.0, 0.5, 0.0];
        for (i, v) in expected.iter().enumerate() {
            assert_abs_diff_eq!(xf[i], *v);
        }
        // measured block copied exactly
        let idx = [0usize, 1, 3, 4];
        for (a, &fa) in idx.iter().enumerate() {
            for (b, &fb) in idx.iter().enumerate() {
                assert_eq!(pf[(fa, fb)], p[(a, b)]);
            }
        }
        assert_abs_diff_eq!(pf[(2, 2)], 81.0);
        assert_abs_diff_eq!(pf[(5, 5)], 81.0);
        // padded dimensions are uncorrelated with everything else
        for i in [0usize, 1, 3, 4, 5] {
            assert_eq!(pf[(2, i)], 0.0);
            assert_eq!(pf[(i, 2)], 0.0);
        }
        assert_eq!(pf[(5, 0)], 0.0);
    }

    #[test]
    fn round_trip_keeps_measured_dims_and_inflates_the_rest() {
        let adapter = SpaceAdapter::new(6, vec![Some(planar_projection())]).unwrap();
        let (x, p) = native_sample();

        for (variant, var) in [
            (CovarianceExpansion::Covariance, 81.0),
            (CovarianceExpansion::Innovation, 1.05 * 1.05),
        ] {
            let (xf, pf) = adapter.to_fused(&x, &p, 0, variant).unwrap();
            let (xn, pn) = adapter.to_native(&xf, &pf, 0).unwrap();
            assert_eq!(xn, x);
            assert_eq!(pn, p);

            let (xf2, pf2) = adapter.to_fused(&xn, &pn, 0, variant).unwrap();
            assert_eq!(xf2, xf);
            assert_eq!(pf2, pf);
            assert_abs_diff_eq!(pf2[(2, 2)], var, epsilon = 1e-12);
            assert_abs_diff_eq!(pf2[(5, 5)], var, epsilon = 1e-12);
        }
    }

    #[test]
    fn identity_models_pass_through() {
        let adapter = SpaceAdapter::new(6, vec![None]).unwrap();
        let x = DVec::from_element(6, 3.0);
        let p = DMat::identity(6, 6) * 2.0;
        let (xf, pf) = adapter.to_fused(&x, &p, 0, CovarianceExpansion::Innovation).unwrap();
        assert_eq!(xf, x);
        assert_eq!(pf, p);
        assert_eq!(adapter.native_dim(0).unwrap(), 6);
    }

    #[test]
    fn wrong_dimensions_are_rejected() {
        let adapter = SpaceAdapter::new(6, vec![Some(planar_projection()), None]).unwrap();
        let x6 = DVec::zeros(6);
        assert!(matches!(
            adapter.expand_state(&x6, 0),
            Err(ImmError::DimensionMismatch { .. })
        ));
        assert!(adapter.shrink_state(&DVec::zeros(4), 1).is_err());
        assert!(adapter.expand_state(&x6, 2).is_err());
    }

    #[test]
    fn fused_observation_is_projected_for_reduced_models() {
        let adapter = SpaceAdapter::new(6, vec![Some(planar_projection())]).unwrap();
        #[rustfmt::skip]
        let h = DMat::from_row_slice(2, 6, &[
            1., 0., 0., 0., 0., 0.,
            0., 0., 0., 1., 0., 0.,
        ]);
        let hn = adapter.observation_to_native(&h, 0).unwrap();
        assert_eq!(hn, DMat::from_row_slice(2, 4, &[1., 0., 0., 0., 0., 0., 1., 0.]));
    }
}
