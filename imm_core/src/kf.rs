//! Kalman filter: predict and update steps for one motion hypothesis.
//!
//! # Design choices
//! - Every matrix of a model (`F`, `Q`, `H`, `R`, `B`) is a [`MatrixFormula`]
//!   evaluated at the cycle's `dt`, so time-varying models need no code.
//! - All math is done in `f64` via `nalgebra` dynamic matrices; the native
//!   dimension of a model is whatever its configuration declares.
//! - The covariance update uses the Joseph form, then symmetrizes.
//! - [`KalmanFilter`] is stateless; [`ModelFilter`] owns the running state.
//!
//! ## Predict
//! x = F·x (+ B·u),  P = F·P·Fᵀ + Q
//!
//! ## Update
//! ν = z − H·x,  S = H·P·Hᵀ + R,  K = P·Hᵀ·S⁻¹,
//! x = x + K·ν,  P = (I−KH)·P·(I−KH)ᵀ + K·R·Kᵀ
//!
//! ## Unobserved rows
//! `H` doubles as a component selector: a row that is all zeros observes
//! nothing. Such rows are dropped, with the matching entries of `z` and
//! rows/columns of `R`, before the update.

use crate::{
    error::{ImmError, ImmResult},
    expr::MatrixFormula,
    linalg::{ensure_shape, gaussian_log_density, invert, symmetrize},
    types::{DMat, DVec, Measurement},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Likelihoods never go below this, even when `exp` underflows.
pub const LIKELIHOOD_FLOOR: f64 = f64::MIN_POSITIVE;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Trait for a Kalman filter model (predict + update).
pub trait KalmanFilter {
    /// Predict state and covariance forward by `dt` seconds.
    fn predict(
        &self,
        state: &DVec,
        cov: &DMat,
        dt: f64,
        control: Option<&DVec>,
    ) -> ImmResult<(DVec, DMat)>;

    /// Update state and covariance given an observation `z`, observation
    /// matrix `H` and measurement noise `R`.
    fn update(
        &self,
        state: &DVec,
        cov: &DMat,
        z: &DVec,
        h: &DMat,
        r: &DMat,
    ) -> ImmResult<KfUpdateResult>;
}

/// Result of a KF update step.
#[derive(Clone, Debug)]
pub struct KfUpdateResult {
    pub state: DVec,
    pub cov: DMat,
    /// Innovation ν = z − H·x
    pub innovation: DVec,
    /// Innovation covariance S = H·P·Hᵀ + R
    pub innovation_cov: DMat,
    /// Kalman gain K
    pub kalman_gain: DMat,
    /// ln N(ν; 0, S)
    pub log_likelihood: f64,
    /// N(ν; 0, S), floored at [`LIKELIHOOD_FLOOR`]
    pub likelihood: f64,
}

// ---------------------------------------------------------------------------
// Linear model
// ---------------------------------------------------------------------------

/// Filter family declared for a model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterType {
    KalmanFilter,
    /// Recognised but rejected at load: not linear-Gaussian.
    ExtendedKalmanFilter,
}

/// Linear-Gaussian motion hypothesis.
#[derive(Clone, Debug)]
pub struct LinearModel {
    name: String,
    filter_type: FilterType,
    transition: MatrixFormula,
    process_noise: MatrixFormula,
    observation: MatrixFormula,
    measurement_noise: MatrixFormula,
    control: MatrixFormula,
    singular_tolerance: f64,
}

impl LinearModel {
    /// Checks that `F`, `Q` are `n×n`, `H` is `m×n`, `R` is `m×m` and `B`
    /// has `n` rows.
    pub fn new(
        name: impl Into<String>,
        filter_type: FilterType,
        transition: MatrixFormula,
        process_noise: MatrixFormula,
        observation: MatrixFormula,
        measurement_noise: MatrixFormula,
        control: MatrixFormula,
    ) -> ImmResult<Self> {
        let name = name.into();
        let n = transition.nrows();
        let check = |what: &str, f: &MatrixFormula, rows: usize, cols: usize| {
            if f.nrows() != rows || f.ncols() != cols {
                return Err(ImmError::config(format!(
                    "model '{name}': {what} must be {rows}x{cols}, got {}x{}",
                    f.nrows(),
                    f.ncols()
                )));
            }
            Ok(())
        };
        check("transition_matrix", &transition, n, n)?;
        check("process_noise_matrix", &process_noise, n, n)?;
        if n == 0 {
            return Err(ImmError::config(format!("model '{name}' has an empty state")));
        }
        let m = observation.nrows();
        check("measurement_control_matrix", &observation, m, n)?;
        check("measurement_uncertainty_matrix", &measurement_noise, m, m)?;
        check("input_control_matrix", &control, n, control.ncols())?;

        Ok(Self {
            name,
            filter_type,
            transition,
            process_noise,
            observation,
            measurement_noise,
            control,
            singular_tolerance: 1e-12,
        })
    }

    pub fn with_singular_tolerance(mut self, tolerance: f64) -> Self {
        self.singular_tolerance = tolerance;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn filter_type(&self) -> FilterType {
        self.filter_type
    }

    /// Native state dimension `n`.
    pub fn dim(&self) -> usize {
        self.transition.nrows()
    }

    /// Rows of the model's own observation matrix.
    pub fn measurement_dim(&self) -> usize {
        self.observation.nrows()
    }

    pub fn control_dim(&self) -> usize {
        self.control.ncols()
    }

    pub fn transition_matrix(&self, dt: f64) -> ImmResult<DMat> {
        self.transition.evaluate(dt)
    }

    pub fn process_noise(&self, dt: f64) -> ImmResult<DMat> {
        self.process_noise.evaluate(dt)
    }

    pub fn observation_matrix(&self) -> ImmResult<DMat> {
        self.observation.evaluate(0.0)
    }

    pub fn measurement_noise(&self) -> ImmResult<DMat> {
        self.measurement_noise.evaluate(0.0)
    }

    pub fn control_matrix(&self) -> ImmResult<DMat> {
        self.control.evaluate(0.0)
    }

    pub(crate) fn formulas(&self) -> [(&'static str, &MatrixFormula); 5] {
        [
            ("transition_matrix", &self.transition),
            ("process_noise_matrix", &self.process_noise),
            ("measurement_control_matrix", &self.observation),
            ("measurement_uncertainty_matrix", &self.measurement_noise),
            ("input_control_matrix", &self.control),
        ]
    }
}

impl KalmanFilter for LinearModel {
    fn predict(
        &self,
        state: &DVec,
        cov: &DMat,
        dt: f64,
        control: Option<&DVec>,
    ) -> ImmResult<(DVec, DMat)> {
        let n = self.dim();
        if state.len() != n {
            return Err(ImmError::mismatch("predict state", n, state.len()));
        }
        ensure_shape(cov, n, n, "predict covariance")?;

        let f = self.transition_matrix(dt)?;
        let q = self.process_noise(dt)?;

        let mut predicted_state = &f * state;
        if let Some(u) = control {
            let b = self.control_matrix()?;
            if u.len() != b.ncols() {
                return Err(ImmError::mismatch("control vector", b.ncols(), u.len()));
            }
            predicted_state += b * u;
        }
        let predicted_cov = symmetrize(&(&f * cov * f.transpose() + q));
        Ok((predicted_state, predicted_cov))
    }

    fn update(
        &self,
        state: &DVec,
        cov: &DMat,
        z: &DVec,
        h: &DMat,
        r: &DMat,
    ) -> ImmResult<KfUpdateResult> {
        let n = self.dim();
        let m = z.len();
        if state.len() != n {
            return Err(ImmError::mismatch("update state", n, state.len()));
        }
        ensure_shape(cov, n, n, "update covariance")?;
        ensure_shape(h, m, n, "observation matrix")?;
        ensure_shape(r, m, m, "measurement noise")?;

        // Innovation: ν = z − H·x
        let innovation = z - h * state;

        // Innovation covariance: S = H·P·Hᵀ + R
        let pht = cov * h.transpose();
        let s = symmetrize(&(h * &pht + r));

        // Kalman gain: K = P·Hᵀ·S⁻¹
        let s_inv = invert(&s, self.singular_tolerance, "innovation covariance")?;
        let k = &pht * &s_inv;

        let new_state = state + &k * &innovation;

        // Joseph form P' = (I−KH)·P·(I−KH)ᵀ + K·R·Kᵀ
        let i_kh = DMat::identity(n, n) - &k * h;
        let new_cov = symmetrize(&(&i_kh * cov * i_kh.transpose() + &k * r * k.transpose()));

        let log_likelihood = gaussian_log_density(&innovation, &s, self.singular_tolerance)?;
        if log_likelihood.is_nan() {
            return Err(ImmError::numerical("measurement likelihood", "not a number"));
        }
        let likelihood = log_likelihood.exp().max(LIKELIHOOD_FLOOR);

        Ok(KfUpdateResult {
            state: new_state,
            cov: new_cov,
            innovation,
            innovation_cov: s,
            kalman_gain: k,
            log_likelihood,
            likelihood,
        })
    }
}

/// Keep only the rows of `H` that observe something, with the matching
/// entries of `z` and rows/columns of `R`.
pub fn observed_subspace(z: &DVec, h: &DMat, r: &DMat) -> ImmResult<(DVec, DMat, DMat)> {
    let m = z.len();
    if h.nrows() != m {
        return Err(ImmError::mismatch("observation matrix rows", m, h.nrows()));
    }
    ensure_shape(r, m, m, "measurement noise")?;

    let rows: Vec<usize> = (0..m)
        .filter(|&i| h.row(i).iter().any(|v| *v != 0.0))
        .collect();
    if rows.is_empty() {
        return Err(ImmError::numerical(
            "observation matrix",
            "no row observes any state component",
        ));
    }
    if rows.len() == m {
        return Ok((z.clone(), h.clone(), r.clone()));
    }

    Ok((
        z.select_rows(rows.iter()),
        h.select_rows(rows.iter()),
        r.select_rows(rows.iter()).select_columns(rows.iter()),
    ))
}

// ---------------------------------------------------------------------------
// Running filter
// ---------------------------------------------------------------------------

/// A model together with its current native estimate.
#[derive(Clone, Debug)]
pub struct ModelFilter {
    model: Arc<LinearModel>,
    state: DVec,
    cov: DMat,
}

impl ModelFilter {
    pub fn new(model: Arc<LinearModel>, state: DVec, cov: DMat) -> ImmResult<Self> {
        let mut filter = Self {
            state: DVec::zeros(model.dim()),
            cov: DMat::zeros(model.dim(), model.dim()),
            model,
        };
        filter.set_estimate(state, cov)?;
        Ok(filter)
    }

    pub fn model(&self) -> &Arc<LinearModel> {
        &self.model
    }

    pub fn name(&self) -> &str {
        self.model.name()
    }

    pub fn state(&self) -> &DVec {
        &self.state
    }

    pub fn cov(&self) -> &DMat {
        &self.cov
    }

    /// Replace the native estimate (mixing output).
    pub fn set_estimate(&mut self, state: DVec, cov: DMat) -> ImmResult<()> {
        let n = self.model.dim();
        if state.len() != n {
            return Err(ImmError::mismatch("model state", n, state.len()));
        }
        ensure_shape(&cov, n, n, "model covariance")?;
        self.state = state;
        self.cov = cov;
        Ok(())
    }

    pub fn predict(&mut self, dt: f64, control: Option<&DVec>) -> ImmResult<()> {
        let (state, cov) = self.model.predict(&self.state, &self.cov, dt, control)?;
        self.state = state;
        self.cov = cov;
        Ok(())
    }

    /// Update against `measurement`. Its `observation` override, when set,
    /// must already be expressed in this model's native space.
    pub fn update(&mut self, measurement: &Measurement) -> ImmResult<KfUpdateResult> {
        let h = match &measurement.observation {
            Some(h) => h.clone(),
            None => self.model.observation_matrix()?,
        };
        let r = match &measurement.noise {
            Some(r) => r.clone(),
            None => self.model.measurement_noise()?,
        };
        if h.nrows() != measurement.dim() {
            return Err(ImmError::mismatch("measurement", h.nrows(), measurement.dim()));
        }
        for (what, finite) in [
            ("measurement vector", measurement.z.iter().all(|v| v.is_finite())),
            ("observation matrix", h.iter().all(|v| v.is_finite())),
            ("measurement noise", r.iter().all(|v| v.is_finite())),
        ] {
            if !finite {
                return Err(ImmError::numerical(what, "non-finite entry"));
            }
        }
        let (z, h, r) = observed_subspace(&measurement.z, &h, &r)?;

        let res = self.model.update(&self.state, &self.cov, &z, &h, &r)?;
        self.state = res.state.clone();
        self.cov = res.cov.clone();
        Ok(res)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
