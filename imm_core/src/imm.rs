//! Interacting Multiple Models (IMM) estimator.
//!
//! Maintains a bank of Kalman filters and a probability vector μ over models.
//! One cycle:
//! 1. Mixing: each model starts from a μ-and-Π weighted blend of all model
//!    estimates, formed in the fused space and shrunk to its native space.
//! 2. Predict every model by `dt`.
//! 3. Update every model against the measurement, if any.
//! 4. Mode probabilities: Bayesian update from the likelihoods, or plain
//!    Markov propagation without a measurement.
//! 5. Combination: μ-weighted moment match of all models in the fused space.
//!
//! The fused prediction (after step 2, weighted by the predicted
//! probabilities) is reported alongside the posterior, for gating.
//!
//! A cycle works on copies and is committed only when every step succeeded.
//! A failed cycle leaves the previous estimate in place, flagged as stale.

use crate::{
    config::ModelSet,
    error::{ImmError, ImmResult},
    kf::ModelFilter,
    linalg::{ensure_shape, is_symmetric_psd, mixture_moments},
    mode::{ModeProbabilities, ProbabilityUpdate},
    types::{DMat, DVec, Measurement},
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Snapshot of the estimator after a cycle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImmOutput {
    /// Fused state
    pub state: DVec,
    /// Fused covariance
    pub covariance: DMat,
    /// Fused state after prediction, before the measurement
    pub prior_state: DVec,
    pub prior_covariance: DMat,
    pub mode_probabilities: DVec,
    /// Per-model likelihoods of the last measurement; `None` after a
    /// prediction-only cycle.
    pub likelihoods: Option<Vec<f64>>,
    /// The probability update fell back to the predicted probabilities.
    pub probability_fallback: bool,
    /// The last cycle failed; the estimate is the last good one.
    pub stale: bool,
}

/// Result of an uncommitted cycle.
struct Cycle {
    filters: Vec<ModelFilter>,
    modes: ModeProbabilities,
    prior_state: DVec,
    prior_covariance: DMat,
    state: DVec,
    covariance: DMat,
    likelihoods: Option<Vec<f64>>,
    update: Option<ProbabilityUpdate>,
}

#[derive(Clone, Debug)]
pub struct ImmEstimator {
    models: Arc<ModelSet>,
    filters: Vec<ModelFilter>,
    modes: ModeProbabilities,
    prior_state: DVec,
    prior_covariance: DMat,
    state: DVec,
    covariance: DMat,
    likelihoods: Option<Vec<f64>>,
    probability_fallback: bool,
    stale: bool,
    cycles: u64,
}

impl ImmEstimator {
    /// Every model starts from the initial fused estimate shrunk to its
    /// native space; mode probabilities start at their configured values.
    pub fn new(models: Arc<ModelSet>, initial_state: DVec, initial_covariance: DMat) -> ImmResult<Self> {
        let n = models.fused_dim();
        if initial_state.len() != n {
            return Err(ImmError::mismatch("initial state", n, initial_state.len()));
        }
        ensure_shape(&initial_covariance, n, n, "initial covariance")?;
        if !is_symmetric_psd(&initial_covariance, models.settings().symmetry_tolerance) {
            return Err(ImmError::numerical(
                "initial covariance",
                "not symmetric positive semi-definite",
            ));
        }

        let adapter = models.adapter();
        let filters = models
            .models()
            .iter()
            .enumerate()
            .map(|(i, model)| {
                let (x, p) = adapter.to_native(&initial_state, &initial_covariance, i)?;
                ModelFilter::new(Arc::clone(model), x, p).map_err(|e| e.in_model(model.name()))
            })
            .collect::<ImmResult<Vec<_>>>()?;
        let modes = models.mode_tracker()?;

        Ok(Self {
            models,
            filters,
            modes,
            prior_state: initial_state.clone(),
            prior_covariance: initial_covariance.clone(),
            state: initial_state,
            covariance: initial_covariance,
            likelihoods: None,
            probability_fallback: false,
            stale: false,
            cycles: 0,
        })
    }

    pub fn step(&mut self, dt: f64, measurement: Option<&Measurement>) -> ImmResult<ImmOutput> {
        self.step_with_control(dt, measurement, None)
    }

    /// One full IMM cycle. On error nothing is committed and the current
    /// estimate is flagged stale.
    pub fn step_with_control(
        &mut self,
        dt: f64,
        measurement: Option<&Measurement>,
        control: Option<&DVec>,
    ) -> ImmResult<ImmOutput> {
        match self.run_cycle(dt, measurement, control) {
            Ok(cycle) => {
                self.filters = cycle.filters;
                self.modes = cycle.modes;
                self.prior_state = cycle.prior_state;
                self.prior_covariance = cycle.prior_covariance;
                self.state = cycle.state;
                self.covariance = cycle.covariance;
                self.likelihoods = cycle.likelihoods;
                self.probability_fallback = cycle.update == Some(ProbabilityUpdate::Fallback);
                self.stale = false;
                self.cycles += 1;
                tracing::debug!(
                    cycle = self.cycles,
                    dt,
                    measured = measurement.is_some(),
                    dominant = self.dominant_model(),
                    fallback = self.probability_fallback,
                    "IMM cycle committed"
                );
                Ok(self.output())
            }
            Err(e) => {
                self.stale = true;
                tracing::warn!(cycle = self.cycles + 1, dt, error = %e, "IMM cycle aborted, keeping last estimate");
                Err(e)
            }
        }
    }

    fn run_cycle(
        &self,
        dt: f64,
        measurement: Option<&Measurement>,
        control: Option<&DVec>,
    ) -> ImmResult<Cycle> {
        if !dt.is_finite() || dt < 0.0 {
            return Err(ImmError::InvalidTimeStep(dt));
        }
        let parallel = self.models.settings().parallel_models;
        let mut filters = self.filters.clone();
        let mut modes = self.modes.clone();

        // 1. mixing
        self.mix(&mut filters)?;

        // 2. predict
        let predict = |f: &mut ModelFilter| {
            f.predict(dt, control).map_err(|e| e.in_model(f.name()))
        };
        if parallel {
            filters.par_iter_mut().try_for_each(predict)?;
        } else {
            filters.iter_mut().try_for_each(predict)?;
        }

        let (prior_state, prior_covariance) = self.combine(&filters, &modes.predicted())?;
        ensure_finite(&prior_state, &prior_covariance, "fused prediction")?;

        // 3. update, 4. mode probabilities
        let (likelihoods, update) = match measurement {
            Some(meas) => {
                let likelihoods = self.update_all(&mut filters, meas, parallel)?;
                let update = modes.update(&likelihoods)?;
                (Some(likelihoods), Some(update))
            }
            None => {
                modes.propagate();
                (None, None)
            }
        };

        // 5. combination
        let (state, covariance) = self.combine(&filters, modes.probabilities())?;
        ensure_finite(&state, &covariance, "fused estimate")?;

        Ok(Cycle {
            filters,
            modes,
            prior_state,
            prior_covariance,
            state,
            covariance,
            likelihoods,
            update,
        })
    }

    /// Fused representation of every model estimate.
    fn fused_estimates(&self, filters: &[ModelFilter]) -> ImmResult<Vec<(DVec, DMat)>> {
        let adapter = self.models.adapter();
        let variant = self.models.covariance_expansion();
        filters
            .iter()
            .enumerate()
            .map(|(i, f)| {
                adapter
                    .to_fused(f.state(), f.cov(), i, variant)
                    .map_err(|e| e.in_model(f.name()))
            })
            .collect()
    }

    fn mix(&self, filters: &mut [ModelFilter]) -> ImmResult<()> {
        let weights = self.modes.mixing_weights()?;
        let fused = self.fused_estimates(filters)?;
        let adapter = self.models.adapter();
        let n = self.models.fused_dim();

        for (j, filter) in filters.iter_mut().enumerate() {
            let components = fused
                .iter()
                .enumerate()
                .map(|(i, (x, p))| (weights[(i, j)], x, p));
            let (x0, p0) = mixture_moments(components, n);
            let (x, p) = adapter
                .to_native(&x0, &p0, j)
                .map_err(|e| e.in_model(filter.name()))?;
            filter
                .set_estimate(x, p)
                .map_err(|e| e.in_model(filter.name()))?;
        }
        Ok(())
    }

    fn update_all(
        &self,
        filters: &mut [ModelFilter],
        measurement: &Measurement,
        parallel: bool,
    ) -> ImmResult<Vec<f64>> {
        let adapter = self.models.adapter();
        let update = |(i, f): (usize, &mut ModelFilter)| -> ImmResult<f64> {
            let native = match &measurement.observation {
                Some(h) => Measurement {
                    observation: Some(
                        adapter
                            .observation_to_native(h, i)
                            .map_err(|e| e.in_model(f.name()))?,
                    ),
                    ..measurement.clone()
                },
                None => measurement.clone(),
            };
            f.update(&native)
                .map(|res| res.likelihood)
                .map_err(|e| e.in_model(f.name()))
        };

        if parallel {
            filters.par_iter_mut().enumerate().map(update).collect()
        } else {
            filters.iter_mut().enumerate().map(update).collect()
        }
    }

    fn combine(&self, filters: &[ModelFilter], mu: &DVec) -> ImmResult<(DVec, DMat)> {
        let fused = self.fused_estimates(filters)?;
        let components = fused.iter().zip(mu.iter()).map(|((x, p), w)| (*w, x, p));
        Ok(mixture_moments(components, self.models.fused_dim()))
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Fused state and covariance of the last committed cycle.
    pub fn estimate(&self) -> (&DVec, &DMat) {
        (&self.state, &self.covariance)
    }

    /// Fused prediction of the last committed cycle.
    pub fn prior_estimate(&self) -> (&DVec, &DMat) {
        (&self.prior_state, &self.prior_covariance)
    }

    pub fn mode_probabilities(&self) -> &DVec {
        self.modes.probabilities()
    }

    /// Per-model native estimates, in configuration order.
    pub fn model_states(&self) -> &[ModelFilter] {
        &self.filters
    }

    /// Name of the most probable model.
    pub fn dominant_model(&self) -> &str {
        self.modes
            .probabilities()
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map_or("", |(i, _)| self.filters[i].name())
    }

    pub fn model_set(&self) -> &Arc<ModelSet> {
        &self.models
    }

    /// Number of committed cycles.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn output(&self) -> ImmOutput {
        ImmOutput {
            state: self.state.clone(),
            covariance: self.covariance.clone(),
            prior_state: self.prior_state.clone(),
            prior_covariance: self.prior_covariance.clone(),
            mode_probabilities: self.modes.probabilities().clone(),
            likelihoods: self.likelihoods.clone(),
            probability_fallback: self.probability_fallback,
            stale: self.stale,
        }
    }
}

fn ensure_finite(state: &DVec, cov: &DMat, context: &str) -> ImmResult<()> {
    if state.iter().chain(cov.iter()).all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(ImmError::numerical(context, "non-finite entry"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ImmConfig, kf::KalmanFilter};
    use approx::assert_abs_diff_eq;

    const TWO_MODELS: &str = include_str!("../../configs/imm_two_models.json");

    fn model_set(edit: impl FnOnce(&mut ImmConfig)) -> Arc<ModelSet> {
        let mut config: ImmConfig = serde_json::from_str(TWO_MODELS).unwrap();
        edit(&mut config);
        Arc::new(ModelSet::from_config(&config).unwrap())
    }

    fn initial(set: &ModelSet) -> (DVec, DMat) {
        let x = set
            .state_from_labels(&[("pos_x", 10.0), ("vel_x", 2.0), ("pos_y", -4.0), ("vel_y", 1.0)])
            .unwrap();
        (x, DMat::identity(6, 6) * 10.0)
    }

    #[test]
    fn degenerate_bank_matches_plain_kalman_prediction() {
        let set = model_set(|c| {
            c.parameters.insert("sigma_a_sq".into(), 0.0);
            c.mode_probabilities = vec![1.0.into(), 0.0.into()];
        });
        let (x0, p0) = initial(&set);
        let mut imm = ImmEstimator::new(set.clone(), x0.clone(), p0.clone()).unwrap();

        let out = imm.step(1.5, None).unwrap();
        let (x_kf, p_kf) = set.models()[0].predict(&x0, &p0, 1.5, None).unwrap();
        for i in 0..6 {
            assert_abs_diff_eq!(out.state[i], x_kf[i], epsilon = 1e-9);
            for j in 0..6 {
                assert_abs_diff_eq!(out.covariance[(i, j)], p_kf[(i, j)], epsilon = 1e-9);
            }
        }
        assert!(out.likelihoods.is_none());
        assert_abs_diff_eq!(out.mode_probabilities[0], 0.95, epsilon = 1e-12);
    }

    #[test]
    fn zero_time_step_without_measurement_keeps_estimate() {
        let set = model_set(|_| {});
        let (x0, p0) = initial(&set);
        let mut imm = ImmEstimator::new(set, x0.clone(), p0.clone()).unwrap();
        let out = imm.step(0.0, None).unwrap();
        for i in 0..6 {
            assert_abs_diff_eq!(out.state[i], x0[i], epsilon = 1e-12);
            assert_abs_diff_eq!(out.covariance[(i, i)], p0[(i, i)], epsilon = 1e-12);
        }
        assert_abs_diff_eq!(out.mode_probabilities[0], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn negative_or_nan_time_step_is_rejected() {
        let set = model_set(|_| {});
        let (x0, p0) = initial(&set);
        let mut imm = ImmEstimator::new(set, x0, p0).unwrap();
        assert!(matches!(imm.step(-0.1, None), Err(ImmError::InvalidTimeStep(_))));
        assert!(matches!(imm.step(f64::NAN, None), Err(ImmError::InvalidTimeStep(_))));
        assert!(imm.is_stale());
        assert_eq!(imm.cycles(), 0);
    }

    #[test]
    fn probabilities_sum_to_one_every_cycle() {
        let set = model_set(|_| {});
        let (x0, p0) = initial(&set);
        let mut imm = ImmEstimator::new(set.clone(), x0, p0).unwrap();
        for k in 0..20 {
            let t = k as f64 * 0.5;
            let meas = set
                .labeled_measurement(&[("pos_x", 10.0 + 2.0 * t), ("pos_y", -4.0 + t)])
                .unwrap();
            let m = (k % 3 != 0).then_some(&meas);
            let out = imm.step(0.5, m).unwrap();
            assert_abs_diff_eq!(out.mode_probabilities.sum(), 1.0, epsilon = 1e-12);
            assert!(out.mode_probabilities.iter().all(|p| (0.0..=1.0).contains(p)));
        }
        assert_eq!(imm.cycles(), 20);
    }

    #[test]
    fn dimension_mismatch_aborts_cycle_without_state_change() {
        let set = model_set(|_| {});
        let (x0, p0) = initial(&set);
        let mut imm = ImmEstimator::new(set, x0, p0).unwrap();
        imm.step(1.0, None).unwrap();
        let before = imm.output();
        let before_models: Vec<DVec> = imm.model_states().iter().map(|f| f.state().clone()).collect();

        let bad = Measurement::new(DVec::from_vec(vec![1.0, 2.0]));
        let err = imm.step(1.0, Some(&bad)).unwrap_err();
        match err {
            ImmError::DimensionMismatch { context, .. } => assert!(context.contains("model 'KF'"), "{context}"),
            other => panic!("unexpected error {other:?}"),
        }

        let after = imm.output();
        assert_eq!(after.state, before.state);
        assert_eq!(after.covariance, before.covariance);
        assert_eq!(after.mode_probabilities, before.mode_probabilities);
        assert!(after.stale);
        for (f, x) in imm.model_states().iter().zip(&before_models) {
            assert_eq!(f.state(), x);
        }
        assert_eq!(imm.cycles(), 1);

        // next good cycle clears the flag
        let out = imm.step(1.0, None).unwrap();
        assert!(!out.stale);
    }

    #[test]
    fn singular_innovation_marks_estimate_stale() {
        let set = model_set(|_| {});
        let (x0, _) = initial(&set);
        let mut imm = ImmEstimator::new(set, x0, DMat::zeros(6, 6)).unwrap();
        let meas = Measurement::new(DVec::zeros(6)).with_noise(DMat::zeros(6, 6));
        let err = imm.step(0.0, Some(&meas)).unwrap_err();
        assert!(matches!(err, ImmError::Numerical { .. }), "got {err:?}");
        assert!(imm.output().stale);
    }

    #[test]
    fn non_finite_fix_keeps_last_estimate() {
        let set = model_set(|_| {});
        let (x0, p0) = initial(&set);
        let mut imm = ImmEstimator::new(set.clone(), x0, p0).unwrap();
        imm.step(1.0, None).unwrap();
        let before = imm.output();

        let bad = Measurement::new(DVec::from_vec(vec![f64::NAN, 0.0, 0.0, 1.0, 0.0, 0.0]));
        let err = imm.step(1.0, Some(&bad)).unwrap_err();
        assert!(matches!(err, ImmError::Numerical { .. }), "got {err:?}");
        let (x, p) = imm.estimate();
        assert_eq!(x, &before.state);
        assert_eq!(p, &before.covariance);
        assert!(imm.is_stale());

        // estimator still usable
        let meas = set.labeled_measurement(&[("pos_x", 14.0), ("pos_y", -2.0)]).unwrap();
        let out = imm.step(1.0, Some(&meas)).unwrap();
        assert!(!out.stale);
        assert!(out.state.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn prior_is_reported_before_the_update() {
        let set = model_set(|_| {});
        let (x0, p0) = initial(&set);
        let mut imm = ImmEstimator::new(set.clone(), x0, p0).unwrap();

        let out = imm.step(1.0, None).unwrap();
        for i in 0..6 {
            assert_abs_diff_eq!(out.prior_state[i], out.state[i], epsilon = 1e-12);
            for j in 0..6 {
                assert_abs_diff_eq!(out.prior_covariance[(i, j)], out.covariance[(i, j)], epsilon = 1e-9);
            }
        }

        let meas = set.labeled_measurement(&[("pos_x", 20.0), ("pos_y", 0.0)]).unwrap();
        let out = imm.step(1.0, Some(&meas)).unwrap();
        assert!((out.prior_state[0] - out.state[0]).abs() > 1e-3);
        assert!(out.covariance[(0, 0)] < out.prior_covariance[(0, 0)]);
        assert_eq!(imm.prior_estimate().0, &out.prior_state);
    }

    #[test]
    fn invalid_initial_estimate_is_rejected() {
        let set = model_set(|_| {});
        assert!(matches!(
            ImmEstimator::new(set.clone(), DVec::zeros(4), DMat::identity(6, 6)),
            Err(ImmError::DimensionMismatch { .. })
        ));
        let mut p = DMat::identity(6, 6);
        p[(0, 0)] = -1.0;
        assert!(ImmEstimator::new(set, DVec::zeros(6), p).is_err());
    }

    #[test]
    fn dominant_model_follows_probabilities() {
        let set = model_set(|c| c.mode_probabilities = vec![0.3.into(), 0.7.into()]);
        let (x0, p0) = initial(&set);
        let imm = ImmEstimator::new(set, x0, p0).unwrap();
        assert_eq!(imm.dominant_model(), "KF1");
    }
}
