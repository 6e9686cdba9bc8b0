//! Mode probability tracker.
//!
//! Holds the Markov switching matrix `Π` (row `i` = from model `i`) and the
//! mode probabilities `μ`.
//!
//! - predicted:  c_j = Σ_i Π[i][j]·μ[i]
//! - mixing:     W[i][j] = Π[i][j]·μ[i] / c_j
//! - posterior:  μ'_j ∝ L_j·c_j

use crate::{
    error::{ImmError, ImmResult},
    kf::LIKELIHOOD_FLOOR,
    types::{DMat, DVec},
};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// How the last posterior was obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbabilityUpdate {
    /// Regular Bayesian update.
    Bayes,
    /// Likelihoods carried no usable information; μ is the predicted `c`.
    Fallback,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModeProbabilities {
    transition: DMat,
    probabilities: DVec,
    epsilon: f64,
}

impl ModeProbabilities {
    /// Shapes are checked here; stochasticity is validated when the
    /// configuration is loaded.
    pub fn new(transition: DMat, probabilities: DVec, epsilon: f64) -> ImmResult<Self> {
        let k = probabilities.len();
        if k == 0 {
            return Err(ImmError::config("at least one mode is required"));
        }
        if transition.nrows() != k || transition.ncols() != k {
            return Err(ImmError::mismatch(
                "markov transition matrix",
                k,
                if transition.nrows() != k { transition.nrows() } else { transition.ncols() },
            ));
        }
        Ok(Self {
            transition,
            probabilities,
            epsilon,
        })
    }

    pub fn len(&self) -> usize {
        self.probabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probabilities.is_empty()
    }

    pub fn transition(&self) -> &DMat {
        &self.transition
    }

    pub fn probabilities(&self) -> &DVec {
        &self.probabilities
    }

    /// `c = Πᵀ μ`
    pub fn predicted(&self) -> DVec {
        self.transition.tr_mul(&self.probabilities)
    }

    /// Column `j` holds the weights of every model `i` in the mixed prior of
    /// model `j`.
    pub fn mixing_weights(&self) -> ImmResult<DMat> {
        let c = self.predicted();
        if let Some((j, cj)) = c.iter().enumerate().find(|(_, cj)| !(**cj >= self.epsilon)) {
            return Err(ImmError::numerical(
                "mixing weights",
                format!("predicted probability of model {j} is {cj:e}"),
            ));
        }
        let k = self.len();
        Ok(DMat::from_fn(k, k, |i, j| {
            self.transition[(i, j)] * self.probabilities[i] / c[j]
        }))
    }

    /// Posterior update from per-model likelihoods.
    ///
    /// When every likelihood sits at the underflow floor, or the normalizer
    /// is not a usable positive number, μ becomes the predicted `c`.
    pub fn update(&mut self, likelihoods: &[f64]) -> ImmResult<ProbabilityUpdate> {
        let k = self.len();
        if likelihoods.len() != k {
            return Err(ImmError::mismatch("likelihoods", k, likelihoods.len()));
        }
        let c = self.predicted();

        let all_underflow = likelihoods.iter().all(|l| *l <= LIKELIHOOD_FLOOR);
        let weighted = DVec::from_fn(k, |j, _| likelihoods[j] * c[j]);
        let total = weighted.sum();

        if all_underflow || !total.is_finite() || !(total > self.epsilon) {
            warn!(total, all_underflow, "mode likelihoods unusable, keeping predicted probabilities");
            self.probabilities = normalized(c);
            return Ok(ProbabilityUpdate::Fallback);
        }

        self.probabilities = weighted / total;
        Ok(ProbabilityUpdate::Bayes)
    }

    /// μ ← c (cycle without a measurement).
    pub fn propagate(&mut self) {
        self.probabilities = normalized(self.predicted());
    }
}

fn normalized(v: DVec) -> DVec {
    let sum = v.sum();
    if sum > 0.0 && sum.is_finite() {
        v / sum
    } else {
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn tracker(mu: [f64; 2]) -> ModeProbabilities {
        let pi = DMat::from_row_slice(2, 2, &[0.95, 0.05, 0.05, 0.95]);
        ModeProbabilities::new(pi, DVec::from_vec(mu.to_vec()), 1e-300).unwrap()
    }

    #[test]
    fn predicted_and_mixing_weights() {
        let t = tracker([0.8, 0.2]);
        let c = t.predicted();
        assert_abs_diff_eq!(c[0], 0.77, epsilon = 1e-12);
        assert_abs_diff_eq!(c[1], 0.23, epsilon = 1e-12);

        let w = t.mixing_weights().unwrap();
        assert_abs_diff_eq!(w[(0, 0)], 0.76 / 0.77, epsilon = 1e-12);
        assert_abs_diff_eq!(w[(1, 1)], 0.19 / 0.23, epsilon = 1e-12);
        for j in 0..2 {
            assert_abs_diff_eq!(w.column(j).sum(), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn posterior_is_normalized_and_follows_likelihoods() {
        let mut t = tracker([0.5, 0.5]);
        let outcome = t.update(&[0.9, 0.1]).unwrap();
        assert_eq!(outcome, ProbabilityUpdate::Bayes);
        assert_abs_diff_eq!(t.probabilities().sum(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(t.probabilities()[0], 0.9, epsilon = 1e-12);
    }

    #[test]
    fn all_underflow_keeps_predicted() {
        let mut t = tracker([0.8, 0.2]);
        let c = t.predicted();
        let outcome = t.update(&[LIKELIHOOD_FLOOR, LIKELIHOOD_FLOOR]).unwrap();
        assert_eq!(outcome, ProbabilityUpdate::Fallback);
        assert_abs_diff_eq!(t.probabilities()[0], c[0], epsilon = 1e-15);
        assert_abs_diff_eq!(t.probabilities()[1], c[1], epsilon = 1e-15);
    }

    #[test]
    fn single_informative_likelihood_still_updates() {
        let mut t = tracker([0.5, 0.5]);
        assert_eq!(t.update(&[LIKELIHOOD_FLOOR, 1e-3]).unwrap(), ProbabilityUpdate::Bayes);
        assert!(t.probabilities()[1] > 0.999);
    }

    #[test]
    fn non_finite_normalizer_falls_back() {
        let mut t = tracker([0.5, 0.5]);
        assert_eq!(t.update(&[f64::NAN, 1.0]).unwrap(), ProbabilityUpdate::Fallback);
        assert_abs_diff_eq!(t.probabilities().sum(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn wrong_likelihood_count_is_rejected() {
        let mut t = tracker([0.5, 0.5]);
        assert!(matches!(
            t.update(&[1.0]),
            Err(ImmError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn vanishing_predicted_probability_is_numerical_error() {
        let pi = DMat::identity(2, 2);
        let t = ModeProbabilities::new(pi, DVec::from_vec(vec![1.0, 0.0]), 1e-300).unwrap();
        assert!(matches!(t.mixing_weights(), Err(ImmError::Numerical { .. })));
    }

    #[test]
    fn propagate_converges_to_stationary() {
        let mut t = tracker([1.0, 0.0]);
        for _ in 0..500 {
            t.propagate();
        }
        assert_abs_diff_eq!(t.probabilities()[0], 0.5, epsilon = 1e-9);
    }
}
