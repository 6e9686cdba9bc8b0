//! Estimation metrics: RMSE position/velocity and average NEES against
//! ground truth.

use crate::{
    config::ModelSet,
    error::{ImmError, ImmResult},
    linalg::invert,
    types::{DMat, DVec},
};
use serde::{Deserialize, Serialize};

/// Accumulated metric statistics.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EstimationMetrics {
    /// Fused indices of the position components
    pub position: Vec<usize>,
    /// Fused indices of the velocity components
    pub velocity: Vec<usize>,
    /// Number of estimates evaluated
    pub n_samples: u64,
    /// Sum of squared position errors (for RMSE)
    pub sum_sq_pos_err: f64,
    /// Sum of squared velocity errors (for RMSE)
    pub sum_sq_vel_err: f64,
    /// Sum of normalized estimation error squared over position + velocity
    pub sum_nees: f64,
    /// Samples whose covariance block could be inverted
    pub n_nees: u64,
}

impl EstimationMetrics {
    pub fn new(position: Vec<usize>, velocity: Vec<usize>) -> Self {
        Self {
            position,
            velocity,
            ..Default::default()
        }
    }

    /// Resolve position and velocity components by state label.
    pub fn from_labels(models: &ModelSet, position: &[&str], velocity: &[&str]) -> ImmResult<Self> {
        let resolve = |labels: &[&str]| {
            labels
                .iter()
                .map(|l| models.state_index(l))
                .collect::<ImmResult<Vec<usize>>>()
        };
        Ok(Self::new(resolve(position)?, resolve(velocity)?))
    }

    /// Root-mean-square position error.
    pub fn rmse_position(&self) -> f64 {
        if self.n_samples == 0 {
            return 0.0;
        }
        (self.sum_sq_pos_err / self.n_samples as f64).sqrt()
    }

    /// Root-mean-square velocity error.
    pub fn rmse_velocity(&self) -> f64 {
        if self.n_samples == 0 {
            return 0.0;
        }
        (self.sum_sq_vel_err / self.n_samples as f64).sqrt()
    }

    /// Average NEES; consistent estimators sit near the number of components.
    pub fn mean_nees(&self) -> f64 {
        if self.n_nees == 0 {
            return 0.0;
        }
        self.sum_nees / self.n_nees as f64
    }

    /// Accumulate one fused estimate against the true fused state.
    pub fn accumulate(&mut self, state: &DVec, cov: &DMat, truth: &DVec) -> ImmResult<()> {
        let n = state.len();
        if truth.len() != n {
            return Err(ImmError::mismatch("ground truth", n, truth.len()));
        }
        if let Some(&bad) = self.position.iter().chain(&self.velocity).find(|&&i| i >= n) {
            return Err(ImmError::mismatch("metric component index bound", n, bad));
        }

        let err = state - truth;
        let sq = |idx: &[usize]| idx.iter().map(|&i| err[i] * err[i]).sum::<f64>();
        self.sum_sq_pos_err += sq(&self.position);
        self.sum_sq_vel_err += sq(&self.velocity);
        self.n_samples += 1;

        let idx: Vec<usize> = self.position.iter().chain(&self.velocity).copied().collect();
        let e = err.select_rows(idx.iter());
        let p = cov.select_rows(idx.iter()).select_columns(idx.iter());
        if let Ok(p_inv) = invert(&p, 1e-12, "metric covariance") {
            self.sum_nees += (e.transpose() * p_inv * &e)[(0, 0)];
            self.n_nees += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn rmse_and_nees() {
        let mut m = EstimationMetrics::new(vec![0, 2], vec![1, 3]);
        let truth = DVec::zeros(4);
        let cov = DMat::identity(4, 4) * 4.0;
        m.accumulate(&DVec::from_vec(vec![3.0, 1.0, 4.0, 0.0]), &cov, &truth).unwrap();
        m.accumulate(&DVec::from_vec(vec![0.0, 0.0, 0.0, 1.0]), &cov, &truth).unwrap();

        assert_abs_diff_eq!(m.rmse_position(), (25.0f64 / 2.0).sqrt(), epsilon = 1e-12);
        assert_abs_diff_eq!(m.rmse_velocity(), 1.0, epsilon = 1e-12);
        // (26 / 4 + 1 / 4) / 2
        assert_abs_diff_eq!(m.mean_nees(), 27.0 / 8.0, epsilon = 1e-12);
    }

    #[test]
    fn empty_metrics_are_zero() {
        let m = EstimationMetrics::new(vec![0], vec![1]);
        assert_eq!(m.rmse_position(), 0.0);
        assert_eq!(m.mean_nees(), 0.0);
    }

    #[test]
    fn mismatched_truth_is_rejected() {
        let mut m = EstimationMetrics::new(vec![0], vec![1]);
        assert!(m
            .accumulate(&DVec::zeros(2), &DMat::identity(2, 2), &DVec::zeros(3))
            .is_err());
    }
}
