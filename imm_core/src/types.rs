//! Fundamental types used across the workspace.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Scalar type: f64 throughout. Model dimensions are configuration-declared,
// so every vector and matrix is dynamically sized.
// ---------------------------------------------------------------------------

/// Dynamic-size vector (states, measurements, innovations)
pub type DVec = DVector<f64>;

/// Dynamic-size matrix (F, Q, H, R, B, covariances, projections)
pub type DMat = DMatrix<f64>;

// ---------------------------------------------------------------------------
// Measurement
// ---------------------------------------------------------------------------

/// One externally supplied measurement for the current cycle.
///
/// `z` lives in the observation space of the models' own `H`. When
/// `observation` is set it replaces every model's `H` and is expressed over
/// the fused state (`m × N`); reduced models receive it projected into their
/// native space. When `noise` is set it replaces every model's `R`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub z: DVec,
    #[serde(default)]
    pub observation: Option<DMat>,
    #[serde(default)]
    pub noise: Option<DMat>,
}

impl Measurement {
    /// Measurement that uses each model's own `H` and `R`.
    pub fn new(z: DVec) -> Self {
        Self {
            z,
            observation: None,
            noise: None,
        }
    }

    pub fn with_observation(mut self, h: DMat) -> Self {
        self.observation = Some(h);
        self
    }

    pub fn with_noise(mut self, r: DMat) -> Self {
        self.noise = Some(r);
        self
    }

    /// Dimension of the observation vector
    pub fn dim(&self) -> usize {
        self.z.len()
    }
}
