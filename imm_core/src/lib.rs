//! `imm_core`: Interacting Multiple Model Kalman filter bank.
//!
//! # Module layout
//! - [`types`]: Vector / matrix aliases and the measurement record
//! - [`error`]: Error taxonomy
//! - [`linalg`]: Checked inversion, symmetry/PSD checks, Gaussian density
//! - [`expr`]: Symbolic matrix entries (`dt**2/2`, parameters)
//! - [`config`]: Configuration record, validation, compiled model set
//! - [`kf`]: Kalman filter (predict / update) per model
//! - [`projection`]: Native ↔ fused space adapter
//! - [`mode`]: Markov switching and mode probabilities
//! - [`imm`]: The IMM cycle
//! - [`metrics`]: RMSE and NEES against ground truth

pub mod config;
pub mod error;
pub mod expr;
pub mod imm;
pub mod kf;
pub mod linalg;
pub mod metrics;
pub mod mode;
pub mod projection;
pub mod types;

pub use config::{EstimatorSettings, ImmConfig, ModelSet};
pub use error::{ImmError, ImmResult};
pub use imm::{ImmEstimator, ImmOutput};
pub use kf::{FilterType, KalmanFilter, LinearModel, ModelFilter};
pub use metrics::EstimationMetrics;
pub use mode::{ModeProbabilities, ProbabilityUpdate};
pub use projection::{CovarianceExpansion, SpaceAdapter};
pub use types::{DMat, DVec, Measurement};
