//! Error taxonomy for the estimator.
//!
//! Configuration problems are fatal and surface at load time. Dimension and
//! numerical problems abort a single cycle; the estimator keeps its
//! last-known-good estimate and flags it as stale.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ImmError {
    /// Malformed or inconsistent static configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Measurement, matrix or projection dimensions disagree.
    #[error("dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    /// Singular inversion or degenerate normalization.
    #[error("numerical error in {context}: {reason}")]
    Numerical { context: String, reason: String },

    #[error("invalid time step {0}: must be finite and non-negative")]
    InvalidTimeStep(f64),

    #[error("unknown state label '{0}'")]
    UnknownLabel(String),
}

impl ImmError {
    pub fn config(msg: impl Into<String>) -> Self {
        ImmError::Configuration(msg.into())
    }

    pub fn mismatch(context: impl Into<String>, expected: usize, actual: usize) -> Self {
        ImmError::DimensionMismatch {
            context: context.into(),
            expected,
            actual,
        }
    }

    pub fn numerical(context: impl Into<String>, reason: impl Into<String>) -> Self {
        ImmError::Numerical {
            context: context.into(),
            reason: reason.into(),
        }
    }

    /// Prefix the context of a cycle error with the model it came from.
    pub fn in_model(self, model: &str) -> Self {
        match self {
            ImmError::DimensionMismatch {
                context,
                expected,
                actual,
            } => ImmError::DimensionMismatch {
                context: format!("model '{model}': {context}"),
                expected,
                actual,
            },
            ImmError::Numerical { context, reason } => ImmError::Numerical {
                context: format!("model '{model}': {context}"),
                reason,
            },
            other => other,
        }
    }
}

pub type ImmResult<T> = Result<T, ImmError>;
