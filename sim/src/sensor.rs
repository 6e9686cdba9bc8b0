//! Position sensor simulator.
//!
//! Produces Cartesian position fixes with:
//! - Gaussian position noise
//! - Miss probability (1 - P_D)

use crate::target::Target;
use imm_core::{ImmResult, Measurement, ModelSet};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use rand_distr::Normal;
use serde::{Deserialize, Serialize};

/// Static sensor characteristics.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorParams {
    /// Position noise std dev per axis (m)
    pub noise_std: f64,
    /// Probability of detection per scan
    pub p_detection: f64,
}

impl Default for SensorParams {
    fn default() -> Self {
        Self {
            noise_std: 1.0,
            p_detection: 1.0,
        }
    }
}

/// One noisy position report.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionFix {
    pub time: f64,
    pub x: f64,
    pub y: f64,
    /// Noise std dev the fix was drawn with
    pub noise_std: f64,
}

impl PositionFix {
    /// Measurement over the fused labels `pos_x`, `pos_y`, judged by each
    /// model's own observation noise.
    pub fn to_measurement(&self, models: &ModelSet) -> ImmResult<Measurement> {
        models.labeled_measurement(&[("pos_x", self.x), ("pos_y", self.y)])
    }
}

/// Generates position fixes from a target.
pub struct PositionSensor {
    pub params: SensorParams,
    noise: Normal<f64>,
    rng: ChaCha8Rng,
}

impl PositionSensor {
    pub fn new(params: SensorParams, seed: u64) -> anyhow::Result<Self> {
        anyhow::ensure!(
            (0.0..=1.0).contains(&params.p_detection),
            "detection probability {} outside [0, 1]",
            params.p_detection
        );
        let noise = Normal::new(0.0, params.noise_std)?;
        Ok(Self {
            params,
            noise,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }

    /// Observe `target` at `time`; `None` on a missed detection.
    pub fn observe(&mut self, target: &Target, time: f64) -> Option<PositionFix> {
        // Miss detection?
        if self.rng.gen::<f64>() >= self.params.p_detection {
            return None;
        }
        let (x, y) = target.pos_2d();
        Some(PositionFix {
            time,
            x: x + self.noise.sample(&mut self.rng),
            y: y + self.noise.sample(&mut self.rng),
            noise_std: self.params.noise_std,
        })
    }
}
