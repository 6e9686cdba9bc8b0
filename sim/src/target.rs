//! Target trajectory models and state propagation.
//!
//! The target has a planar true state `[px, vx, ax, py, vy, ay]` and a
//! `MotionSpec` describing how it moves. The simulator steps it forward in
//! time.

use imm_core::{DVec, ImmResult, ModelSet};
use serde::{Deserialize, Serialize};

/// State labels of the true state, in order.
pub const TRUTH_LABELS: [&str; 6] = ["pos_x", "vel_x", "acc_x", "pos_y", "vel_y", "acc_y"];

/// Describes target motion between events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MotionSpec {
    /// Constant velocity: no acceleration.
    ConstantVelocity,
    /// Constant acceleration in m/s².
    ConstantAccel { ax: f64, ay: f64 },
    /// Constant-turn-rate. `omega` = yaw rate (rad/s).
    ConstantTurn { omega: f64 },
    /// Segmented: switch motion model at given sim times.
    /// `segments` is sorted by time ascending: [(t_start, MotionSpec), ...].
    /// The active spec is the last one whose t_start <= current_t.
    Segmented { segments: Vec<(f64, Box<MotionSpec>)> },
}

/// A simulated target with ground-truth state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// True state [px, vx, ax, py, vy, ay]
    pub state: [f64; 6],
    pub motion: MotionSpec,
}

impl Target {
    pub fn new(pos: [f64; 2], vel: [f64; 2], motion: MotionSpec) -> Self {
        Self {
            state: [pos[0], vel[0], 0.0, pos[1], vel[1], 0.0],
            motion,
        }
    }

    /// Propagate true state by `dt` seconds according to the motion spec.
    pub fn step(&mut self, t: f64, dt: f64) {
        self.state = propagate(self.state, &self.motion, t, dt);
    }

    /// 2D position
    pub fn pos_2d(&self) -> (f64, f64) {
        (self.state[0], self.state[3])
    }

    /// 2D velocity
    pub fn vel_2d(&self) -> (f64, f64) {
        (self.state[1], self.state[4])
    }
}

fn propagate(s: [f64; 6], motion: &MotionSpec, t: f64, dt: f64) -> [f64; 6] {
    let [px, vx, _, py, vy, _] = s;
    match motion {
        MotionSpec::ConstantVelocity => [px + vx * dt, vx, 0.0, py + vy * dt, vy, 0.0],
        MotionSpec::ConstantAccel { ax, ay } => [
            px + vx * dt + 0.5 * ax * dt * dt,
            vx + ax * dt,
            *ax,
            py + vy * dt + 0.5 * ay * dt * dt,
            vy + ay * dt,
            *ay,
        ],
        MotionSpec::ConstantTurn { omega } => {
            let v = (vx * vx + vy * vy).sqrt();
            let heading = vy.atan2(vx);
            let new_heading = heading + omega * dt;
            let (nvx, nvy) = (v * new_heading.cos(), v * new_heading.sin());
            // centripetal acceleration of the new velocity
            [
                px + v * heading.cos() * dt,
                nvx,
                -omega * nvy,
                py + v * heading.sin() * dt,
                nvy,
                omega * nvx,
            ]
        }
        MotionSpec::Segmented { segments } => {
            let active = segments.iter().filter(|(t_start, _)| *t_start <= t).last();
            match active {
                Some((_, spec)) => propagate(s, spec, t, dt),
                // Before first segment: CV
                None => propagate(s, &MotionSpec::ConstantVelocity, t, dt),
            }
        }
    }
}

/// True state laid out over the fused labels of `models`. Labels the
/// models do not carry are left out; fused labels without a true value
/// stay zero.
pub fn fused_truth(models: &ModelSet, state: &[f64; 6]) -> ImmResult<DVec> {
    let values: Vec<(&str, f64)> = TRUTH_LABELS
        .iter()
        .zip(state)
        .filter(|(label, _)| models.state_index(label).is_ok())
        .map(|(label, v)| (*label, *v))
        .collect();
    models.state_from_labels(&values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn constant_velocity_moves_linearly() {
        let mut t = Target::new([0.0, 0.0], [10.0, 5.0], MotionSpec::ConstantVelocity);
        for k in 0..10 {
            t.step(k as f64, 1.0);
        }
        assert_abs_diff_eq!(t.pos_2d().0, 100.0, epsilon = 1e-9);
        assert_abs_diff_eq!(t.pos_2d().1, 50.0, epsilon = 1e-9);
    }

    #[test]
    fn constant_accel_records_acceleration() {
        let mut t = Target::new([0.0, 0.0], [0.0, 0.0], MotionSpec::ConstantAccel { ax: 2.0, ay: -1.0 });
        t.step(0.0, 2.0);
        assert_abs_diff_eq!(t.state[0], 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(t.state[1], 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(t.state[2], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(t.state[5], -1.0, epsilon = 1e-12);
    }

    #[test]
    fn turn_keeps_speed() {
        let mut t = Target::new([0.0, 0.0], [30.0, 0.0], MotionSpec::ConstantTurn { omega: 0.1 });
        for k in 0..50 {
            t.step(k as f64 * 0.5, 0.5);
        }
        let (vx, vy) = t.vel_2d();
        assert_abs_diff_eq!((vx * vx + vy * vy).sqrt(), 30.0, epsilon = 1e-9);
    }

    #[test]
    fn segmented_switches_motion() {
        let motion = MotionSpec::Segmented {
            segments: vec![
                (0.0, Box::new(MotionSpec::ConstantVelocity)),
                (5.0, Box::new(MotionSpec::ConstantAccel { ax: 1.0, ay: 0.0 })),
            ],
        };
        let mut t = Target::new([0.0, 0.0], [1.0, 0.0], motion);
        for k in 0..10 {
            t.step(k as f64, 1.0);
        }
        // 5 s at 1 m/s, then 5 s accelerating at 1 m/s²
        assert_abs_diff_eq!(t.state[1], 6.0, epsilon = 1e-12);
        assert_abs_diff_eq!(t.state[0], 5.0 + 5.0 + 12.5, epsilon = 1e-12);
    }
}
