//! `sim`: target trajectories, position fixes and replay logs.

pub mod replay;
pub mod scenarios;
pub mod sensor;
pub mod target;

pub use replay::{load_replay, save_replay, ReplayFrame, ReplayLog};
pub use scenarios::{Scenario, ScenarioKind};
pub use sensor::{PositionFix, PositionSensor, SensorParams};
pub use target::{fused_truth, MotionSpec, Target};
