//! Replay: serialize/deserialize simulation logs for offline analysis.

use crate::{sensor::PositionFix, target::fused_truth};
use imm_core::{DVec, ImmResult, Measurement, ModelSet};
use serde::{Deserialize, Serialize};
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// A full recorded simulation log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplayLog {
    pub scenario_name: String,
    pub seed: u64,
    pub sim_dt: f64,
    pub duration: f64,
    /// One frame per sensor scan, in chronological order
    pub frames: Vec<ReplayFrame>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplayFrame {
    pub time: f64,
    /// True state [px, vx, ax, py, vy, ay]
    pub truth: [f64; 6],
    /// `None` on a missed detection
    pub fix: Option<PositionFix>,
}

impl ReplayFrame {
    pub fn measurement(&self, models: &ModelSet) -> ImmResult<Option<Measurement>> {
        self.fix.as_ref().map(|f| f.to_measurement(models)).transpose()
    }

    pub fn fused_truth(&self, models: &ModelSet) -> ImmResult<DVec> {
        fused_truth(models, &self.truth)
    }
}

impl ReplayLog {
    /// First frame that carries a fix.
    pub fn first_fix(&self) -> Option<&PositionFix> {
        self.frames.iter().find_map(|f| f.fix.as_ref())
    }
}

/// Save a replay log to a JSON file.
pub fn save_replay(log: &ReplayLog, path: &Path) -> anyhow::Result<()> {
    let file = std::fs::File::create(path)?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, log)?;
    Ok(())
}

/// Load a replay log from a JSON file.
pub fn load_replay(path: &Path) -> anyhow::Result<ReplayLog> {
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);
    let log: ReplayLog = serde_json::from_reader(reader)?;
    Ok(log)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenarios::{Scenario, ScenarioKind};
    use approx::assert_abs_diff_eq;

    const TWO_MODELS: &str = include_str!("../../configs/imm_two_models.json");

    #[test]
    fn replay_survives_a_file_round_trip() {
        let log = Scenario::build(ScenarioKind::Dropout, 3).record().unwrap();
        let path = std::env::temp_dir().join(format!("immtrack_replay_{}.json", std::process::id()));
        save_replay(&log, &path).unwrap();
        let loaded = load_replay(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.scenario_name, log.scenario_name);
        assert_eq!(loaded.frames.len(), log.frames.len());
        for (a, b) in loaded.frames.iter().zip(&log.frames) {
            assert_eq!(a.fix.is_some(), b.fix.is_some());
            assert_abs_diff_eq!(a.truth[0], b.truth[0], epsilon = 1e-9);
        }
    }

    #[test]
    fn frames_map_onto_fused_labels() {
        let models = ModelSet::from_json_str(TWO_MODELS).unwrap();
        let log = Scenario::build(ScenarioKind::Cruise, 1).record().unwrap();
        let frame = &log.frames[0];

        let meas = frame.measurement(&models).unwrap().unwrap();
        let fix = frame.fix.as_ref().unwrap();
        assert_eq!(meas.z.len(), 6);
        assert_eq!(meas.z[0], fix.x);
        assert_eq!(meas.z[3], fix.y);

        let truth = frame.fused_truth(&models).unwrap();
        assert_abs_diff_eq!(truth[0], 10.0, epsilon = 1e-12);
        assert_abs_diff_eq!(truth[4], 5.0, epsilon = 1e-12);
        assert_eq!(log.first_fix(), Some(fix));
    }
}
