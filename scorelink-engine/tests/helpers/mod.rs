//! Shared fixtures for scorelink-engine integration tests
#![allow(dead_code)]

use scorelink_common::config::{RetrySettings, StageSettings, TomlConfig};
use std::path::PathBuf;
use tempfile::TempDir;

/// Nine notes at 120 bpm: a three-note E4 tie (beats 2-4), A4 played 60 ms
/// late and B4 never played
pub const SCENARIO_SCORE: &str = r#"{
    "tempo_map": [{"beat": 0.0, "bpm": 120.0}],
    "coordinate_transform": {"units": "px", "scale": 1.0},
    "notes": [
        {"part_id": "P1", "measure": 1, "pitch": "C", "octave": 4, "beat_position": 0.0, "notated_duration": 1.0, "tie_state": "none"},
        {"part_id": "P1", "measure": 1, "pitch": "D", "octave": 4, "beat_position": 1.0, "notated_duration": 1.0, "tie_state": "none"},
        {"part_id": "P1", "measure": 1, "pitch": "E", "octave": 4, "beat_position": 2.0, "notated_duration": 1.0, "tie_state": "start"},
        {"part_id": "P1", "measure": 1, "pitch": "E", "octave": 4, "beat_position": 3.0, "notated_duration": 1.0, "tie_state": "continue"},
        {"part_id": "P1", "measure": 2, "pitch": "E", "octave": 4, "beat_position": 4.0, "notated_duration": 1.0, "tie_state": "stop"},
        {"part_id": "P1", "measure": 2, "pitch": "F", "octave": 4, "beat_position": 5.0, "notated_duration": 1.0, "tie_state": "none"},
        {"part_id": "P1", "measure": 2, "pitch": "G", "octave": 4, "beat_position": 6.0, "notated_duration": 1.0, "tie_state": "none"},
        {"part_id": "P1", "measure": 2, "pitch": "A", "octave": 4, "beat_position": 7.0, "notated_duration": 1.0, "tie_state": "none"},
        {"part_id": "P1", "measure": 3, "pitch": "B", "octave": 4, "beat_position": 8.0, "notated_duration": 1.0, "tie_state": "none"}
    ]
}"#;

/// Six performed notes for [`SCENARIO_SCORE`], given in ticks (480 per quarter)
/// except for the late A4
pub const SCENARIO_PERFORMANCE: &str = r#"{
    "ticks_per_quarter": 480,
    "tempo_map": [{"beat": 0.0, "bpm": 120.0}],
    "notes": [
        {"pitch": 60, "velocity": 90, "start_tick": 0, "end_tick": 480},
        {"pitch": 62, "velocity": 90, "start_tick": 480, "end_tick": 960},
        {"pitch": 64, "velocity": 90, "start_time_abs": 1.0, "end_time_abs": 2.5},
        {"pitch": 65, "velocity": 90, "start_time_abs": 2.52, "end_time_abs": 3.0},
        {"pitch": 67, "velocity": 90, "start_tick": 2880, "end_tick": 3360},
        {"pitch": 69, "velocity": 90, "start_time_abs": 3.56, "end_time_abs": 4.0}
    ]
}"#;

pub struct Workspace {
    pub dir: TempDir,
    pub score: PathBuf,
    pub performance: PathBuf,
    pub output_dir: PathBuf,
}

impl Workspace {
    /// Path inside the temp dir, outside the output directory
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

/// Temp dir holding the scenario documents and an output directory path
pub fn scenario_workspace() -> Workspace {
    let dir = TempDir::new().unwrap();
    let score = dir.path().join("score.json");
    let performance = dir.path().join("performance.json");
    std::fs::write(&score, SCENARIO_SCORE).unwrap();
    std::fs::write(&performance, SCENARIO_PERFORMANCE).unwrap();
    let output_dir = dir.path().join("out");

    Workspace {
        dir,
        score,
        performance,
        output_dir,
    }
}

/// Default configuration with millisecond retry backoff
pub fn fast_config() -> TomlConfig {
    let mut config = TomlConfig::default();
    config.pipeline.retry = RetrySettings {
        max_attempts: 2,
        base_delay_ms: 5,
        multiplier: 2.0,
        max_delay_ms: 10,
    };
    config
}

pub fn stage(command: &[&str], outputs: &[&str]) -> StageSettings {
    StageSettings {
        command: command.iter().map(|s| s.to_string()).collect(),
        outputs: outputs.iter().map(|s| s.to_string()).collect(),
        ..StageSettings::default()
    }
}

/// `sh -c` stages for the visual branch: coordinates, note_images, composite
pub fn visual_stages(config: &mut TomlConfig) {
    config.stages.insert(
        "coordinates".to_string(),
        stage(
            &["sh", "-c", "cat \"$0\" > \"$1\"", "{snapshot}", "{stage_dir}/coordinates.json"],
            &["{stage_dir}/coordinates.json"],
        ),
    );
    config.stages.insert(
        "note_images".to_string(),
        stage(
            &["sh", "-c", "echo \"$1 $2\" > \"$0\"", "{stage_dir}/{id}.svg", "{midi}", "{onset}"],
            &[],
        ),
    );
    config.stages.insert(
        "composite".to_string(),
        stage(
            &["sh", "-c", "ls \"$0\" > \"$1\"", "{input:note_images}", "{stage_dir}/composite.png"],
            &["{stage_dir}/composite.png"],
        ),
    );
}
