//! Lifecycle phase type shared between the coordinator and event consumers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Whole-system event that runs as a coordinated phase
///
/// At most one phase is current at any instant. `Shutdown` additionally
/// excludes all shared I/O for its duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Startup,
    Shutdown,
    TrainingStopSave,
    GameResetSave,
    UiReadState,
}

impl Phase {
    /// Only shutdown takes the coordinator lock exclusively
    pub fn is_hard_exclusive(self) -> bool {
        matches!(self, Phase::Shutdown)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Startup => "STARTUP",
            Phase::Shutdown => "SHUTDOWN",
            Phase::TrainingStopSave => "TRAINING_STOP_SAVE",
            Phase::GameResetSave => "GAME_RESET_SAVE",
            Phase::UiReadState => "UI_READ_STATE",
        };
        f.write_str(s)
    }
}
