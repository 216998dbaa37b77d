//! Completion handles for submitted saves

use serde::Serialize;
use tdm_common::{Error, Result};
use tokio::task::JoinHandle;

/// Why a save finished without touching the disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Training stopped and no user-data override was active
    Blocked,
    /// Identical content was written within the dedupe window
    Duplicate,
    /// Model archive written too recently
    ModelDebounce,
    /// A newer save of the same file was written first
    Superseded,
    /// Cancelled while queued
    Cancelled,
    /// Pool closed by shutdown
    ShutDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum SaveOutcome {
    Written { bytes: u64 },
    Skipped(SkipReason),
}

impl SaveOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, SaveOutcome::Written { .. })
    }
}

enum HandleState {
    Ready(Result<SaveOutcome>),
    Pending(JoinHandle<Result<SaveOutcome>>),
}

/// Resolves when a save has been written or definitively skipped
///
/// Dropping the handle does not cancel the save.
#[must_use = "drop the handle explicitly to fire and forget"]
pub struct SaveHandle {
    state: HandleState,
}

impl SaveHandle {
    pub(crate) fn ready(outcome: SaveOutcome) -> Self {
        Self {
            state: HandleState::Ready(Ok(outcome)),
        }
    }

    pub(crate) fn failed(err: Error) -> Self {
        Self {
            state: HandleState::Ready(Err(err)),
        }
    }

    pub(crate) fn pending(task: JoinHandle<Result<SaveOutcome>>) -> Self {
        Self {
            state: HandleState::Pending(task),
        }
    }

    pub fn is_finished(&self) -> bool {
        match &self.state {
            HandleState::Ready(_) => true,
            HandleState::Pending(task) => task.is_finished(),
        }
    }

    pub async fn wait(self) -> Result<SaveOutcome> {
        match self.state {
            HandleState::Ready(outcome) => outcome,
            HandleState::Pending(task) => task.await.map_err(|e| {
                if e.is_cancelled() {
                    Error::Cancelled("save task aborted before it finished".to_string())
                } else {
                    Error::Internal(format!("save task failed: {}", e))
                }
            })?,
        }
    }
}

impl std::fmt::Debug for SaveHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaveHandle")
            .field("finished", &self.is_finished())
            .finish()
    }
}
