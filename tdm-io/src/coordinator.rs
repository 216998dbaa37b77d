//! Feature Coordinator
//!
//! Mutual exclusion between whole-system phases and per-subsystem I/O.
//!
//! Two locks cooperate:
//! - `phase_gate` serializes phases, so at most one is current at a time
//! - `io_lock` is shared by every I/O operation and taken exclusively only
//!   by `Phase::Shutdown`
//!
//! Stop and reset phases do not hold `io_lock`. New shared I/O that starts
//! while one of them is current passes a barrier (acquire-then-release of
//! the exclusive side) before proceeding, which lets already-running I/O
//! drain without serializing unrelated I/O against each other.

use crate::tracker::CompletionTracker;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tdm_common::events::Phase;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::{debug, info};

pub struct FeatureCoordinator {
    io_lock: RwLock<()>,
    phase_gate: AsyncMutex<()>,
    current: Mutex<Option<Phase>>,
    tracker: Arc<CompletionTracker>,
}

impl FeatureCoordinator {
    pub fn new(tracker: Arc<CompletionTracker>) -> Self {
        Self {
            io_lock: RwLock::new(()),
            phase_gate: AsyncMutex::new(()),
            current: Mutex::new(None),
            tracker,
        }
    }

    pub fn tracker(&self) -> &Arc<CompletionTracker> {
        &self.tracker
    }

    pub fn current_phase(&self) -> Option<Phase> {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// True exactly while `Phase::Shutdown` is current
    pub fn is_shutting_down(&self) -> bool {
        self.current_phase() == Some(Phase::Shutdown)
    }

    /// Run `operation` as the current phase
    ///
    /// Waits for any other phase to finish, records `phase`, waits for
    /// subsystem quiescence, runs the operation, then clears the phase.
    /// `Phase::Shutdown` additionally holds the I/O lock exclusively for the
    /// whole run, so no shared I/O overlaps it.
    pub async fn run_exclusive_phase<F, Fut, T>(&self, phase: Phase, operation: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _gate = self.phase_gate.lock().await;

        let _exclusive = if phase.is_hard_exclusive() {
            Some(self.io_lock.write().await)
        } else {
            None
        };

        let _current = CurrentPhase::enter(&self.current, phase);
        info!("Phase {} started", phase);

        self.tracker.wait_for_quiescence().await;
        let result = operation().await;

        info!("Phase {} finished", phase);
        result
    }

    /// Run `operation` as shared I/O for subsystem `name`
    ///
    /// Blocks only while shutdown holds the I/O lock. If another phase is
    /// current, passes the exclusive barrier once before proceeding.
    pub async fn run_shared_io<F, Fut, T>(&self, name: &str, operation: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mut shared = self.io_lock.read().await;

        if let Some(phase) = self.current_phase() {
            debug!("{} I/O waiting at barrier for phase {}", name, phase);
            drop(shared);
            drop(self.io_lock.write().await);
            shared = self.io_lock.read().await;
        }

        let result = operation().await;
        drop(shared);
        result
    }
}

/// Records a phase as current and clears it on drop
struct CurrentPhase<'a> {
    slot: &'a Mutex<Option<Phase>>,
}

impl<'a> CurrentPhase<'a> {
    fn enter(slot: &'a Mutex<Option<Phase>>, phase: Phase) -> Self {
        *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(phase);
        Self { slot }
    }
}

impl Drop for CurrentPhase<'_> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}
