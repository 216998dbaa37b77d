//! Completion Tracker
//!
//! Per-subsystem active/idle register with a bounded quiescence wait.
//!
//! The set of tracked names is fixed at construction, so the flags are plain
//! atomics with no map lock on the hot path. Unknown names are ignored.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tdm_common::config::IoSettings;
use tdm_common::KNOWN_SUBSYSTEMS;
use tracing::{debug, warn};

/// Polling parameters for [`CompletionTracker::wait_for_quiescence`]
#[derive(Debug, Clone, Copy)]
pub struct QuiescenceConfig {
    pub poll_interval: Duration,
    pub max_attempts: u32,
}

impl Default for QuiescenceConfig {
    fn default() -> Self {
        Self::from(&IoSettings::default())
    }
}

impl From<&IoSettings> for QuiescenceConfig {
    fn from(io: &IoSettings) -> Self {
        Self {
            poll_interval: io.quiescence_poll_interval(),
            max_attempts: io.quiescence_max_attempts,
        }
    }
}

/// Activity register for the known learning subsystems
pub struct CompletionTracker {
    active: HashMap<&'static str, AtomicBool>,
    config: QuiescenceConfig,
}

impl CompletionTracker {
    /// Track the standard subsystem set
    pub fn new(config: QuiescenceConfig) -> Self {
        Self::with_subsystems(&KNOWN_SUBSYSTEMS, config)
    }

    pub fn with_subsystems(names: &[&'static str], config: QuiescenceConfig) -> Self {
        let active = names.iter().map(|n| (*n, AtomicBool::new(false))).collect();
        Self { active, config }
    }

    pub fn config(&self) -> QuiescenceConfig {
        self.config
    }

    pub fn mark_active(&self, name: &str) {
        if let Some(flag) = self.active.get(name) {
            flag.store(true, Ordering::SeqCst);
        }
    }

    pub fn mark_complete(&self, name: &str) {
        if let Some(flag) = self.active.get(name) {
            flag.store(false, Ordering::SeqCst);
        }
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.active
            .get(name)
            .map(|f| f.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Non-blocking snapshot: is any subsystem mid-operation
    pub fn has_active(&self) -> bool {
        self.active.values().any(|f| f.load(Ordering::SeqCst))
    }

    /// Names currently marked active, sorted
    pub fn active_subsystems(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self
            .active
            .iter()
            .filter(|(_, f)| f.load(Ordering::SeqCst))
            .map(|(n, _)| *n)
            .collect();
        names.sort_unstable();
        names
    }

    /// Wait until no subsystem is active, or the attempt bound is exhausted
    ///
    /// Best effort: on timeout the still-active subsystems are logged and
    /// `false` is returned; callers proceed either way.
    pub async fn wait_for_quiescence(&self) -> bool {
        let mut attempts = 0;
        loop {
            if !self.has_active() {
                return true;
            }
            if attempts >= self.config.max_attempts {
                break;
            }
            attempts += 1;
            tokio::time::sleep(self.config.poll_interval).await;
        }

        for name in self.active_subsystems() {
            warn!("Subsystem still active after quiescence timeout: {}", name);
        }
        debug!(
            "Quiescence wait gave up after {} attempts ({:?} interval)",
            attempts, self.config.poll_interval
        );
        false
    }
}

/// Marks a subsystem active until dropped
pub(crate) struct ActiveGuard<'a> {
    tracker: &'a CompletionTracker,
    name: &'a str,
}

impl<'a> ActiveGuard<'a> {
    pub(crate) fn new(tracker: &'a CompletionTracker, name: &'a str) -> Self {
        tracker.mark_active(name);
        Self { tracker, name }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.tracker.mark_complete(self.name);
    }
}
