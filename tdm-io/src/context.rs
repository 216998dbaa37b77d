//! Session context and injected status queries
//!
//! The persistence manager never looks up the surrounding application. It is
//! handed a [`TrainingStatus`] implementation and a [`SessionContext`] at
//! construction and consults both on every operation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Status queries answered by the surrounding application
///
/// Both methods must be cheap and must not panic; they are called on every
/// save. `None` means the answer could not be determined and the manager
/// falls back to its safe default (training active, state changed).
pub trait TrainingStatus: Send + Sync {
    /// Is training currently active for the whole system
    fn is_training_active(&self) -> Option<bool>;

    /// Has this subsystem's in-memory state changed since its last save
    fn has_state_changed(&self, subsystem: &str) -> Option<bool>;
}

/// Status source that never has an answer
///
/// Every query resolves to the manager's defaults, so saves are always
/// admitted and always marked dirty.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeActive;

impl TrainingStatus for AssumeActive {
    fn is_training_active(&self) -> Option<bool> {
        None
    }

    fn has_state_changed(&self, _subsystem: &str) -> Option<bool> {
        None
    }
}

/// Session-wide switches consulted by each persistence operation
///
/// - `stop_requested`: set when training stops; blocks new writes
/// - `user_data_processing`: override that admits writes even while stopped,
///   so data from a user-played game is never dropped
#[derive(Debug, Default)]
pub struct SessionContext {
    stop_requested: AtomicBool,
    user_data_processing: AtomicBool,
}

impl SessionContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Re-admit writes after training restarts
    pub fn clear_stop(&self) {
        if self.stop_requested.swap(false, Ordering::SeqCst) {
            debug!("Stop condition cleared - saves admitted again");
        }
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub fn enable_user_data_processing(&self) {
        self.user_data_processing.store(true, Ordering::SeqCst);
        debug!("User game data processing ENABLED - saves allowed");
    }

    pub fn disable_user_data_processing(&self) {
        self.user_data_processing.store(false, Ordering::SeqCst);
        debug!("User game data processing DISABLED");
    }

    pub fn is_user_data_processing(&self) -> bool {
        self.user_data_processing.load(Ordering::SeqCst)
    }

    /// Enable the user-data override for the lifetime of the returned guard
    pub fn begin_user_data_processing(self: &Arc<Self>) -> UserDataGuard {
        self.enable_user_data_processing();
        UserDataGuard {
            context: Arc::clone(self),
        }
    }
}

/// Clears the user-data override when dropped
#[must_use = "the override is cleared as soon as the guard is dropped"]
pub struct UserDataGuard {
    context: Arc<SessionContext>,
}

impl Drop for UserDataGuard {
    fn drop(&mut self) {
        self.context.disable_user_data_processing();
    }
}
