//! Event types for the persistence layer
//!
//! Provides the persistence event definitions and the EventBus used to
//! observe phases and physical writes.

mod phase_types;

pub use phase_types::Phase;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Persistence event types
///
/// Broadcast via [`EventBus`] and serializable for log shipping or UI status.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PersistenceEvent {
    /// A lifecycle phase became current
    PhaseStarted {
        phase: Phase,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A lifecycle phase finished and released the coordinator
    PhaseCompleted {
        phase: Phase,
        /// Files written by the phase's flush
        flushed: usize,
        /// Files whose flush failed
        failed: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A file was durably written
    FileWritten {
        subsystem: String,
        file: String,
        bytes: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A physical write failed
    SaveFailed {
        subsystem: String,
        file: String,
        error: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A queued save was cancelled before it started
    SaveCancelled {
        subsystem: String,
        file: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl PersistenceEvent {
    /// Short type name used in log lines
    pub fn event_type(&self) -> &'static str {
        match self {
            PersistenceEvent::PhaseStarted { .. } => "PhaseStarted",
            PersistenceEvent::PhaseCompleted { .. } => "PhaseCompleted",
            PersistenceEvent::FileWritten { .. } => "FileWritten",
            PersistenceEvent::SaveFailed { .. } => "SaveFailed",
            PersistenceEvent::SaveCancelled { .. } => "SaveCancelled",
        }
    }
}

/// Central event distribution bus
///
/// Uses tokio::broadcast internally: publishing never blocks, slow
/// subscribers observe `Lagged` instead of stalling producers.
///
/// # Examples
///
/// ```
/// use tdm_common::events::{EventBus, Phase, PersistenceEvent};
///
/// let bus = EventBus::new(16);
/// let mut rx = bus.subscribe();
/// bus.emit_lossy(PersistenceEvent::PhaseStarted {
///     phase: Phase::Startup,
///     timestamp: chrono::Utc::now(),
/// });
/// assert!(rx.try_recv().is_ok());
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PersistenceEvent>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<PersistenceEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    pub fn emit(
        &self,
        event: PersistenceEvent,
    ) -> Result<usize, broadcast::error::SendError<PersistenceEvent>> {
        self.tx.send(event)
    }

    /// Emit without caring whether anyone listens
    pub fn emit_lossy(&self, event: PersistenceEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers_is_err() {
        let bus = EventBus::new(4);
        let event = PersistenceEvent::PhaseStarted {
            phase: Phase::Shutdown,
            timestamp: chrono::Utc::now(),
        };
        assert!(bus.emit(event).is_err());
    }

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        bus.emit_lossy(PersistenceEvent::FileWritten {
            subsystem: "QLearning".to_string(),
            file: "qtable.dat".to_string(),
            bytes: 12,
            timestamp: chrono::Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "FileWritten");
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = PersistenceEvent::PhaseCompleted {
            phase: Phase::TrainingStopSave,
            flushed: 2,
            failed: 0,
            timestamp: chrono::Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "PhaseCompleted");
        assert_eq!(json["phase"], "training_stop_save");
    }

    #[test]
    fn test_only_shutdown_is_hard_exclusive() {
        assert!(Phase::Shutdown.is_hard_exclusive());
        assert!(!Phase::TrainingStopSave.is_hard_exclusive());
        assert_eq!(Phase::GameResetSave.to_string(), "GAME_RESET_SAVE");
    }
}
