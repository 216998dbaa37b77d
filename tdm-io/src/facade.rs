//! Compatibility Façade
//!
//! Front door used by the learning subsystems. Each call checks two flags
//! for the subsystem: enabled at all, and async path enabled. Only when both
//! hold (and a manager exists) does the call go to [`PersistenceManager`];
//! otherwise it falls back to a direct blocking read or write with no
//! caching, dedupe, or phase awareness.

use crate::manager::{
    keyvalue, reader, writer, FlushReport, LoadedPayload, Payload, PersistenceManager, SaveHandle,
    SaveOutcome,
};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tdm_common::config::FeatureFlags;
use tdm_common::{Error, Result};
use tracing::{debug, info, warn};

const Q_LEARNING: &str = "QLearning";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    /// No persistence manager was supplied
    NoManager,
    /// Subsystem disabled by configuration
    SubsystemDisabled,
    /// Async path disabled for this subsystem, or globally
    AsyncDisabled,
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FallbackReason::NoManager => "async system disabled",
            FallbackReason::SubsystemDisabled => "subsystem disabled",
            FallbackReason::AsyncDisabled => "async disabled for this subsystem",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoRoute {
    Async,
    SyncFallback(FallbackReason),
}

pub struct TrainingDataIo {
    manager: Option<Arc<PersistenceManager>>,
    flags: FeatureFlags,
    data_dir: PathBuf,
}

impl TrainingDataIo {
    pub fn new(
        manager: Option<Arc<PersistenceManager>>,
        flags: FeatureFlags,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        let data_dir = data_dir.into();
        match &manager {
            Some(_) => debug!("Training data I/O connected to persistence manager"),
            None => debug!("Training data I/O using synchronous fallback for {:?}", data_dir),
        }
        Self {
            manager,
            flags,
            data_dir,
        }
    }

    pub fn manager(&self) -> Option<&Arc<PersistenceManager>> {
        self.manager.as_ref()
    }

    pub fn flags(&self) -> &FeatureFlags {
        &self.flags
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Where a call for `subsystem` would go right now
    pub fn route(&self, subsystem: &str) -> IoRoute {
        if self.manager.is_none() {
            IoRoute::SyncFallback(FallbackReason::NoManager)
        } else if !self.flags.is_enabled(subsystem) {
            IoRoute::SyncFallback(FallbackReason::SubsystemDisabled)
        } else if !self.flags.is_async_enabled(subsystem) {
            IoRoute::SyncFallback(FallbackReason::AsyncDisabled)
        } else {
            IoRoute::Async
        }
    }

    /// Active async manager, if this subsystem is routed to it
    fn async_manager(&self, subsystem: &str, op: &str) -> Option<&Arc<PersistenceManager>> {
        match self.route(subsystem) {
            IoRoute::Async => {
                info!("{} using async {} path", subsystem, op);
                self.manager.as_ref()
            }
            IoRoute::SyncFallback(reason) => {
                debug!("{} using synchronous {} fallback ({})", subsystem, op, reason);
                None
            }
        }
    }

    /// Save `payload` for `subsystem`
    ///
    /// On the async route this returns as soon as the save is queued. On the
    /// fallback route the write happens before returning.
    pub fn save(&self, subsystem: &str, payload: Payload, file: &str) -> SaveHandle {
        if let Some(manager) = self.async_manager(subsystem, "SAVE") {
            return manager.save(subsystem, payload, file);
        }
        let path = self.data_dir.join(file);
        match writer::write_blocking(&path, &payload) {
            Ok(bytes) => SaveHandle::ready(SaveOutcome::Written { bytes }),
            Err(e) => {
                warn!("Synchronous save of {:?} for {} failed: {}", path, subsystem, e);
                SaveHandle::failed(e)
            }
        }
    }

    pub async fn load(&self, subsystem: &str, file: &str) -> Result<Option<LoadedPayload>> {
        if let Some(manager) = self.async_manager(subsystem, "LOAD") {
            return manager.load(subsystem, file).await;
        }
        let path = self.data_dir.join(file);
        tokio::task::spawn_blocking(move || -> Result<Option<LoadedPayload>> {
            match reader::read_file_blocking(&path)? {
                Some(bytes) => reader::decode(&path, bytes, None).map(Some),
                None => Ok(None),
            }
        })
        .await
        .map_err(|e| Error::Internal(format!("synchronous load failed: {}", e)))?
    }

    /// Save a Q-table as `key=value` lines
    pub fn save_q_table(&self, table: &HashMap<String, f64>, file: &str) -> SaveHandle {
        self.save(Q_LEARNING, Payload::key_value(table), file)
    }

    /// Load a Q-table written by [`Self::save_q_table`] (or as a JSON map)
    pub async fn load_q_table(&self, file: &str) -> Result<Option<HashMap<String, f64>>> {
        let Some(loaded) = self.load(Q_LEARNING, file).await? else {
            return Ok(None);
        };
        let path = self.data_dir.join(file);
        match loaded {
            LoadedPayload::Structured(value) => Ok(Some(serde_json::from_value(value)?)),
            LoadedPayload::Raw(bytes) => {
                let text = std::str::from_utf8(&bytes)
                    .map_err(|e| Error::decode(&path, e.to_string()))?;
                keyvalue::decode(text)
                    .map(Some)
                    .map_err(|e| Error::decode(&path, e.to_string()))
            }
            LoadedPayload::Model(_) => Err(Error::decode(&path, "model archive is not a Q-table")),
        }
    }

    /// Run a manager phase, waiting at most the configured phase timeout
    ///
    /// A phase that overruns keeps running in the background.
    async fn bounded<F, Fut>(&self, label: &str, phase: F) -> Result<FlushReport>
    where
        F: FnOnce(Arc<PersistenceManager>) -> Fut,
        Fut: Future<Output = Result<FlushReport>> + Send + 'static,
    {
        let Some(manager) = &self.manager else {
            debug!("{} skipped - no persistence manager", label);
            return Ok(FlushReport::default());
        };
        let limit = manager.settings().phase_timeout();
        let task = tokio::spawn(phase(Arc::clone(manager)));

        match tokio::time::timeout(limit, task).await {
            Ok(joined) => joined.map_err(|e| Error::Internal(format!("{} failed: {}", label, e)))?,
            Err(_) => {
                warn!("{} did not finish within {:?} - continuing in background", label, limit);
                Ok(FlushReport::default())
            }
        }
    }

    pub async fn startup(&self) -> Result<()> {
        self.bounded("Startup", |m| async move {
            m.startup().await.map(|_| FlushReport::default())
        })
        .await
        .map(|_| ())
    }

    pub async fn save_on_training_stop(&self) -> Result<FlushReport> {
        self.bounded("Training stop save", |m| async move { m.on_training_stop().await })
            .await
    }

    pub async fn save_on_game_reset(&self) -> Result<FlushReport> {
        self.bounded("Game reset save", |m| async move { m.on_game_reset().await })
            .await
    }

    /// Flush every cached payload and shut the manager down
    pub async fn flush_all_data(&self) -> Result<FlushReport> {
        if self.manager.is_some() {
            info!("Flushing all cached data during shutdown");
        }
        self.bounded("Shutdown", |m| async move { m.shutdown().await }).await
    }

    pub fn is_async_path_available(&self) -> bool {
        self.manager
            .as_ref()
            .map(|m| !m.is_shut_down())
            .unwrap_or(false)
    }

    pub fn metrics_summary(&self) -> String {
        match &self.manager {
            Some(manager) => manager.metrics().summary(),
            None => "Async I/O disabled - no metrics".to_string(),
        }
    }
}
