//! Persistence Manager
//!
//! Asynchronous saves and loads for every learning subsystem, plus the
//! lifecycle phases that flush pending state.
//!
//! **Architecture:**
//! - Saves are cached first (so a phase can always flush the latest value),
//!   then submitted to the bounded I/O pool as shared I/O
//! - Each physical write holds the target file's async mutex
//! - Phases run through [`FeatureCoordinator::run_exclusive_phase`]; their
//!   flush writes bypass the stop guard and the debounce rules
//!
//! **Stop guard:** a new save is admitted when user-data processing is
//! enabled, or when none of these hold: stop requested, shutdown current,
//! status source reports training inactive. An "inactive" answer is latched
//! into the session stop flag. A subsystem whose save batch is still in
//! flight keeps submitting past a stop until the batch drains.

mod handle;
pub mod keyvalue;
pub mod payload;
mod pool;
pub(crate) mod reader;
mod store;
pub(crate) mod writer;

pub use handle::{SaveHandle, SaveOutcome, SkipReason};
pub use payload::{
    LoadedPayload, ModelArchive, ModelPayload, ModelSerializer, Payload, PayloadKind, Snapshot,
    StructuredPayload, ARCHIVE_MAGIC,
};

use crate::context::{AssumeActive, SessionContext, TrainingStatus};
use crate::coordinator::FeatureCoordinator;
use crate::metrics::IoMetrics;
use crate::tracker::{ActiveGuard, CompletionTracker, QuiescenceConfig};
use chrono::Utc;
use futures::future::join_all;
use pool::IoPool;
use reader::is_model_file;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use store::{guard, FileStore};
use tdm_common::config::IoSettings;
use tdm_common::events::{EventBus, PersistenceEvent, Phase};
use tdm_common::{default_file_name, Error, Result};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const QUEUED: u8 = 0;
const STARTED: u8 = 1;
const CANCELLED: u8 = 2;

/// Result of flushing dirty files during a phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Files written
    pub flushed: usize,
    /// Files whose write failed; they stay dirty
    pub failed: usize,
    /// Dirty files with no cached payload; marked clean
    pub missing: usize,
}

/// Save submitted to the pool and not yet started
struct QueuedSave {
    subsystem: String,
    file: String,
    state: Arc<AtomicU8>,
    token: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    /// Regular save: stop guard, dedupe and model debounce apply
    Guarded,
    /// Phase flush: writes the newest cached payload, skipping only when a
    /// newer generation is already on disk
    Flush,
}

/// Counts physical I/O in flight
struct IoInFlight<'a>(&'a AtomicUsize);

impl<'a> IoInFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for IoInFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ManagerBuilder {
    data_dir: PathBuf,
    io: IoSettings,
    status: Arc<dyn TrainingStatus>,
    context: Option<Arc<SessionContext>>,
}

impl ManagerBuilder {
    pub fn io_settings(mut self, io: IoSettings) -> Self {
        self.io = io;
        self
    }

    pub fn status(mut self, status: Arc<dyn TrainingStatus>) -> Self {
        self.status = status;
        self
    }

    pub fn context(mut self, context: Arc<SessionContext>) -> Self {
        self.context = Some(context);
        self
    }

    /// Build the manager on the current tokio runtime
    pub fn build(self) -> Result<PersistenceManager> {
        self.io.validate()?;

        let tracker = Arc::new(CompletionTracker::new(QuiescenceConfig::from(&self.io)));
        let coordinator = FeatureCoordinator::new(Arc::clone(&tracker));
        let pool = IoPool::new(self.io.worker_threads)?;
        let events = EventBus::new(self.io.event_capacity);

        info!(
            "Persistence manager initialized: {:?}, {} I/O workers",
            self.data_dir,
            pool.size()
        );

        Ok(PersistenceManager {
            inner: Arc::new(Inner {
                data_dir: self.data_dir,
                io: self.io,
                coordinator,
                tracker,
                store: FileStore::new(),
                pool,
                metrics: Arc::new(IoMetrics::new()),
                events,
                context: self.context.unwrap_or_else(SessionContext::new),
                status: self.status,
                queued: Mutex::new(HashMap::new()),
                batches: Mutex::new(HashMap::new()),
                next_ticket: AtomicU64::new(0),
                io_in_flight: AtomicUsize::new(0),
                shut_down: AtomicBool::new(false),
            }),
        })
    }
}

/// Asynchronous persistence for the learning subsystems
pub struct PersistenceManager {
    inner: Arc<Inner>,
}

struct Inner {
    data_dir: PathBuf,
    io: IoSettings,
    coordinator: FeatureCoordinator,
    tracker: Arc<CompletionTracker>,
    store: FileStore,
    pool: IoPool,
    metrics: Arc<IoMetrics>,
    events: EventBus,
    context: Arc<SessionContext>,
    status: Arc<dyn TrainingStatus>,
    queued: Mutex<HashMap<u64, QueuedSave>>,
    /// In-flight save count per subsystem
    batches: Mutex<HashMap<String, usize>>,
    next_ticket: AtomicU64,
    io_in_flight: AtomicUsize,
    shut_down: AtomicBool,
}

impl PersistenceManager {
    pub fn builder(data_dir: impl Into<PathBuf>) -> ManagerBuilder {
        ManagerBuilder {
            data_dir: data_dir.into(),
            io: IoSettings::default(),
            status: Arc::new(AssumeActive),
            context: None,
        }
    }

    pub fn new(
        data_dir: impl Into<PathBuf>,
        io: IoSettings,
        status: Arc<dyn TrainingStatus>,
        context: Arc<SessionContext>,
    ) -> Result<Self> {
        Self::builder(data_dir)
            .io_settings(io)
            .status(status)
            .context(context)
            .build()
    }

    pub fn data_dir(&self) -> &Path {
        &self.inner.data_dir
    }

    pub fn settings(&self) -> &IoSettings {
        &self.inner.io
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.inner.context
    }

    /// Activity register; subsystems mark themselves active around learning
    /// steps so phases wait for them
    pub fn tracker(&self) -> &Arc<CompletionTracker> {
        &self.inner.tracker
    }

    pub fn metrics(&self) -> &Arc<IoMetrics> {
        &self.inner.metrics
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PersistenceEvent> {
        self.inner.events.subscribe()
    }

    pub fn current_phase(&self) -> Option<Phase> {
        self.inner.coordinator.current_phase()
    }

    // ========================================
    // Saves and loads
    // ========================================

    /// Submit an asynchronous save of `payload` to `file`
    ///
    /// Returns immediately. The payload is cached and the file marked dirty
    /// before the write is queued, so a later phase flush persists it even if
    /// this write is cancelled or skipped.
    pub fn save(&self, subsystem: &str, payload: Payload, file: &str) -> SaveHandle {
        let inner = &self.inner;
        if inner.is_shut_down() {
            debug!("Save of {} for {} after shutdown ignored", file, subsystem);
            return SaveHandle::ready(SaveOutcome::Skipped(SkipReason::ShutDown));
        }
        if inner.should_stop_io() {
            if !inner.admits_batch(subsystem) {
                debug!("Blocking save of {} for {} - training stopped", file, subsystem);
                return SaveHandle::ready(SaveOutcome::Skipped(SkipReason::Blocked));
            }
            info!("Admitting {} after stop - {} save batch in progress", file, subsystem);
        }

        let generation = inner.store.cache_payload(file, subsystem, payload.clone());
        inner.record_dirty(subsystem, file);
        inner.begin_batch(subsystem);

        let ticket = inner.next_ticket.fetch_add(1, Ordering::SeqCst);
        let state = Arc::new(AtomicU8::new(QUEUED));
        let token = CancellationToken::new();
        guard(&inner.queued).insert(
            ticket,
            QueuedSave {
                subsystem: subsystem.to_string(),
                file: file.to_string(),
                state: Arc::clone(&state),
                token: token.clone(),
            },
        );

        let task = Arc::clone(inner).run_save(
            ticket,
            subsystem.to_string(),
            file.to_string(),
            payload,
            generation,
            state,
            token,
        );
        SaveHandle::pending(inner.pool.spawn(task))
    }

    /// Save to the subsystem's default file name
    pub fn save_default(&self, subsystem: &str, payload: Payload) -> SaveHandle {
        self.save(subsystem, payload, &default_file_name(subsystem))
    }

    /// Load `file`, detecting its format
    ///
    /// `Ok(None)` when the file is absent or empty.
    pub async fn load(&self, subsystem: &str, file: &str) -> Result<Option<LoadedPayload>> {
        self.spawn_load(subsystem, file, None).await
    }

    /// Load `file` with an explicit decoder
    pub async fn load_as(
        &self,
        subsystem: &str,
        file: &str,
        kind: PayloadKind,
    ) -> Result<Option<LoadedPayload>> {
        self.spawn_load(subsystem, file, Some(kind)).await
    }

    async fn spawn_load(
        &self,
        subsystem: &str,
        file: &str,
        hint: Option<PayloadKind>,
    ) -> Result<Option<LoadedPayload>> {
        if self.inner.is_shut_down() {
            return Err(Error::ShutDown);
        }
        let task = Arc::clone(&self.inner).load_file(subsystem.to_string(), file.to_string(), hint);
        self.inner
            .pool
            .spawn(task)
            .await
            .map_err(|e| Error::Internal(format!("load task failed: {}", e)))?
    }

    /// Stop guard for new writes
    pub fn should_stop_io(&self) -> bool {
        self.inner.should_stop_io()
    }

    /// Mark `file` dirty unless writes are stopped or the status source
    /// reports no state change
    pub fn mark_dirty(&self, subsystem: &str, file: &str) {
        self.inner.mark_dirty(subsystem, file);
    }

    // ========================================
    // Lifecycle phases
    // ========================================

    async fn run_phase<F, Fut>(&self, phase: Phase, operation: F) -> Result<FlushReport>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<FlushReport>>,
    {
        let inner = &self.inner;
        inner
            .coordinator
            .run_exclusive_phase(phase, move || async move {
                inner.emit(PersistenceEvent::PhaseStarted {
                    phase,
                    timestamp: Utc::now(),
                });
                let result = operation().await;
                let (flushed, failed) = match &result {
                    Ok(report) => (report.flushed, report.failed),
                    Err(_) => (0, 0),
                };
                inner.emit(PersistenceEvent::PhaseCompleted {
                    phase,
                    flushed,
                    failed,
                    timestamp: Utc::now(),
                });
                result
            })
            .await
    }

    /// Prepare the data directory
    pub async fn startup(&self) -> Result<()> {
        if self.inner.is_shut_down() {
            return Err(Error::ShutDown);
        }
        let inner = &self.inner;
        self.run_phase(Phase::Startup, move || async move {
            tokio::fs::create_dir_all(&inner.data_dir).await?;
            info!("System STARTUP - data directory {:?}", inner.data_dir);
            Ok(FlushReport::default())
        })
        .await
        .map(|_| ())
    }

    /// Flush every dirty file and close the pool
    ///
    /// Holds the I/O lock exclusively for the whole flush. A second call is
    /// a no-op.
    pub async fn shutdown(&self) -> Result<FlushReport> {
        if self.inner.is_shut_down() {
            debug!("Shutdown already completed");
            return Ok(FlushReport::default());
        }
        let inner = &self.inner;
        self.run_phase(Phase::Shutdown, move || async move {
            if inner.is_shut_down() {
                return Ok(FlushReport::default());
            }
            info!("System SHUTDOWN - saving all dirty data");
            let report = inner.flush_dirty().await;
            inner.close();
            info!("Shutdown complete");
            Ok(report)
        })
        .await
    }

    /// Training stopped: block new writes, cancel queued ones, flush the
    /// cached state, then clear every dirty flag
    pub async fn on_training_stop(&self) -> Result<FlushReport> {
        self.inner.context.request_stop();
        let inner = &self.inner;
        self.run_phase(Phase::TrainingStopSave, move || async move {
            let cancelled = inner.cancel_queued();
            if cancelled > 0 {
                info!("Cancelled {} queued saves for training stop", cancelled);
            }
            let report = inner.flush_dirty().await;
            let cleared = inner.store.clear_all_dirty();
            inner.clear_batches();
            info!(
                "Training stop save completed - {} dirty flags cleared",
                cleared
            );
            Ok(report)
        })
        .await
    }

    /// Training restarted: admit saves again
    pub fn on_training_start(&self) {
        self.inner.context.clear_stop();
        info!("Training started - saves admitted");
    }

    /// Game reset: flush dirty state, keeping flags for anything that fails
    pub async fn on_game_reset(&self) -> Result<FlushReport> {
        let inner = &self.inner;
        self.run_phase(Phase::GameResetSave, move || async move {
            info!("Game reset - saving dirty data");
            Ok(inner.flush_dirty().await)
        })
        .await
    }

    /// Load several files as one consistent view
    ///
    /// Runs as `Phase::UiReadState`, so no other phase interleaves with the
    /// reads. Results are returned in request order.
    pub async fn read_ui_state(
        &self,
        requests: &[(&str, &str)],
    ) -> Result<Vec<Result<Option<LoadedPayload>>>> {
        if self.inner.is_shut_down() {
            return Err(Error::ShutDown);
        }
        let inner = &self.inner;
        let mut out = Vec::with_capacity(requests.len());
        inner
            .coordinator
            .run_exclusive_phase(Phase::UiReadState, || async {
                let tasks: Vec<_> = requests
                    .iter()
                    .map(|(subsystem, file)| {
                        let task = Arc::clone(inner).load_file(
                            subsystem.to_string(),
                            file.to_string(),
                            None,
                        );
                        inner.pool.spawn(task)
                    })
                    .collect();
                for joined in join_all(tasks).await {
                    out.push(joined.unwrap_or_else(|e| {
                        Err(Error::Internal(format!("load task failed: {}", e)))
                    }));
                }
            })
            .await;
        Ok(out)
    }

    /// Write every dirty file from the cache outside any phase
    pub async fn flush_dirty_data(&self) -> FlushReport {
        self.inner.flush_dirty().await
    }

    /// Cancel saves that have not started; returns how many were cancelled
    pub fn cancel_queued_operations(&self) -> usize {
        self.inner.cancel_queued()
    }

    /// Clear every dirty flag and drop all cached payloads
    pub fn clear_all_dirty_flags(&self) -> usize {
        let cleared = self.inner.store.clear_all_dirty();
        info!("Cleared {} dirty flags", cleared);
        cleared
    }

    // ========================================
    // Introspection
    // ========================================

    pub fn is_dirty(&self, file: &str) -> bool {
        self.inner.store.is_dirty(file)
    }

    pub fn has_cached(&self, file: &str) -> bool {
        self.inner.store.has_cached(file)
    }

    pub fn dirty_files(&self) -> Vec<String> {
        self.inner.store.dirty_files()
    }

    /// Physical writes of `file` this session
    pub fn write_count(&self, file: &str) -> u64 {
        self.inner.store.write_count(file)
    }

    pub fn is_save_in_progress(&self, subsystem: &str) -> bool {
        guard(&self.inner.batches).contains_key(subsystem)
    }

    pub fn is_io_in_progress(&self) -> bool {
        self.inner.io_in_flight.load(Ordering::SeqCst) > 0
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.is_shut_down()
    }
}

impl Inner {
    fn path_for(&self, file: &str) -> PathBuf {
        self.data_dir.join(file)
    }

    fn emit(&self, event: PersistenceEvent) {
        self.events.emit_lossy(event);
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn should_stop_io(&self) -> bool {
        if self.context.is_user_data_processing() {
            return false;
        }
        if self.context.is_stop_requested() {
            return true;
        }
        if self.coordinator.is_shutting_down() {
            return true;
        }
        match self.status.is_training_active() {
            Some(false) => {
                debug!("Training inactive - stop condition latched");
                self.context.request_stop();
                true
            }
            _ => false,
        }
    }

    fn mark_dirty(&self, subsystem: &str, file: &str) {
        if self.should_stop_io() {
            debug!("Not marking {} dirty - training stopped", file);
            return;
        }
        self.record_dirty(subsystem, file);
    }

    fn record_dirty(&self, subsystem: &str, file: &str) {
        match self.status.has_state_changed(subsystem) {
            Some(false) => debug!("{} state unchanged - {} not marked dirty", subsystem, file),
            _ => {
                self.store.mark_dirty(file);
                debug!("Marked {} dirty for {}", file, subsystem);
            }
        }
    }

    /// A subsystem with saves still in flight may finish its batch after a
    /// stop, so multi-file state is never split; shutdown admits nothing
    fn admits_batch(&self, subsystem: &str) -> bool {
        !self.coordinator.is_shutting_down() && guard(&self.batches).contains_key(subsystem)
    }

    fn begin_batch(&self, subsystem: &str) {
        *guard(&self.batches).entry(subsystem.to_string()).or_insert(0) += 1;
    }

    fn finish_batch(&self, subsystem: &str) {
        let mut batches = guard(&self.batches);
        if let Some(count) = batches.get_mut(subsystem) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                batches.remove(subsystem);
                debug!("{} save batch complete", subsystem);
            }
        }
    }

    fn clear_batches(&self) {
        guard(&self.batches).clear();
    }

    fn cancel_queued(&self) -> usize {
        let queued = guard(&self.queued);
        let mut cancelled = 0;
        for save in queued.values() {
            if save
                .state
                .compare_exchange(QUEUED, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                save.token.cancel();
                debug!("Cancelling queued save of {} for {}", save.file, save.subsystem);
                cancelled += 1;
            }
        }
        cancelled
    }

    fn close(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.pool.close();
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_save(
        self: Arc<Self>,
        ticket: u64,
        subsystem: String,
        file: String,
        payload: Payload,
        generation: u64,
        state: Arc<AtomicU8>,
        token: CancellationToken,
    ) -> Result<SaveOutcome> {
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Ok(SaveOutcome::Skipped(SkipReason::Cancelled)),
            outcome = self.queued_save(&subsystem, &file, &payload, generation, &state) => outcome,
        };

        guard(&self.queued).remove(&ticket);
        self.finish_batch(&subsystem);

        if let Ok(SaveOutcome::Skipped(SkipReason::Cancelled)) = outcome {
            info!("Cancelled queued save of {} for {}", file, subsystem);
            self.emit(PersistenceEvent::SaveCancelled {
                subsystem,
                file,
                timestamp: Utc::now(),
            });
        }
        outcome
    }

    /// Shared I/O body of a save; the token is only cancelled while the
    /// save is still `QUEUED`
    async fn queued_save(
        &self,
        subsystem: &str,
        file: &str,
        payload: &Payload,
        generation: u64,
        state: &AtomicU8,
    ) -> Result<SaveOutcome> {
        self.coordinator
            .run_shared_io(subsystem, || async {
                let _permit = match self.pool.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return Ok(SaveOutcome::Skipped(SkipReason::ShutDown)),
                };
                if state
                    .compare_exchange(QUEUED, STARTED, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    return Ok(SaveOutcome::Skipped(SkipReason::Cancelled));
                }
                let _active = ActiveGuard::new(&self.tracker, subsystem);
                self.write_file(subsystem, file, payload, generation, WriteMode::Guarded)
                    .await
            })
            .await
    }

    async fn write_file(
        &self,
        subsystem: &str,
        file: &str,
        payload: &Payload,
        generation: u64,
        mode: WriteMode,
    ) -> Result<SaveOutcome> {
        let lock = self.store.file_lock(file);
        let _file_guard = lock.lock().await;
        let _in_flight = IoInFlight::enter(&self.io_in_flight);

        // A flush writes whatever is newest in the cache once it holds the lock
        let newer = match mode {
            WriteMode::Flush => self
                .store
                .cached(file)
                .filter(|entry| entry.generation > generation),
            WriteMode::Guarded => None,
        };
        let (payload, generation) = match &newer {
            Some(entry) => {
                debug!(
                    "Flushing {} at generation {} instead of {}",
                    file, entry.generation, generation
                );
                (&entry.payload, entry.generation)
            }
            None => (payload, generation),
        };

        if mode == WriteMode::Guarded && self.should_stop_io() && !self.admits_batch(subsystem) {
            debug!("Save of {} abandoned - training stopped", file);
            return Ok(SaveOutcome::Skipped(SkipReason::Blocked));
        }
        if self.store.is_superseded(file, generation) {
            debug!("Save of {} superseded by a newer write", file);
            return Ok(SaveOutcome::Skipped(SkipReason::Superseded));
        }

        let path = self.path_for(file);
        let prepared = match writer::prepare(payload) {
            Ok(prepared) => prepared,
            Err(e) => return Err(self.write_failed(subsystem, file, e)),
        };

        if mode == WriteMode::Guarded {
            let now = Instant::now();
            if let Some(hash) = prepared.hash() {
                if self
                    .store
                    .is_duplicate(file, hash, now, self.io.dedupe_window())
                {
                    self.store.settle_duplicate(file, generation);
                    debug!("Skipping duplicate save of {}", file);
                    return Ok(SaveOutcome::Skipped(SkipReason::Duplicate));
                }
            }
            if prepared.kind() == PayloadKind::ModelStream || is_model_file(&path) {
                if let Some(last) = self.store.last_write(file) {
                    let since = now.saturating_duration_since(last);
                    if since < self.io.model_debounce_for(file) {
                        debug!("Skipping model save of {} - last written {:?} ago", file, since);
                        return Ok(SaveOutcome::Skipped(SkipReason::ModelDebounce));
                    }
                }
            }
        }

        let hash = prepared.hash().copied();
        let kind = prepared.kind();
        let started = Instant::now();
        match writer::write_prepared(&path, prepared).await {
            Ok(bytes) => {
                self.metrics.record_write(subsystem, started.elapsed());
                self.store.complete_write(file, generation, hash, kind);
                info!("{} saved {} ({} bytes)", subsystem, file, bytes);
                self.emit(PersistenceEvent::FileWritten {
                    subsystem: subsystem.to_string(),
                    file: file.to_string(),
                    bytes,
                    timestamp: Utc::now(),
                });
                Ok(SaveOutcome::Written { bytes })
            }
            Err(e) => Err(self.write_failed(subsystem, file, e.into())),
        }
    }

    fn write_failed(&self, subsystem: &str, file: &str, err: Error) -> Error {
        self.metrics.record_error(subsystem);
        error!("Failed to save {} for {}: {}", file, subsystem, err);
        self.emit(PersistenceEvent::SaveFailed {
            subsystem: subsystem.to_string(),
            file: file.to_string(),
            error: err.to_string(),
            timestamp: Utc::now(),
        });
        err
    }

    async fn load_file(
        self: Arc<Self>,
        subsystem: String,
        file: String,
        hint: Option<PayloadKind>,
    ) -> Result<Option<LoadedPayload>> {
        self.coordinator
            .run_shared_io(&subsystem, || async {
                let _permit = self.pool.acquire().await?;
                let _active = ActiveGuard::new(&self.tracker, &subsystem);
                let _in_flight = IoInFlight::enter(&self.io_in_flight);

                let path = self.path_for(&file);
                let bytes = match reader::read_file(&path).await {
                    Ok(Some(bytes)) => bytes,
                    Ok(None) => {
                        info!("{} does not exist or is empty", file);
                        return Ok(None);
                    }
                    Err(e) => {
                        self.metrics.record_error(&subsystem);
                        error!("Failed to read {} for {}: {}", file, subsystem, e);
                        return Err(e);
                    }
                };

                let hint = hint.or_else(|| self.store.kind_of(&file));
                match reader::decode(&path, bytes, hint) {
                    Ok(loaded) => {
                        info!("{} loaded {} ({} bytes)", subsystem, file, loaded.len());
                        Ok(Some(loaded))
                    }
                    Err(e) => {
                        self.metrics.record_error(&subsystem);
                        error!("Failed to decode {} for {}: {}", file, subsystem, e);
                        Err(e)
                    }
                }
            })
            .await
    }

    /// Write every dirty file from the cache
    ///
    /// Runs writes on the pool and awaits them without holding a permit.
    async fn flush_dirty(self: &Arc<Self>) -> FlushReport {
        let mut report = FlushReport::default();
        let dirty = self.store.dirty_files();
        if dirty.is_empty() {
            info!("No dirty data to save");
            return report;
        }
        info!("Saving all dirty data - {} files marked dirty", dirty.len());

        let mut tasks = Vec::with_capacity(dirty.len());
        for file in dirty {
            let Some(entry) = self.store.cached(&file) else {
                warn!("No cached data for dirty file {} - marking clean", file);
                self.store.mark_clean(&file);
                report.missing += 1;
                continue;
            };
            info!("Flushing dirty file: {}", file);
            let inner = Arc::clone(self);
            tasks.push(self.pool.spawn(async move {
                let _permit = inner.pool.acquire().await?;
                inner
                    .write_file(
                        &entry.subsystem,
                        &file,
                        &entry.payload,
                        entry.generation,
                        WriteMode::Flush,
                    )
                    .await
            }));
        }

        for joined in join_all(tasks).await {
            match joined {
                Ok(Ok(SaveOutcome::Written { .. })) => report.flushed += 1,
                Ok(Ok(SaveOutcome::Skipped(reason))) => debug!("Flush write skipped: {:?}", reason),
                Ok(Err(_)) => report.failed += 1,
                Err(e) => {
                    error!("Flush task failed: {}", e);
                    report.failed += 1;
                }
            }
        }

        info!(
            "Dirty data flushed: {} written, {} failed, {} missing",
            report.flushed, report.failed, report.missing
        );
        report
    }
}
