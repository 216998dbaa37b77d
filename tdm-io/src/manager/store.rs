//! Per-file bookkeeping: dirty flags, pending cache, dedupe state, locks
//!
//! Every map here sits behind a std mutex that is never held across an
//! `.await`. The per-file write locks are async mutexes handed out as `Arc`s
//! and held across the physical write.
//!
//! Cache entries carry a generation number. A finished write clears the
//! file's dirty flag and drops the cache entry only if the entry is still the
//! one that was written; a newer save arriving mid-write keeps the file dirty.

use super::payload::{Payload, PayloadKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;

pub(crate) type ContentHash = [u8; 32];

/// Latest payload a subsystem wants persisted for one file
#[derive(Debug, Clone)]
pub(crate) struct CacheEntry {
    pub subsystem: String,
    pub payload: Payload,
    pub generation: u64,
}

#[derive(Debug, Default)]
struct FileState {
    dirty: bool,
    last_write: Option<Instant>,
    last_hash: Option<ContentHash>,
    write_count: u64,
    kind: Option<PayloadKind>,
    /// Newest generation physically written
    written_generation: u64,
}

#[derive(Debug, Default)]
pub(crate) struct FileStore {
    files: Mutex<HashMap<String, FileState>>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    next_generation: AtomicU64,
}

pub(super) fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl FileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cached payload for `file`, returning its generation
    pub fn cache_payload(&self, file: &str, subsystem: &str, payload: Payload) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        guard(&self.cache).insert(
            file.to_string(),
            CacheEntry {
                subsystem: subsystem.to_string(),
                payload,
                generation,
            },
        );
        generation
    }

    pub fn cached(&self, file: &str) -> Option<CacheEntry> {
        guard(&self.cache).get(file).cloned()
    }

    pub fn has_cached(&self, file: &str) -> bool {
        guard(&self.cache).contains_key(file)
    }

    pub fn mark_dirty(&self, file: &str) {
        guard(&self.files).entry(file.to_string()).or_default().dirty = true;
    }

    pub fn mark_clean(&self, file: &str) {
        if let Some(state) = guard(&self.files).get_mut(file) {
            state.dirty = false;
        }
    }

    pub fn is_dirty(&self, file: &str) -> bool {
        guard(&self.files).get(file).map(|s| s.dirty).unwrap_or(false)
    }

    /// Dirty file names, sorted
    pub fn dirty_files(&self) -> Vec<String> {
        let mut files: Vec<String> = guard(&self.files)
            .iter()
            .filter(|(_, s)| s.dirty)
            .map(|(f, _)| f.clone())
            .collect();
        files.sort();
        files
    }

    /// Clear every dirty flag and empty the cache; returns flags cleared
    pub fn clear_all_dirty(&self) -> usize {
        let mut cleared = 0;
        for state in guard(&self.files).values_mut() {
            if state.dirty {
                state.dirty = false;
                cleared += 1;
            }
        }
        guard(&self.cache).clear();
        cleared
    }

    /// Drop the cache entry and dirty flag if `generation` is still current
    fn settle(&self, file: &str, generation: u64) {
        let mut cache = guard(&self.cache);
        let current = match cache.get(file) {
            Some(entry) if entry.generation == generation => {
                cache.remove(file);
                true
            }
            Some(_) => false,
            None => true,
        };
        drop(cache);
        if current {
            self.mark_clean(file);
        }
    }

    /// Record a successful physical write of `generation`
    pub fn complete_write(
        &self,
        file: &str,
        generation: u64,
        hash: Option<ContentHash>,
        kind: PayloadKind,
    ) {
        {
            let mut files = guard(&self.files);
            let state = files.entry(file.to_string()).or_default();
            state.last_write = Some(Instant::now());
            state.last_hash = hash;
            state.write_count += 1;
            state.kind = Some(kind);
            state.written_generation = state.written_generation.max(generation);
        }
        self.settle(file, generation);
    }

    /// Content on disk already matches `generation`
    pub fn settle_duplicate(&self, file: &str, generation: u64) {
        self.settle(file, generation);
    }

    /// Same content written within `window` of `now`
    pub fn is_duplicate(
        &self,
        file: &str,
        hash: &ContentHash,
        now: Instant,
        window: Duration,
    ) -> bool {
        let files = guard(&self.files);
        let Some(state) = files.get(file) else {
            return false;
        };
        match (state.last_write, state.last_hash.as_ref()) {
            (Some(at), Some(last)) => last == hash && now.saturating_duration_since(at) < window,
            _ => false,
        }
    }

    /// A newer generation of `file` already reached the disk
    pub fn is_superseded(&self, file: &str, generation: u64) -> bool {
        guard(&self.files)
            .get(file)
            .map(|s| generation < s.written_generation)
            .unwrap_or(false)
    }

    pub fn last_write(&self, file: &str) -> Option<Instant> {
        guard(&self.files).get(file).and_then(|s| s.last_write)
    }

    pub fn write_count(&self, file: &str) -> u64 {
        guard(&self.files).get(file).map(|s| s.write_count).unwrap_or(0)
    }

    /// Kind of the last payload written to `file` in this session
    pub fn kind_of(&self, file: &str) -> Option<PayloadKind> {
        guard(&self.files).get(file).and_then(|s| s.kind)
    }

    pub fn file_lock(&self, file: &str) -> Arc<AsyncMutex<()>> {
        Arc::clone(guard(&self.locks).entry(file.to_string()).or_default())
    }
}
