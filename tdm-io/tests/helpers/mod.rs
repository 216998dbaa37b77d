//! Test helpers for tdm-io integration tests
//!
//! Provides:
//! - TestStatus: scriptable training-status source
//! - FakeModel: model serializer producing a recognizable archive
//! - TestHarness: manager over a temporary data directory with fast phases

#![allow(dead_code)]

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tdm_common::config::IoSettings;
use tdm_io::manager::ARCHIVE_MAGIC;
use tdm_io::{ModelSerializer, PersistenceManager, SessionContext, TrainingStatus};
use tempfile::TempDir;

const UNKNOWN: u8 = 0;
const YES: u8 = 1;
const NO: u8 = 2;

fn encode(value: Option<bool>) -> u8 {
    match value {
        None => UNKNOWN,
        Some(true) => YES,
        Some(false) => NO,
    }
}

fn decode(raw: u8) -> Option<bool> {
    match raw {
        YES => Some(true),
        NO => Some(false),
        _ => None,
    }
}

/// Status source whose answers tests can change at any time
#[derive(Debug, Default)]
pub struct TestStatus {
    training_active: AtomicU8,
    state_changed: AtomicU8,
}

impl TestStatus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_training_active(&self, value: Option<bool>) {
        self.training_active.store(encode(value), Ordering::SeqCst);
    }

    pub fn set_state_changed(&self, value: Option<bool>) {
        self.state_changed.store(encode(value), Ordering::SeqCst);
    }
}

impl TrainingStatus for TestStatus {
    fn is_training_active(&self) -> Option<bool> {
        decode(self.training_active.load(Ordering::SeqCst))
    }

    fn has_state_changed(&self, _subsystem: &str) -> Option<bool> {
        decode(self.state_changed.load(Ordering::SeqCst))
    }
}

/// Model serializer writing the archive header plus `size` filler bytes
///
/// `delay` slows serialization so tests can observe in-flight writes.
pub struct FakeModel {
    pub size: usize,
    pub fill: u8,
    pub delay: Duration,
    pub fingerprint: Option<u64>,
    pub writes: AtomicU64,
    pub fail: AtomicBool,
}

impl FakeModel {
    pub fn new(size: usize, fill: u8) -> Arc<Self> {
        Arc::new(Self {
            size,
            fill,
            delay: Duration::ZERO,
            fingerprint: None,
            writes: AtomicU64::new(0),
            fail: AtomicBool::new(false),
        })
    }

    pub fn slow(size: usize, fill: u8, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            size,
            fill,
            delay,
            fingerprint: None,
            writes: AtomicU64::new(0),
            fail: AtomicBool::new(false),
        })
    }

    pub fn expected_len(&self) -> u64 {
        (ARCHIVE_MAGIC.len() + self.size) as u64
    }
}

impl ModelSerializer for FakeModel {
    fn write_to(&self, out: &mut dyn Write) -> std::io::Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        out.write_all(&ARCHIVE_MAGIC)?;
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "fake model failure"));
        }
        let block = vec![self.fill; 4096];
        let mut remaining = self.size;
        while remaining > 0 {
            let n = remaining.min(block.len());
            out.write_all(&block[..n])?;
            remaining -= n;
        }
        Ok(())
    }

    fn fingerprint(&self) -> Option<u64> {
        self.fingerprint
    }
}

/// IoSettings with millisecond quiescence polling
pub fn fast_settings() -> IoSettings {
    IoSettings {
        quiescence_poll_ms: 5,
        quiescence_max_attempts: 10,
        phase_timeout_secs: 5,
        ..IoSettings::default()
    }
}

/// Manager over a temporary data directory
pub struct TestHarness {
    pub dir: TempDir,
    pub status: Arc<TestStatus>,
    pub context: Arc<SessionContext>,
    pub manager: Arc<PersistenceManager>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_settings(fast_settings())
    }

    pub fn with_settings(io: IoSettings) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let status = TestStatus::new();
        let context = SessionContext::new();
        let manager = PersistenceManager::new(
            dir.path(),
            io,
            Arc::clone(&status) as Arc<dyn TrainingStatus>,
            Arc::clone(&context),
        )
        .expect("manager");
        Self {
            dir,
            status,
            context,
            manager: Arc::new(manager),
        }
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.dir.path().join(file)
    }

    pub fn read(&self, file: &str) -> Vec<u8> {
        std::fs::read(self.path(file)).expect("file readable")
    }
}
