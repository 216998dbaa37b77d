//! Metrics Collector
//!
//! Per-subsystem write timing and error counters.
//!
//! **Design:** counters are atomics. The map only takes its write lock the
//! first time a subsystem records an event; every later update is a read
//! lock plus `fetch_add`, so recording never waits on another recorder.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct SubsystemCounters {
    total_write_us: AtomicU64,
    write_count: AtomicU64,
    error_count: AtomicU64,
}

/// Point-in-time copy of one subsystem's counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubsystemMetrics {
    pub subsystem: String,
    pub writes: u64,
    pub errors: u64,
    pub average_write_ms: f64,
}

#[derive(Debug, Default)]
pub struct IoMetrics {
    records: RwLock<HashMap<String, Arc<SubsystemCounters>>>,
}

impl IoMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, name: &str) -> Arc<SubsystemCounters> {
        if let Some(c) = self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
        {
            return Arc::clone(c);
        }
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(records.entry(name.to_string()).or_default())
    }

    fn existing(&self, name: &str) -> Option<Arc<SubsystemCounters>> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Record one physical write and how long it took
    pub fn record_write(&self, name: &str, duration: Duration) {
        let c = self.counters(name);
        c.total_write_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        c.write_count.fetch_add(1, Ordering::Relaxed);
        debug!("Write time for {}: {:.2}ms", name, duration.as_secs_f64() * 1000.0);
    }

    pub fn record_error(&self, name: &str) {
        self.counters(name).error_count.fetch_add(1, Ordering::Relaxed);
        warn!("I/O error recorded for {}", name);
    }

    pub fn average_write_ms(&self, name: &str) -> f64 {
        let Some(c) = self.existing(name) else {
            return 0.0;
        };
        let count = c.write_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        c.total_write_us.load(Ordering::Relaxed) as f64 / count as f64 / 1000.0
    }

    pub fn total_writes(&self, name: &str) -> u64 {
        self.existing(name)
            .map(|c| c.write_count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn error_count(&self, name: &str) -> u64 {
        self.existing(name)
            .map(|c| c.error_count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Snapshot of every subsystem seen so far, sorted by name
    pub fn snapshot(&self) -> Vec<SubsystemMetrics> {
        let mut names: Vec<String> = self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();

        names
            .into_iter()
            .map(|name| SubsystemMetrics {
                writes: self.total_writes(&name),
                errors: self.error_count(&name),
                average_write_ms: self.average_write_ms(&name),
                subsystem: name,
            })
            .collect()
    }

    pub fn summary(&self) -> String {
        let mut summary = String::from("=== ASYNC I/O METRICS ===\n");
        for m in self.snapshot() {
            let _ = writeln!(
                summary,
                "{}: {:.2}ms avg, {} saves, {} errors",
                m.subsystem, m.average_write_ms, m.writes, m.errors
            );
        }
        summary
    }

    pub fn log_metrics(&self) {
        info!("{}", self.summary());
    }
}
