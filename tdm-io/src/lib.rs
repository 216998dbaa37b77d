//! # Training Data I/O (tdm-io)
//!
//! Coordinated asynchronous persistence for the chess engine's learning
//! subsystems.
//!
//! **Components** (leaves first):
//! - [`tracker`]: which subsystems are mid-operation
//! - [`coordinator`]: phase exclusion and shared I/O admission
//! - [`manager`]: saves, loads, dirty tracking and lifecycle phases
//! - [`facade`]: per-subsystem routing with a synchronous fallback
//! - [`metrics`]: write timing and error counters, used by the manager

pub mod context;
pub mod coordinator;
pub mod facade;
pub mod manager;
pub mod metrics;
pub mod tracker;

pub use context::{AssumeActive, SessionContext, TrainingStatus, UserDataGuard};
pub use facade::{FallbackReason, IoRoute, TrainingDataIo};
pub use manager::{
    FlushReport, LoadedPayload, ManagerBuilder, ModelSerializer, Payload, PayloadKind,
    PersistenceManager, SaveHandle, SaveOutcome, SkipReason,
};
pub use metrics::IoMetrics;
pub use tdm_common::{Error, Result};
