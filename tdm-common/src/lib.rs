//! # TDM Common Library
//!
//! Shared code for the training-data persistence layer:
//! - Error type used by every crate in the workspace
//! - TOML configuration loading and per-subsystem feature flags
//! - Registry of the learning subsystems that persist state
//! - Persistence event types and the EventBus

pub mod config;
pub mod error;
pub mod events;
pub mod subsystem;

pub use error::{Error, Result};
pub use subsystem::{default_file_name, feature_key, KNOWN_SUBSYSTEMS};
