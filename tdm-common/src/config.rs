//! Configuration loading and per-subsystem feature flags
//!
//! Configuration is a single optional TOML file. Every field has a compiled
//! default, so a missing file (or a file that only sets a few keys) never
//! prevents startup.
//!
//! # Config File Resolution
//!
//! 1. Command-line argument (highest priority)
//! 2. `TDM_CONFIG` environment variable
//! 3. `<platform config dir>/tdm/config.toml`
//! 4. Compiled defaults (no file)

use crate::subsystem::{feature_key, KNOWN_SUBSYSTEMS};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable naming the config file
pub const CONFIG_ENV_VAR: &str = "TDM_CONFIG";

/// Top-level TOML configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Root folder for relative training-data file names
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Default for every subsystem's async flag when not set explicitly
    #[serde(default = "default_true")]
    pub async_enabled: bool,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// I/O tuning
    #[serde(default)]
    pub io: IoSettings,

    /// Per-subsystem switches, keyed by feature key (see [`feature_key`])
    #[serde(default)]
    pub subsystems: HashMap<String, SubsystemToggle>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// I/O tuning parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoSettings {
    /// Size of the I/O worker pool
    ///
    /// Default: one worker per known subsystem, so no subsystem's save can
    /// starve another's.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Completion tracker poll interval in milliseconds
    #[serde(default = "default_quiescence_poll_ms")]
    pub quiescence_poll_ms: u64,

    /// Number of polls before quiescence wait gives up
    ///
    /// The wait is best effort: on exhaustion the remaining active
    /// subsystems are logged and the phase proceeds.
    #[serde(default = "default_quiescence_max_attempts")]
    pub quiescence_max_attempts: u32,

    /// Window in which an identical payload for the same file is skipped
    #[serde(default = "default_dedupe_window_ms")]
    pub dedupe_window_ms: u64,

    /// Minimum spacing between two writes of the same model archive
    #[serde(default = "default_model_debounce_secs")]
    pub model_debounce_secs: u64,

    /// Per-file-class model debounce, keyed by a file-name substring
    #[serde(default = "default_model_debounce_overrides")]
    pub model_debounce_overrides: HashMap<String, u64>,

    /// Upper bound a caller waits for one lifecycle phase
    #[serde(default = "default_phase_timeout_secs")]
    pub phase_timeout_secs: u64,

    /// Event bus buffer size
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

/// Per-subsystem switches
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubsystemToggle {
    /// Subsystem enabled at all (unset = enabled)
    #[serde(default)]
    pub enabled: Option<bool>,

    /// Coordinated async path enabled (unset = global `async_enabled`)
    #[serde(default, rename = "async")]
    pub async_io: Option<bool>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("training_data")
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_worker_threads() -> usize {
    KNOWN_SUBSYSTEMS.len()
}

fn default_quiescence_poll_ms() -> u64 {
    1000
}

fn default_quiescence_max_attempts() -> u32 {
    5
}

fn default_dedupe_window_ms() -> u64 {
    1000
}

fn default_model_debounce_secs() -> u64 {
    30 * 60
}

fn default_model_debounce_overrides() -> HashMap<String, u64> {
    HashMap::from([("alphazero".to_string(), 30)])
}

fn default_phase_timeout_secs() -> u64 {
    30
}

fn default_event_capacity() -> usize {
    256
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            async_enabled: true,
            logging: LoggingConfig::default(),
            io: IoSettings::default(),
            subsystems: HashMap::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for IoSettings {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            quiescence_poll_ms: default_quiescence_poll_ms(),
            quiescence_max_attempts: default_quiescence_max_attempts(),
            dedupe_window_ms: default_dedupe_window_ms(),
            model_debounce_secs: default_model_debounce_secs(),
            model_debounce_overrides: default_model_debounce_overrides(),
            phase_timeout_secs: default_phase_timeout_secs(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl IoSettings {
    pub fn quiescence_poll_interval(&self) -> Duration {
        Duration::from_millis(self.quiescence_poll_ms)
    }

    pub fn dedupe_window(&self) -> Duration {
        Duration::from_millis(self.dedupe_window_ms)
    }

    pub fn phase_timeout(&self) -> Duration {
        Duration::from_secs(self.phase_timeout_secs)
    }

    /// Debounce interval for a model archive file
    ///
    /// The first override whose key appears in the file name (case-insensitive)
    /// wins; keys are checked longest first so more specific classes take
    /// precedence.
    pub fn model_debounce_for(&self, file_name: &str) -> Duration {
        let lower = file_name.to_ascii_lowercase();
        let mut keys: Vec<&String> = self.model_debounce_overrides.keys().collect();
        keys.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

        for key in keys {
            if lower.contains(&key.to_ascii_lowercase()) {
                return Duration::from_secs(self.model_debounce_overrides[key]);
            }
        }
        Duration::from_secs(self.model_debounce_secs)
    }

    /// Reject values that would deadlock or disable the pool
    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(Error::Config("io.worker_threads must be at least 1".to_string()));
        }
        if self.event_capacity == 0 {
            return Err(Error::Config("io.event_capacity must be at least 1".to_string()));
        }
        Ok(())
    }
}

impl TomlConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: TomlConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse TOML: {}", e)))?;
        config.io.validate()?;
        Ok(config)
    }

    /// Load configuration from an existing file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        let config = Self::from_toml_str(&content)?;
        info!("Loaded TOML configuration from {:?}", path);
        Ok(config)
    }

    /// Load configuration, falling back to compiled defaults
    ///
    /// A missing file is not an error: a warning is logged and defaults are
    /// used. A file that exists but does not parse is an error.
    pub fn load_or_default(cli_arg: Option<&Path>) -> Result<Self> {
        match resolve_config_path(cli_arg) {
            Some(path) if path.exists() => Self::load(&path),
            Some(path) => {
                warn!("Config file {:?} not found, using compiled defaults", path);
                Ok(Self::default())
            }
            None => {
                info!("No config file found, using compiled defaults");
                Ok(Self::default())
            }
        }
    }

    /// Feature flags derived from this configuration
    pub fn feature_flags(&self) -> FeatureFlags {
        FeatureFlags::from_config(self)
    }
}

/// Locate the config file following the documented priority order
///
/// Returns the CLI or environment path even if it does not exist (the caller
/// reports it); the platform path is only returned when present.
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    dirs::config_dir()
        .map(|d| d.join("tdm").join("config.toml"))
        .filter(|p| p.exists())
}

/// Per-subsystem enable and async switches
///
/// Looked up on every call so environment overrides take effect without a
/// restart. Override variables are `TDM_<KEY>_ENABLED` and `TDM_<KEY>_ASYNC`
/// where `<KEY>` is the upper-cased feature key (`TDM_DQN_ASYNC=false`).
#[derive(Debug, Clone)]
pub struct FeatureFlags {
    global_async: bool,
    toggles: HashMap<String, SubsystemToggle>,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            global_async: true,
            toggles: HashMap::new(),
        }
    }
}

impl FeatureFlags {
    pub fn from_config(config: &TomlConfig) -> Self {
        let toggles = config
            .subsystems
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
            .collect();
        Self {
            global_async: config.async_enabled,
            toggles,
        }
    }

    /// Set the enabled switch for a subsystem (and all its aliases)
    pub fn set_enabled(&mut self, name: &str, enabled: bool) {
        self.toggles.entry(feature_key(name)).or_default().enabled = Some(enabled);
    }

    /// Set the async switch for a subsystem (and all its aliases)
    pub fn set_async(&mut self, name: &str, async_io: bool) {
        self.toggles.entry(feature_key(name)).or_default().async_io = Some(async_io);
    }

    /// Is the subsystem enabled at all
    pub fn is_enabled(&self, name: &str) -> bool {
        let key = feature_key(name);
        if let Some(value) = env_override(&key, "ENABLED") {
            return value;
        }
        self.toggles
            .get(&key)
            .and_then(|t| t.enabled)
            .unwrap_or(true)
    }

    /// Is the coordinated async path enabled for the subsystem
    pub fn is_async_enabled(&self, name: &str) -> bool {
        let key = feature_key(name);
        if let Some(value) = env_override(&key, "ASYNC") {
            return value;
        }
        self.toggles
            .get(&key)
            .and_then(|t| t.async_io)
            .unwrap_or(self.global_async)
    }
}

fn env_override(key: &str, suffix: &str) -> Option<bool> {
    let var = format!("TDM_{}_{}", key.to_ascii_uppercase(), suffix);
    let value = std::env::var(&var).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!("Ignoring {}={:?}: expected a boolean", var, value);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_worker_threads_matches_subsystems() {
        assert_eq!(IoSettings::default().worker_threads, 11);
    }

    #[test]
    fn test_model_debounce_override() {
        let io = IoSettings::default();
        assert_eq!(io.model_debounce_for("alphazero_policy.zip"), Duration::from_secs(30));
        assert_eq!(io.model_debounce_for("AlphaZero-Value.zip"), Duration::from_secs(30));
        assert_eq!(io.model_debounce_for("cnn_model.zip"), Duration::from_secs(1800));
    }

    #[test]
    fn test_longest_override_wins() {
        let mut io = IoSettings::default();
        io.model_debounce_overrides.insert("dqn".to_string(), 60);
        io.model_debounce_overrides.insert("dqn_target".to_string(), 5);
        assert_eq!(io.model_debounce_for("dqn_target_model.zip"), Duration::from_secs(5));
        assert_eq!(io.model_debounce_for("dqn_model.zip"), Duration::from_secs(60));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let result = TomlConfig::from_toml_str("[io]\nworker_threads = 0\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
