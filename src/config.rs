//! Configuration management for Turnstile.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Environment variable prefix; nested keys use `__`, e.g.
/// `TURNSTILE__ENGINE__STORAGE__BACKEND=file`.
const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for Turnstile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Engine configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Decision engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How long a cached idempotent decision stays replayable, in milliseconds
    #[serde(default = "default_idempotency_ttl_ms")]
    pub idempotency_ttl_ms: u64,

    /// Maximum number of audit events retained (oldest dropped first)
    #[serde(default = "default_max_audit_events")]
    pub max_audit_events: usize,

    /// State storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idempotency_ttl_ms: default_idempotency_ttl_ms(),
            max_audit_events: default_max_audit_events(),
            storage: StorageConfig::default(),
        }
    }
}

fn default_idempotency_ttl_ms() -> u64 {
    10 * 60 * 1000
}

fn default_max_audit_events() -> usize {
    10_000
}

/// Which storage provider backs the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    /// Volatile, nothing survives a restart
    #[default]
    Memory,
    /// JSON snapshot file rewritten after every mutation
    File,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend selection
    #[serde(default)]
    pub backend: StorageBackendKind,

    /// Snapshot path used by the file backend
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::default(),
            state_file: default_state_file(),
        }
    }
}

fn default_state_file() -> PathBuf {
    PathBuf::from("artifacts/turnstile/runtime-state.json")
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TurnstileConfig {
    /// Load configuration from an optional file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Load configuration from a file path without environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(true))
            .build()?;
        Ok(config.try_deserialize()?)
    }
}
