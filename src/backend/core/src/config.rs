//! Configuration management.

use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;
use crate::telemetry::LoggingConfig;

/// Engine configuration shared by every entity built from a schema.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on a single async rule run
    #[serde(default = "default_async_rule_timeout", with = "humantime_serde")]
    pub async_rule_timeout: Duration,

    /// Re-entrant write depth at which cascading stops
    #[serde(default = "default_max_cascade_depth")]
    pub max_cascade_depth: usize,

    /// Capacity of each entity's change notification channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Run a full rule pass when a schema creates a new entity
    #[serde(default = "default_true")]
    pub check_rules_on_create: bool,

    /// Run a full rule pass after reconstructing a node from storage
    #[serde(default = "default_true")]
    pub check_rules_on_fetch: bool,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            async_rule_timeout: default_async_rule_timeout(),
            max_cascade_depth: default_max_cascade_depth(),
            event_buffer: default_event_buffer(),
            check_rules_on_create: default_true(),
            check_rules_on_fetch: default_true(),
            logging: LoggingConfig::default(),
        }
    }
}

// Default value functions
fn default_async_rule_timeout() -> Duration { Duration::from_secs(30) }
fn default_max_cascade_depth() -> usize { 32 }
fn default_event_buffer() -> usize { 256 }
fn default_true() -> bool { true }

impl EngineConfig {
    /// Load configuration from the environment (`TRELLIS__*`).
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("TRELLIS").separator("__"))
            .build()?;

        let cfg: EngineConfig = config.try_deserialize()?;
        cfg.validated()
    }

    /// Load from a specific file path, with the environment layered on top.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("TRELLIS").separator("__"))
            .build()?;

        let cfg: EngineConfig = config.try_deserialize()?;
        cfg.validated()
    }

    fn validated(self) -> Result<Self> {
        if self.max_cascade_depth == 0 {
            return Err(crate::error::TrellisError::configuration(
                "max_cascade_depth must be at least 1",
            ));
        }
        if self.event_buffer == 0 {
            return Err(crate::error::TrellisError::configuration(
                "event_buffer must be at least 1",
            ));
        }
        Ok(self)
    }
}
