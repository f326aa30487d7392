//! Typed configuration.
//!
//! [`ControllerConfig`] carries the declarative controller options and can
//! be read from a TOML file or from `RECONCILE_*` environment variables.
//! [`Config`] holds process-level settings for the daemon. Both fail fast on
//! missing or malformed values.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

pub const DEFAULT_MAX_CONCURRENT_RECONCILES: usize = 1;
pub const DEFAULT_CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(120);

/// Declarative controller options (everything except code).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerConfig {
    /// Required. Label for logs and metrics.
    pub name: String,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_reconciles: usize,
    #[serde(default = "default_cache_sync_timeout_ms")]
    pub cache_sync_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub recover_panic: bool,
    #[serde(default = "default_true")]
    pub leader_elected: bool,
    #[serde(default)]
    pub enable_warmup: bool,
}

fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT_RECONCILES
}

fn default_cache_sync_timeout_ms() -> u64 {
    DEFAULT_CACHE_SYNC_TIMEOUT.as_millis() as u64
}

fn default_true() -> bool {
    true
}

impl ControllerConfig {
    /// Defaults for everything but the name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_concurrent_reconciles: DEFAULT_MAX_CONCURRENT_RECONCILES,
            cache_sync_timeout_ms: default_cache_sync_timeout_ms(),
            recover_panic: true,
            leader_elected: true,
            enable_warmup: false,
        }
    }

    pub fn cache_sync_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_sync_timeout_ms)
    }

    /// Parse from a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::Config(format!("bad controller config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load from `RECONCILE_NAME` (required), `RECONCILE_MAX_CONCURRENT`,
    /// `RECONCILE_CACHE_SYNC_TIMEOUT_MS`, `RECONCILE_RECOVER_PANIC`,
    /// `RECONCILE_LEADER_ELECTED` and `RECONCILE_ENABLE_WARMUP`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::named(required_var("RECONCILE_NAME")?);
        if let Some(v) = parsed_var("RECONCILE_MAX_CONCURRENT")? {
            config.max_concurrent_reconciles = v;
        }
        if let Some(v) = parsed_var("RECONCILE_CACHE_SYNC_TIMEOUT_MS")? {
            config.cache_sync_timeout_ms = v;
        }
        if let Some(v) = parsed_var("RECONCILE_RECOVER_PANIC")? {
            config.recover_panic = v;
        }
        if let Some(v) = parsed_var("RECONCILE_LEADER_ELECTED")? {
            config.leader_elected = v;
        }
        if let Some(v) = parsed_var("RECONCILE_ENABLE_WARMUP")? {
            config.enable_warmup = v;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("controller name is required".to_string()));
        }
        if self.max_concurrent_reconciles == 0 {
            return Err(Error::Config(format!(
                "controller {}: max_concurrent_reconciles must be at least 1",
                self.name
            )));
        }
        Ok(())
    }
}

/// Process-level settings for the daemon.
#[derive(Debug, Clone)]
pub struct Config {
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("invalid value for {name}: {e}"))),
        Err(_) => Ok(None),
    }
}
