use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use havoc_core::HavocError;
use havoc_executor::STRESS_NG;
use havoc_scheduler::WheelConfig;

/// havoc agent configuration.
///
/// Layered lowest to highest: defaults, the TOML file named by
/// `HAVOC_CONFIG`, `HAVOC_*` environment variables, command-line flags.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server bind address
    pub bind_address: String,
    /// HTTP server port
    pub port: u16,
    /// SQLite database path
    pub db_path: String,
    /// Directory for rotated JSON logs; console only when unset
    pub log_dir: Option<String>,
    /// Log level
    pub log_level: String,
    /// stress-ng executable
    pub stress_bin: String,
    /// Time wheel tick in milliseconds
    pub tick_ms: u64,
    /// Time wheel slot count
    pub slots: usize,
}

impl Default for Config {
    fn default() -> Self {
        let wheel = WheelConfig::default();
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 31767,
            db_path: "havoc.db".to_string(),
            log_dir: None,
            log_level: "info".to_string(),
            stress_bin: STRESS_NG.to_string(),
            tick_ms: wheel.frequency.as_millis() as u64,
            slots: wheel.slot_num,
        }
    }
}

impl Config {
    /// Load configuration from the optional TOML file and the environment.
    pub fn from_env() -> Result<Self> {
        let base = match std::env::var("HAVOC_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        let config = base.with_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), HavocError> {
        if self.tick_ms == 0 {
            return Err(HavocError::Config("tick_ms must be greater than zero".into()));
        }
        if self.slots == 0 {
            return Err(HavocError::Config("slots must be greater than zero".into()));
        }
        if self.stress_bin.trim().is_empty() {
            return Err(HavocError::Config("stress_bin must not be empty".into()));
        }
        Ok(())
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Apply `HAVOC_*` variables resolved through `lookup`. Unparseable
    /// numbers keep the current value.
    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(bind) = lookup("HAVOC_BIND") {
            self.bind_address = bind;
        }
        if let Some(port) = lookup("HAVOC_PORT").and_then(|p| p.parse().ok()) {
            self.port = port;
        }
        if let Some(db) = lookup("HAVOC_DB") {
            self.db_path = db;
        }
        if let Some(dir) = lookup("HAVOC_LOG_DIR") {
            self.log_dir = Some(dir).filter(|d| !d.is_empty());
        }
        if let Some(level) = lookup("RUST_LOG") {
            self.log_level = level;
        }
        if let Some(bin) = lookup("HAVOC_STRESS_BIN") {
            self.stress_bin = bin;
        }
        if let Some(ms) = lookup("HAVOC_TICK_MS").and_then(|v| v.parse().ok()) {
            self.tick_ms = ms;
        }
        if let Some(slots) = lookup("HAVOC_SLOTS").and_then(|v| v.parse().ok()) {
            self.slots = slots;
        }
        self
    }

    pub fn wheel_config(&self) -> WheelConfig {
        WheelConfig {
            frequency: Duration::from_millis(self.tick_ms),
            slot_num: self.slots,
        }
    }

    /// Base URL client subcommands use to reach a local daemon.
    pub fn server_url(&self) -> String {
        let host = match self.bind_address.as_str() {
            "0.0.0.0" | "::" | "" => "127.0.0.1",
            other => other,
        };
        format!("http://{}:{}", host, self.port)
    }
}
