use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HavocError, Result};
use crate::traits::AttackCommand;

/// Upper bound for `duration_secs` and `cron_interval_secs`: one year.
pub const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

/// Stressor selected by a stress command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StressAction {
    Cpu,
    Mem,
}

impl StressAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            StressAction::Cpu => "cpu",
            StressAction::Mem => "mem",
        }
    }
}

impl fmt::Display for StressAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StressAction {
    type Err = HavocError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cpu" => Ok(StressAction::Cpu),
            "mem" | "memory" => Ok(StressAction::Mem),
            other => Err(HavocError::Validation(format!(
                "unsupported stress action '{other}'"
            ))),
        }
    }
}

/// A CPU or memory stress attack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StressCommand {
    pub action: String,
    /// CPU load percentage per worker (cpu only).
    pub load: u32,
    pub workers: u32,
    /// Bytes per vm worker, e.g. `256M` (mem only).
    pub size: Option<String>,
    /// Extra stressor flags passed through verbatim.
    pub options: Vec<String>,
    pub duration_secs: u64,
    /// Seconds between the end of one active phase and the start of the next.
    pub cron_interval_secs: u64,
    /// Filled in once the stressor process is running.
    pub pid: Option<u32>,
}

impl StressCommand {
    pub fn cpu(load: u32, workers: u32, duration_secs: u64) -> Self {
        Self {
            action: StressAction::Cpu.to_string(),
            load,
            workers,
            duration_secs,
            ..Default::default()
        }
    }

    pub fn mem(size: impl Into<String>, workers: u32, duration_secs: u64) -> Self {
        Self {
            action: StressAction::Mem.to_string(),
            size: Some(size.into()),
            workers,
            duration_secs,
            ..Default::default()
        }
    }

    pub fn every(mut self, cron_interval_secs: u64) -> Self {
        self.cron_interval_secs = cron_interval_secs;
        self
    }

    pub fn stress_action(&self) -> Result<StressAction> {
        self.action.parse()
    }
}

impl AttackCommand for StressCommand {
    fn validate(&self) -> Result<()> {
        if self.action.is_empty() {
            return Err(HavocError::Validation("action not provided".to_string()));
        }
        self.stress_action()?;
        if self.load > 100 {
            return Err(HavocError::Validation(format!(
                "load must be between 0 and 100, got {}",
                self.load
            )));
        }
        for (field, secs) in [
            ("duration", self.duration_secs),
            ("cron_interval", self.cron_interval_secs),
        ] {
            if secs > MAX_DURATION_SECS {
                return Err(HavocError::Validation(format!(
                    "{field} must not exceed {MAX_DURATION_SECS}s, got {secs}s"
                )));
            }
        }
        Ok(())
    }

    fn action(&self) -> &str {
        &self.action
    }

    fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    fn cron_interval(&self) -> Duration {
        Duration::from_secs(self.cron_interval_secs)
    }
}
