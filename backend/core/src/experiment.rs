use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::HavocError;

/// The persisted record of one attack instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Experiment {
    pub uid: Uuid,
    pub kind: AttackKind,
    pub action: String,
    pub status: ExperimentStatus,
    /// Last error text, empty when the experiment has not failed.
    #[serde(rename = "error")]
    pub message: String,
    /// Serialized attack command, enough to undo the attack's effect.
    pub recover_command: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Experiment {
    pub fn new(
        kind: AttackKind,
        action: impl Into<String>,
        recover_command: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            uid: Uuid::new_v4(),
            kind,
            action: action.into(),
            status: ExperimentStatus::Created,
            message: String::new(),
            recover_command: recover_command.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Category of attack.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AttackKind {
    Stress,
    Network,
    Process,
}

impl AttackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttackKind::Stress => "stress",
            AttackKind::Network => "network",
            AttackKind::Process => "process",
        }
    }
}

impl fmt::Display for AttackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttackKind {
    type Err = HavocError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stress" => Ok(AttackKind::Stress),
            "network" => Ok(AttackKind::Network),
            "process" => Ok(AttackKind::Process),
            other => Err(HavocError::Validation(format!("unknown attack kind '{other}'"))),
        }
    }
}

/// Lifecycle status of an experiment.
///
/// One-shot attacks move `Created -> Running -> Success | Error`; recurring
/// attacks cycle `Running <-> Waiting` until recovered. `Destroyed` (manual
/// recovery) and `Revoked` (agent shutdown) are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Created,
    Running,
    Waiting,
    Success,
    Error,
    Destroyed,
    Revoked,
}

impl ExperimentStatus {
    pub const ALL: [ExperimentStatus; 7] = [
        ExperimentStatus::Created,
        ExperimentStatus::Running,
        ExperimentStatus::Waiting,
        ExperimentStatus::Success,
        ExperimentStatus::Error,
        ExperimentStatus::Destroyed,
        ExperimentStatus::Revoked,
    ];

    /// Statuses in which the scheduler still owns pending work for the experiment.
    pub const ACTIVE: [ExperimentStatus; 3] = [
        ExperimentStatus::Created,
        ExperimentStatus::Running,
        ExperimentStatus::Waiting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentStatus::Created => "created",
            ExperimentStatus::Running => "running",
            ExperimentStatus::Waiting => "waiting",
            ExperimentStatus::Success => "success",
            ExperimentStatus::Error => "error",
            ExperimentStatus::Destroyed => "destroyed",
            ExperimentStatus::Revoked => "revoked",
        }
    }

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    /// No transition leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExperimentStatus::Success | ExperimentStatus::Destroyed | ExperimentStatus::Revoked
        )
    }

    /// The transition table. `Created` is never a target.
    pub fn can_transition_to(&self, next: ExperimentStatus) -> bool {
        use ExperimentStatus::*;
        match self {
            Created => matches!(next, Running | Error | Destroyed | Revoked),
            Running => matches!(next, Waiting | Success | Error | Destroyed | Revoked),
            Waiting => matches!(next, Running | Error | Destroyed | Revoked),
            Error => matches!(next, Destroyed | Revoked),
            Success | Destroyed | Revoked => false,
        }
    }

    /// Check a transition, returning `InvalidTransition` when the table forbids it.
    pub fn transition(self, next: ExperimentStatus) -> Result<ExperimentStatus, HavocError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(HavocError::InvalidTransition { from: self, to: next })
        }
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExperimentStatus {
    type Err = HavocError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| HavocError::Validation(format!("unknown experiment status '{s}'")))
    }
}
