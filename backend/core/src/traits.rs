use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{HavocError, Result};
use crate::experiment::{AttackKind, Experiment, ExperimentStatus};

/// Parameters of one attack instance.
///
/// The serialized form is persisted as the experiment's recover command and
/// must round-trip, since recovery rebuilds the command from it.
pub trait AttackCommand: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Reject malformed commands before any state is created.
    fn validate(&self) -> Result<()>;

    fn action(&self) -> &str;

    /// How long the effect stays active per cycle.
    fn duration(&self) -> Duration;

    /// Pause between cycles; zero means one-shot.
    fn cron_interval(&self) -> Duration;

    fn is_recurring(&self) -> bool {
        !self.cron_interval().is_zero()
    }

    fn to_recover_command(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| HavocError::Other(anyhow::anyhow!("serialize attack command: {e}")))
    }

    fn from_recover_command(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| HavocError::Persistence(format!("corrupt recover command: {e}")))
    }
}

/// An attack kind the scheduler can drive: start the effect, and undo it.
#[async_trait]
pub trait Attack: Send + Sync + 'static {
    type Command: AttackCommand;

    fn kind(&self) -> AttackKind;

    /// Start the effect. Implementations record whatever recovery needs
    /// (e.g. the pid) on `command`.
    async fn start(&self, command: &mut Self::Command) -> Result<()>;

    /// Undo the effect. An effect that is already gone counts as recovered.
    async fn recover(&self, command: &Self::Command) -> Result<()>;
}

/// Durable record of experiments, shared between the scheduler and API handlers.
///
/// Implementations must be safe under concurrent calls and must reject
/// status writes the transition table forbids.
pub trait ExperimentStore: Send + Sync {
    fn set(&self, experiment: &Experiment) -> Result<()>;

    fn update(
        &self,
        uid: &Uuid,
        status: ExperimentStatus,
        message: &str,
        recover_command: &str,
    ) -> Result<()>;

    fn find_by_uid(&self, uid: &Uuid) -> Result<Option<Experiment>>;

    fn list(&self) -> Result<Vec<Experiment>>;

    fn list_by_status(&self, status: ExperimentStatus) -> Result<Vec<Experiment>>;

    fn get_status(&self, uid: &Uuid) -> Result<ExperimentStatus> {
        self.find_by_uid(uid)?
            .map(|exp| exp.status)
            .ok_or(HavocError::NotFound(*uid))
    }
}
