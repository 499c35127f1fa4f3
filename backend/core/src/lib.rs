pub mod error;
pub mod experiment;
pub mod stress;
pub mod traits;

pub use error::{HavocError, Result};
pub use experiment::{AttackKind, Experiment, ExperimentStatus};
pub use stress::{StressAction, StressCommand, MAX_DURATION_SECS};
pub use traits::{Attack, AttackCommand, ExperimentStore};
