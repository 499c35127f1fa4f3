pub mod args;
pub mod process;
pub mod stress;

pub use process::{ProcessTable, SystemProcessTable};
pub use stress::{StressAttack, STRESS_NG};
