pub mod registry;
pub mod scheduler;
pub mod timewheel;

pub use registry::{ExperimentGuard, RegistryEntry, TaskRegistry};
pub use scheduler::AttackScheduler;
pub use timewheel::{TaskFn, TaskHandle, TimeWheel, WheelConfig};
