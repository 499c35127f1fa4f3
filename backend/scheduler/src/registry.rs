//! Task registry: which wheel task is pending for each experiment.
//!
//! An entry exists while the scheduler still owns pending work for the
//! experiment, and always points at the *next* relevant task (the cycle
//! start or the recovery), never a history. Recurring experiments also keep
//! their cron handle so manual recovery can cancel both.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::timewheel::TaskHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryEntry {
    /// The task that fires next for this experiment.
    pub next: TaskHandle,
    /// The recurring task driving cycle starts, if any.
    pub cycle: Option<TaskHandle>,
}

impl RegistryEntry {
    /// Every distinct handle in the entry.
    pub fn handles(&self) -> Vec<TaskHandle> {
        match self.cycle {
            Some(cycle) if cycle != self.next => vec![self.next, cycle],
            _ => vec![self.next],
        }
    }
}

#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<Uuid, RegistryEntry>>,
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `task` as the next pending task for `uid`, keeping any cycle
    /// handle. Returns the superseded task.
    pub fn store(&self, uid: Uuid, task: TaskHandle) -> Option<TaskHandle> {
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        match tasks.get_mut(&uid) {
            Some(entry) => Some(std::mem::replace(&mut entry.next, task)),
            None => {
                tasks.insert(
                    uid,
                    RegistryEntry {
                        next: task,
                        cycle: None,
                    },
                );
                None
            }
        }
    }

    /// Record a recurring task; it is both the cycle and the next task.
    pub fn store_cycle(&self, uid: Uuid, cycle: TaskHandle) {
        self.tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                uid,
                RegistryEntry {
                    next: cycle,
                    cycle: Some(cycle),
                },
            );
    }

    pub fn load(&self, uid: &Uuid) -> Option<RegistryEntry> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uid)
            .copied()
    }

    pub fn remove(&self, uid: &Uuid) -> Option<RegistryEntry> {
        self.tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(uid)
    }

    pub fn len(&self) -> usize {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Acquire the per-experiment lock. Every check-and-act on an experiment's
    /// status runs under it, so an automatic recovery and a manual recover of
    /// the same uid never interleave.
    ///
    /// The lock lives only while someone holds or awaits it; the last guard
    /// to drop removes it from the map.
    pub async fn lock(&self, uid: Uuid) -> ExperimentGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(uid).or_default())
        };
        ExperimentGuard {
            registry: self,
            uid,
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Number of per-experiment locks currently held or awaited.
    pub fn lock_count(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn release(&self, uid: &Uuid) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Clones exist only in guards and in tasks waiting to lock.
        if locks.get(uid).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(uid);
        }
    }
}

/// Exclusive access to one experiment, from [`TaskRegistry::lock`].
pub struct ExperimentGuard<'a> {
    registry: &'a TaskRegistry,
    uid: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ExperimentGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.registry.release(&self.uid);
    }
}
