use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use havoc_core::{
    Attack, AttackCommand, Experiment, ExperimentStatus, ExperimentStore, HavocError, Result,
};

use crate::registry::TaskRegistry;
use crate::timewheel::{TimeWheel, WheelConfig};

/// Drives attacks through their lifecycle: starts them, schedules automatic
/// recovery on the time wheel, repeats recurring attacks, and handles manual
/// recovery.
///
/// Cheap to clone; clones share the same wheel, registry, and store.
pub struct AttackScheduler<A: Attack> {
    inner: Arc<Inner<A>>,
}

impl<A: Attack> Clone for AttackScheduler<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<A: Attack> {
    store: Arc<dyn ExperimentStore>,
    attack: Arc<A>,
    wheel: Arc<TimeWheel>,
    registry: TaskRegistry,
    shutdown_tx: watch::Sender<bool>,
    wheel_loop: Mutex<Option<JoinHandle<()>>>,
}

impl<A: Attack> AttackScheduler<A> {
    pub fn new(store: Arc<dyn ExperimentStore>, attack: A, config: WheelConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                store,
                attack: Arc::new(attack),
                wheel: Arc::new(TimeWheel::new(config)),
                registry: TaskRegistry::new(),
                shutdown_tx,
                wheel_loop: Mutex::new(None),
            }),
        }
    }

    /// Start ticking the time wheel in the background. Idempotent.
    pub fn start(&self) {
        let mut wheel_loop = self
            .inner
            .wheel_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if wheel_loop.is_none() {
            let handle = self.inner.wheel.start(self.inner.shutdown_tx.subscribe());
            *wheel_loop = Some(handle);
            info!(kind = %self.inner.attack.kind(), "Attack scheduler started");
        }
    }

    pub fn wheel(&self) -> &Arc<TimeWheel> {
        &self.inner.wheel
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.inner.registry
    }

    /// Validate and register an attack.
    ///
    /// One-shot attacks start immediately; a start failure is returned and the
    /// experiment is left in `Error`. Recurring attacks start their first
    /// cycle after `duration + cron_interval`.
    pub async fn schedule(&self, command: A::Command) -> Result<Uuid> {
        command.validate()?;
        let period = command
            .duration()
            .checked_add(command.cron_interval())
            .ok_or_else(|| HavocError::Validation("duration plus cron interval overflows".into()))?;

        let inner = &self.inner;
        let experiment = Experiment::new(
            inner.attack.kind(),
            command.action(),
            command.to_recover_command()?,
        );
        let uid = experiment.uid;
        // Held from before the record exists, so a recover sees it fully scheduled.
        let _guard = inner.registry.lock(uid).await;
        inner.store.set(&experiment)?;
        info!(
            uid = %uid,
            kind = %experiment.kind,
            action = %experiment.action,
            duration_secs = command.duration().as_secs(),
            cron_interval_secs = command.cron_interval().as_secs(),
            "Experiment created"
        );

        if !command.is_recurring() {
            inner.start_attack(uid, command).await?;
            return Ok(uid);
        }

        let status = inner.store.get_status(&uid)?;
        if status != ExperimentStatus::Created {
            info!(uid = %uid, status = %status, "Experiment left Created before its first cycle was scheduled");
            return Ok(uid);
        }

        let weak = Arc::downgrade(inner);
        let cycle = inner.wheel.add_cron(period, move || {
            let weak = Weak::clone(&weak);
            let command = command.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.run_cycle(uid, command).await;
                }
            }
        });
        inner.registry.store_cycle(uid, cycle);
        debug!(uid = %uid, task = cycle.id(), period_secs = period.as_secs(), "Recurring attack scheduled");

        Ok(uid)
    }

    /// Manually recover an attack, cancelling any pending automatic work.
    ///
    /// Recovering an experiment that already finished (`success`,
    /// `destroyed`, `revoked`) is a no-op. If stopping the attack fails the
    /// error is returned and the status is left unchanged so the caller can
    /// retry.
    pub async fn recover(&self, uid: &Uuid) -> Result<()> {
        let inner = &self.inner;
        let _guard = inner.registry.lock(*uid).await;

        let experiment = inner.find(uid)?;
        let status = experiment.status;
        if status.is_terminal() {
            info!(uid = %uid, status = %status, "Experiment already finished, nothing to recover");
            return Ok(());
        }

        let entry = inner.registry.load(uid);
        match entry {
            None if matches!(status, ExperimentStatus::Running | ExperimentStatus::Waiting) => {
                error!(uid = %uid, status = %status, "No scheduled task for active experiment");
                return Err(HavocError::missing_task(*uid));
            }
            None => {}
            Some(entry) => {
                for handle in entry.handles() {
                    if inner.wheel.remove(&handle) {
                        debug!(uid = %uid, task = handle.id(), "Cancelled scheduled task");
                    }
                }
            }
        }

        if matches!(status, ExperimentStatus::Created | ExperimentStatus::Waiting) {
            inner.store.update(
                uid,
                ExperimentStatus::Destroyed,
                "",
                &experiment.recover_command,
            )?;
            inner.registry.remove(uid);
            info!(uid = %uid, from = %status, "Experiment destroyed");
            return Ok(());
        }

        let command = A::Command::from_recover_command(&experiment.recover_command)?;
        if let Err(err) = inner.attack.recover(&command).await {
            error!(uid = %uid, error = %err, "Manual recovery failed");
            return Err(err);
        }

        inner.store.update(
            uid,
            ExperimentStatus::Destroyed,
            "",
            &experiment.recover_command,
        )?;
        inner.registry.remove(uid);
        info!(uid = %uid, from = %status, "Experiment destroyed");
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<Experiment>> {
        self.inner.store.list()
    }

    pub fn list_by_status(&self, status: ExperimentStatus) -> Result<Vec<Experiment>> {
        self.inner.store.list_by_status(status)
    }

    pub fn get(&self, uid: &Uuid) -> Result<Experiment> {
        self.inner.find(uid)
    }

    /// Stop the wheel, then revoke every experiment that still has pending
    /// work, stopping its attack if one is active.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.shutdown_tx.send_replace(true);
        let wheel_loop = inner
            .wheel_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = wheel_loop {
            if let Err(e) = handle.await {
                warn!(error = %e, "Time wheel loop ended abnormally");
            }
        }

        for status in ExperimentStatus::ACTIVE {
            let experiments = match inner.store.list_by_status(status) {
                Ok(experiments) => experiments,
                Err(e) => {
                    error!(status = %status, error = %e, "Failed to list experiments to revoke");
                    continue;
                }
            };
            for experiment in experiments {
                if let Err(e) = inner.revoke(&experiment.uid).await {
                    error!(uid = %experiment.uid, error = %e, "Failed to revoke experiment");
                }
            }
        }
        info!("Attack scheduler shut down");
    }
}

impl<A: Attack> Inner<A> {
    fn find(&self, uid: &Uuid) -> Result<Experiment> {
        self.store.find_by_uid(uid)?.ok_or(HavocError::NotFound(*uid))
    }

    /// Remove every wheel task registered for `uid` and drop its entry.
    fn cancel_tasks(&self, uid: &Uuid) {
        if let Some(entry) = self.registry.remove(uid) {
            for handle in entry.handles() {
                self.wheel.remove(&handle);
            }
        }
    }

    /// Cron firing: start the next active phase of a recurring attack.
    async fn run_cycle(self: Arc<Self>, uid: Uuid, command: A::Command) {
        let _guard = self.registry.lock(uid).await;
        if let Err(e) = self.start_attack(uid, command).await {
            error!(uid = %uid, error = %e, "Attack cycle failed to start");
        }
    }

    /// Start path. Caller holds the experiment lock.
    async fn start_attack(self: &Arc<Self>, uid: Uuid, mut command: A::Command) -> Result<()> {
        let status = self.store.get_status(&uid)?;
        if !matches!(status, ExperimentStatus::Created | ExperimentStatus::Waiting) {
            debug!(uid = %uid, status = %status, "Experiment no longer schedulable, skipping start");
            return Ok(());
        }

        if let Err(err) = self.attack.start(&mut command).await {
            error!(uid = %uid, error = %err, "Failed to start attack");
            self.cancel_tasks(&uid);
            self.store.update(
                &uid,
                ExperimentStatus::Error,
                &err.to_string(),
                &command.to_recover_command()?,
            )?;
            return Err(err);
        }

        let recover_command = command.to_recover_command()?;
        if let Err(err) = self
            .store
            .update(&uid, ExperimentStatus::Running, "", &recover_command)
        {
            // Without a persisted pid nothing could recover this attack later.
            if let Err(stop_err) = self.attack.recover(&command).await {
                warn!(uid = %uid, error = %stop_err, "Failed to undo attack after store error");
            }
            return Err(err);
        }
        info!(uid = %uid, "Attack running");

        let weak = Arc::downgrade(self);
        let recovery = self.wheel.add(command.duration(), move || {
            let weak = Weak::clone(&weak);
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.auto_recover(uid).await;
                }
            }
        });
        self.registry.store(uid, recovery);
        debug!(uid = %uid, task = recovery.id(), "Recovery scheduled");
        Ok(())
    }

    /// Recovery firing at the end of an active phase.
    async fn auto_recover(self: Arc<Self>, uid: Uuid) {
        let _guard = self.registry.lock(uid).await;
        if let Err(e) = self.finish_cycle(&uid).await {
            error!(uid = %uid, error = %e, "Automatic recovery failed");
        }
    }

    async fn finish_cycle(&self, uid: &Uuid) -> Result<()> {
        let experiment = self.find(uid)?;
        if experiment.status != ExperimentStatus::Running {
            // Manual recovery or shutdown got here first.
            debug!(uid = %uid, status = %experiment.status, "Experiment not running, skipping recovery");
            return Ok(());
        }

        let command = A::Command::from_recover_command(&experiment.recover_command)?;
        if let Err(err) = self.attack.recover(&command).await {
            self.cancel_tasks(uid);
            self.store.update(
                uid,
                ExperimentStatus::Error,
                &err.to_string(),
                &experiment.recover_command,
            )?;
            return Err(err);
        }

        if command.is_recurring() {
            self.store.update(
                uid,
                ExperimentStatus::Waiting,
                "",
                &experiment.recover_command,
            )?;
            match self.registry.load(uid).and_then(|entry| entry.cycle) {
                Some(cycle) => {
                    self.registry.store(*uid, cycle);
                }
                None => warn!(uid = %uid, "Recurring experiment has no cycle task"),
            }
            info!(uid = %uid, "Attack waiting for next cycle");
        } else {
            self.store.update(
                uid,
                ExperimentStatus::Success,
                "",
                &experiment.recover_command,
            )?;
            self.registry.remove(uid);
            info!(uid = %uid, "Attack finished");
        }
        Ok(())
    }

    async fn revoke(&self, uid: &Uuid) -> Result<()> {
        let _guard = self.registry.lock(*uid).await;
        let experiment = self.find(uid)?;
        if !experiment.status.is_active() {
            return Ok(());
        }

        self.cancel_tasks(uid);
        if experiment.status == ExperimentStatus::Running {
            let command = A::Command::from_recover_command(&experiment.recover_command)?;
            self.attack.recover(&command).await?;
        }
        self.store.update(
            uid,
            ExperimentStatus::Revoked,
            "",
            &experiment.recover_command,
        )?;
        info!(uid = %uid, from = %experiment.status, "Experiment revoked");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use havoc_core::{AttackKind, StressCommand};
    use havoc_store::SqliteStore;

    #[derive(Default)]
    struct FakeState {
        next_pid: AtomicU32,
        started: Mutex<Vec<u32>>,
        stopped: Mutex<Vec<u32>>,
        fail_start: AtomicBool,
        fail_recover: AtomicBool,
    }

    impl FakeState {
        fn started(&self) -> Vec<u32> {
            self.started.lock().unwrap().clone()
        }

        fn stopped(&self) -> Vec<u32> {
            self.stopped.lock().unwrap().clone()
        }
    }

    struct FakeAttack(Arc<FakeState>);

    #[async_trait]
    impl Attack for FakeAttack {
        type Command = StressCommand;

        fn kind(&self) -> AttackKind {
            AttackKind::Stress
        }

        async fn start(&self, command: &mut StressCommand) -> Result<()> {
            if self.0.fail_start.load(Ordering::SeqCst) {
                return Err(HavocError::Execution("stress-ng not found".into()));
            }
            let pid = 1000 + self.0.next_pid.fetch_add(1, Ordering::SeqCst);
            command.pid = Some(pid);
            self.0.started.lock().unwrap().push(pid);
            Ok(())
        }

        async fn recover(&self, command: &StressCommand) -> Result<()> {
            if self.0.fail_recover.load(Ordering::SeqCst) {
                return Err(HavocError::Execution("kill failed".into()));
            }
            if let Some(pid) = command.pid {
                self.0.stopped.lock().unwrap().push(pid);
            }
            Ok(())
        }
    }

    struct Harness {
        scheduler: AttackScheduler<FakeAttack>,
        state: Arc<FakeState>,
        store: Arc<SqliteStore>,
    }

    impl Harness {
        fn new() -> Self {
            let state = Arc::new(FakeState::default());
            let store = Arc::new(SqliteStore::in_memory().unwrap());
            let scheduler = AttackScheduler::new(
                store.clone(),
                FakeAttack(Arc::clone(&state)),
                WheelConfig {
                    frequency: Duration::from_secs(1),
                    slot_num: 8,
                },
            );
            Self {
                scheduler,
                state,
                store,
            }
        }

        /// Advance the wheel `n` seconds, waiting for every fired callback.
        async fn advance(&self, n: usize) {
            for _ in 0..n {
                for handle in self.scheduler.wheel().tick() {
                    handle.await.unwrap();
                }
            }
        }

        fn status(&self, uid: &Uuid) -> ExperimentStatus {
            self.store.get_status(uid).unwrap()
        }
    }

    #[tokio::test]
    async fn test_empty_action_creates_nothing() {
        let h = Harness::new();
        let err = h.scheduler.schedule(StressCommand::default()).await.unwrap_err();
        assert!(matches!(err, HavocError::Validation(_)));
        assert!(h.scheduler.list().unwrap().is_empty());
        assert!(h.state.started().is_empty());
    }

    #[tokio::test]
    async fn test_one_shot_runs_then_succeeds() {
        let h = Harness::new();
        let uid = h.scheduler.schedule(StressCommand::cpu(80, 2, 5)).await.unwrap();

        assert_eq!(h.status(&uid), ExperimentStatus::Running);
        let pid = h.state.started()[0];
        let exp = h.scheduler.get(&uid).unwrap();
        let persisted = StressCommand::from_recover_command(&exp.recover_command).unwrap();
        assert_eq!(persisted.pid, Some(pid));

        h.advance(4).await;
        assert_eq!(h.status(&uid), ExperimentStatus::Running);
        assert!(h.state.stopped().is_empty(), "stopped before duration elapsed");

        h.advance(1).await;
        assert_eq!(h.status(&uid), ExperimentStatus::Success);
        assert_eq!(h.state.stopped(), vec![pid]);
        assert!(h.scheduler.registry().load(&uid).is_none());
        assert!(h.scheduler.wheel().is_empty());
    }

    #[tokio::test]
    async fn test_recurring_cycles_until_recovered() {
        let h = Harness::new();
        let uid = h
            .scheduler
            .schedule(StressCommand::cpu(50, 1, 2).every(3))
            .await
            .unwrap();

        assert_eq!(h.status(&uid), ExperimentStatus::Created);
        assert!(h.scheduler.registry().load(&uid).is_some());

        h.advance(4).await;
        assert_eq!(h.status(&uid), ExperimentStatus::Created);
        assert!(h.state.started().is_empty());

        h.advance(1).await;
        assert_eq!(h.status(&uid), ExperimentStatus::Running);
        assert_eq!(h.state.started().len(), 1);

        h.advance(2).await;
        assert_eq!(h.status(&uid), ExperimentStatus::Waiting);
        assert_eq!(h.state.stopped().len(), 1);
        let entry = h.scheduler.registry().load(&uid).unwrap();
        assert_eq!(Some(entry.next), entry.cycle);

        h.advance(3).await;
        assert_eq!(h.status(&uid), ExperimentStatus::Running);
        assert_eq!(h.state.started().len(), 2);

        h.advance(2).await;
        assert_eq!(h.status(&uid), ExperimentStatus::Waiting);
        assert_eq!(h.state.stopped(), h.state.started());
    }

    #[tokio::test]
    async fn test_recover_while_waiting_cancels_cycle_without_stopping() {
        let h = Harness::new();
        let uid = h
            .scheduler
            .schedule(StressCommand::cpu(50, 1, 2).every(3))
            .await
            .unwrap();
        h.advance(7).await;
        assert_eq!(h.status(&uid), ExperimentStatus::Waiting);
        let stops_before = h.state.stopped().len();

        h.scheduler.recover(&uid).await.unwrap();
        assert_eq!(h.status(&uid), ExperimentStatus::Destroyed);
        assert_eq!(h.state.stopped().len(), stops_before);
        assert!(h.scheduler.registry().load(&uid).is_none());
        assert!(h.scheduler.wheel().is_empty());

        h.advance(20).await;
        assert_eq!(h.state.started().len(), 1);
        assert_eq!(h.status(&uid), ExperimentStatus::Destroyed);
    }

    #[tokio::test]
    async fn test_recover_before_first_cycle() {
        let h = Harness::new();
        let uid = h
            .scheduler
            .schedule(StressCommand::mem("64M", 1, 2).every(3))
            .await
            .unwrap();

        h.scheduler.recover(&uid).await.unwrap();
        assert_eq!(h.status(&uid), ExperimentStatus::Destroyed);

        h.advance(10).await;
        assert!(h.state.started().is_empty());
    }

    #[tokio::test]
    async fn test_recover_while_running_stops_tracked_process() {
        let h = Harness::new();
        let uid = h.scheduler.schedule(StressCommand::cpu(80, 2, 5)).await.unwrap();
        let pid = h.state.started()[0];

        h.scheduler.recover(&uid).await.unwrap();
        assert_eq!(h.status(&uid), ExperimentStatus::Destroyed);
        assert_eq!(h.state.stopped(), vec![pid]);

        // The cancelled recovery never fires.
        h.advance(10).await;
        assert_eq!(h.state.stopped(), vec![pid]);
        assert_eq!(h.status(&uid), ExperimentStatus::Destroyed);
    }

    #[tokio::test]
    async fn test_recover_running_recurring_cancels_both_tasks() {
        let h = Harness::new();
        let uid = h
            .scheduler
            .schedule(StressCommand::cpu(50, 1, 2).every(3))
            .await
            .unwrap();
        h.advance(5).await;
        assert_eq!(h.status(&uid), ExperimentStatus::Running);

        h.scheduler.recover(&uid).await.unwrap();
        assert_eq!(h.status(&uid), ExperimentStatus::Destroyed);
        assert!(h.scheduler.wheel().is_empty());

        h.advance(20).await;
        assert_eq!(h.state.started().len(), 1);
        assert_eq!(h.state.stopped().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_registry_entry_is_a_consistency_error() {
        let h = Harness::new();
        let uid = h.scheduler.schedule(StressCommand::cpu(80, 2, 5)).await.unwrap();
        h.scheduler.registry().remove(&uid);

        let err = h.scheduler.recover(&uid).await.unwrap_err();
        assert!(matches!(err, HavocError::Consistency { uid: u, .. } if u == uid));
        assert_eq!(h.status(&uid), ExperimentStatus::Running);
        assert!(h.state.stopped().is_empty());
    }

    #[tokio::test]
    async fn test_recover_is_idempotent() {
        let h = Harness::new();
        let uid = h.scheduler.schedule(StressCommand::cpu(80, 2, 5)).await.unwrap();

        h.scheduler.recover(&uid).await.unwrap();
        h.scheduler.recover(&uid).await.unwrap();
        assert_eq!(h.status(&uid), ExperimentStatus::Destroyed);
        assert_eq!(h.state.stopped().len(), 1);
    }

    #[tokio::test]
    async fn test_recover_unknown_uid() {
        let h = Harness::new();
        let uid = Uuid::new_v4();
        assert!(matches!(
            h.scheduler.recover(&uid).await,
            Err(HavocError::NotFound(u)) if u == uid
        ));
    }

    #[tokio::test]
    async fn test_start_failure_records_error() {
        let h = Harness::new();
        h.state.fail_start.store(true, Ordering::SeqCst);

        let err = h
            .scheduler
            .schedule(StressCommand::cpu(80, 2, 5))
            .await
            .unwrap_err();
        assert!(matches!(err, HavocError::Execution(_)));

        let experiments = h.scheduler.list().unwrap();
        assert_eq!(experiments.len(), 1);
        assert_eq!(experiments[0].status, ExperimentStatus::Error);
        assert!(experiments[0].message.contains("stress-ng not found"));
        assert!(h.scheduler.wheel().is_empty());
    }

    #[tokio::test]
    async fn test_recurring_start_failure_stops_cycling() {
        let h = Harness::new();
        h.state.fail_start.store(true, Ordering::SeqCst);
        let uid = h
            .scheduler
            .schedule(StressCommand::cpu(50, 1, 2).every(3))
            .await
            .unwrap();

        h.advance(5).await;
        assert_eq!(h.status(&uid), ExperimentStatus::Error);
        assert!(h.scheduler.registry().load(&uid).is_none());
        assert!(h.scheduler.wheel().is_empty());
    }

    #[tokio::test]
    async fn test_automatic_recovery_failure_records_error() {
        let h = Harness::new();
        let uid = h.scheduler.schedule(StressCommand::cpu(80, 2, 5)).await.unwrap();
        h.state.fail_recover.store(true, Ordering::SeqCst);

        h.advance(5).await;
        let exp = h.scheduler.get(&uid).unwrap();
        assert_eq!(exp.status, ExperimentStatus::Error);
        assert_eq!(exp.message, "attack execution failed: kill failed");
        assert!(h.scheduler.registry().load(&uid).is_none());

        // An operator can still clean up by hand.
        h.state.fail_recover.store(false, Ordering::SeqCst);
        h.scheduler.recover(&uid).await.unwrap();
        assert_eq!(h.status(&uid), ExperimentStatus::Destroyed);
        assert_eq!(h.state.stopped().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_manual_recovery_leaves_status_for_retry() {
        let h = Harness::new();
        let uid = h.scheduler.schedule(StressCommand::cpu(80, 2, 5)).await.unwrap();
        h.state.fail_recover.store(true, Ordering::SeqCst);

        assert!(matches!(
            h.scheduler.recover(&uid).await,
            Err(HavocError::Execution(_))
        ));
        assert_eq!(h.status(&uid), ExperimentStatus::Running);

        h.state.fail_recover.store(false, Ordering::SeqCst);
        h.scheduler.recover(&uid).await.unwrap();
        assert_eq!(h.status(&uid), ExperimentStatus::Destroyed);
    }

    #[tokio::test]
    async fn test_shutdown_revokes_active_experiments() {
        let h = Harness::new();
        let running = h.scheduler.schedule(StressCommand::cpu(80, 2, 30)).await.unwrap();
        let pending = h
            .scheduler
            .schedule(StressCommand::cpu(50, 1, 2).every(3))
            .await
            .unwrap();
        let finished = h.scheduler.schedule(StressCommand::cpu(10, 1, 1)).await.unwrap();
        h.advance(1).await;
        assert_eq!(h.status(&finished), ExperimentStatus::Success);

        h.scheduler.shutdown().await;

        assert_eq!(h.status(&running), ExperimentStatus::Revoked);
        assert_eq!(h.status(&pending), ExperimentStatus::Revoked);
        assert_eq!(h.status(&finished), ExperimentStatus::Success);
        assert_eq!(h.state.stopped().len(), 2);
        assert!(h.scheduler.wheel().is_empty());
        assert!(h.scheduler.registry().is_empty());
    }

    #[tokio::test]
    async fn test_overflowing_durations_are_rejected_without_a_record() {
        let h = Harness::new();
        let err = h
            .scheduler
            .schedule(StressCommand::cpu(80, 2, u64::MAX).every(1))
            .await
            .unwrap_err();
        assert!(matches!(err, HavocError::Validation(_)));
        assert!(h.scheduler.list().unwrap().is_empty());
        assert!(h.scheduler.wheel().is_empty());
    }

    #[tokio::test]
    async fn test_finished_experiments_release_their_locks() {
        let h = Harness::new();
        for _ in 0..100 {
            let uid = h
                .scheduler
                .schedule(StressCommand::cpu(50, 1, 2).every(3))
                .await
                .unwrap();
            h.scheduler.recover(&uid).await.unwrap();
        }
        let uid = h.scheduler.schedule(StressCommand::cpu(80, 1, 1)).await.unwrap();
        h.advance(1).await;
        assert_eq!(h.status(&uid), ExperimentStatus::Success);

        assert_eq!(h.scheduler.registry().lock_count(), 0);
    }

    /// Store where a recovery lands between insert and cycle registration.
    struct DestroyedOnInsert(SqliteStore);

    impl ExperimentStore for DestroyedOnInsert {
        fn set(&self, experiment: &Experiment) -> Result<()> {
            self.0.set(experiment)?;
            self.0.update(
                &experiment.uid,
                ExperimentStatus::Destroyed,
                "",
                &experiment.recover_command,
            )
        }

        fn update(
            &self,
            uid: &Uuid,
            status: ExperimentStatus,
            message: &str,
            recover_command: &str,
        ) -> Result<()> {
            self.0.update(uid, status, message, recover_command)
        }

        fn find_by_uid(&self, uid: &Uuid) -> Result<Option<Experiment>> {
            self.0.find_by_uid(uid)
        }

        fn list(&self) -> Result<Vec<Experiment>> {
            self.0.list()
        }

        fn list_by_status(&self, status: ExperimentStatus) -> Result<Vec<Experiment>> {
            self.0.list_by_status(status)
        }
    }

    #[tokio::test]
    async fn test_no_cycle_for_experiment_recovered_before_scheduling() {
        let state = Arc::new(FakeState::default());
        let scheduler = AttackScheduler::new(
            Arc::new(DestroyedOnInsert(SqliteStore::in_memory().unwrap())),
            FakeAttack(Arc::clone(&state)),
            WheelConfig {
                frequency: Duration::from_secs(1),
                slot_num: 8,
            },
        );

        let uid = scheduler
            .schedule(StressCommand::cpu(50, 1, 2).every(3))
            .await
            .unwrap();
        assert!(scheduler.registry().load(&uid).is_none());
        assert!(scheduler.wheel().is_empty());

        for _ in 0..20 {
            for handle in scheduler.wheel().tick() {
                handle.await.unwrap();
            }
        }
        assert!(state.started().is_empty());
    }

    #[tokio::test]
    async fn test_live_wheel_never_stops_an_attack_early() {
        let state = Arc::new(FakeState::default());
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let scheduler = AttackScheduler::new(
            store.clone(),
            FakeAttack(Arc::clone(&state)),
            WheelConfig {
                frequency: Duration::from_millis(100),
                slot_num: 32,
            },
        );
        scheduler.start();

        // Schedule most of the way through a tick.
        tokio::time::sleep(Duration::from_millis(90)).await;
        let started = std::time::Instant::now();
        let uid = scheduler.schedule(StressCommand::cpu(80, 2, 1)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(3), async {
            while store.get_status(&uid).unwrap() != ExperimentStatus::Success {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("automatic recovery never ran");
        assert!(
            started.elapsed() >= Duration::from_secs(1),
            "stopped after {:?}",
            started.elapsed()
        );

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_background_wheel_drives_recovery() {
        let state = Arc::new(FakeState::default());
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let scheduler = AttackScheduler::new(
            store.clone(),
            FakeAttack(Arc::clone(&state)),
            WheelConfig {
                frequency: Duration::from_millis(10),
                slot_num: 32,
            },
        );
        scheduler.start();

        let uid = scheduler.schedule(StressCommand::cpu(80, 1, 0)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while store.get_status(&uid).unwrap() != ExperimentStatus::Success {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("automatic recovery never ran");

        scheduler.shutdown().await;
    }
}
