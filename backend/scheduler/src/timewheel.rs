//! Hashed time wheel for delayed and recurring callbacks.
//!
//! A fixed ring of `slot_num` slots; the cursor advances one slot per
//! `frequency`. A task due in `ticks` ticks lands in slot
//! `(cursor + ticks) % slot_num` with `(ticks - 1) / slot_num` laps to wait
//! out first.
//!
//! While the background loop runs, the wheel remembers when the last tick
//! was due and adds the time elapsed since then to every new delay before
//! rounding up to whole ticks. A task therefore never fires before its delay
//! has passed in wall-clock time, and fires at most one tick late. Ticking by
//! hand with [`TimeWheel::tick`] is purely logical: delays count from the
//! cursor.
//!
//! Firing never happens under the wheel lock: due callbacks are collected,
//! the lock is released, then each callback runs as its own tokio task.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, trace};

/// Callback run when a task fires. Cron tasks invoke it once per period.
pub type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Opaque handle to a scheduled task, used for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHandle(u64);

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WheelConfig {
    /// Duration of one tick.
    pub frequency: Duration,
    /// Number of slots in the ring.
    pub slot_num: usize,
}

impl Default for WheelConfig {
    fn default() -> Self {
        Self {
            frequency: Duration::from_secs(1),
            slot_num: 360,
        }
    }
}

struct Task {
    /// Full revolutions left before the task is eligible.
    laps: usize,
    /// Period in ticks for cron tasks.
    period: Option<usize>,
    callback: TaskFn,
}

struct WheelState {
    slots: Vec<BTreeMap<u64, Task>>,
    cursor: usize,
    /// Task id -> slot index, for O(1) removal.
    locations: HashMap<u64, usize>,
    /// When the most recent loop-driven tick was due.
    last_tick: Option<Instant>,
}

impl WheelState {
    fn place(&mut self, id: u64, ticks: usize, mut task: Task) {
        let slot_num = self.slots.len();
        let slot = (self.cursor + ticks % slot_num) % slot_num;
        task.laps = (ticks - 1) / slot_num;
        self.slots[slot].insert(id, task);
        self.locations.insert(id, slot);
    }
}

pub struct TimeWheel {
    config: WheelConfig,
    state: Mutex<WheelState>,
    next_id: AtomicU64,
}

impl TimeWheel {
    pub fn new(config: WheelConfig) -> Self {
        let config = WheelConfig {
            frequency: config.frequency.max(Duration::from_millis(1)),
            slot_num: config.slot_num.max(1),
        };
        let slots = (0..config.slot_num).map(|_| BTreeMap::new()).collect();
        Self {
            config,
            state: Mutex::new(WheelState {
                slots,
                cursor: 0,
                locations: HashMap::new(),
                last_tick: None,
            }),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> WheelConfig {
        self.config
    }

    /// Schedule `callback` to fire once after `delay`.
    pub fn add<F, Fut>(&self, delay: Duration, callback: F) -> TaskHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.insert(delay, false, boxed(callback))
    }

    /// Schedule `callback` to fire every `interval` until removed.
    /// The first firing happens one full interval from now.
    pub fn add_cron<F, Fut>(&self, interval: Duration, callback: F) -> TaskHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.insert(interval, true, boxed(callback))
    }

    /// Cancel a pending task. Returns `false` if it already fired (one-shot)
    /// or was never scheduled; callers must tolerate a firing that raced the
    /// cancellation.
    pub fn remove(&self, handle: &TaskHandle) -> bool {
        let mut state = self.lock();
        match state.locations.remove(&handle.0) {
            Some(slot) => {
                state.slots[slot].remove(&handle.0);
                trace!(task = handle.0, "Task removed from wheel");
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, handle: &TaskHandle) -> bool {
        self.lock().locations.contains_key(&handle.0)
    }

    /// Number of pending tasks.
    pub fn len(&self) -> usize {
        self.lock().locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Advance the cursor one slot and spawn every due callback.
    ///
    /// Driven by the loop from [`TimeWheel::start`]; tests call it directly to
    /// step time deterministically and await the returned handles.
    pub fn tick(&self) -> Vec<JoinHandle<()>> {
        self.spawn_due(self.advance(None))
    }

    /// Loop-driven tick; `deadline` is when the tick was due.
    fn tick_at(&self, deadline: Instant) -> Vec<JoinHandle<()>> {
        self.spawn_due(self.advance(Some(deadline)))
    }

    fn spawn_due(&self, due: Vec<(TaskHandle, TaskFn)>) -> Vec<JoinHandle<()>> {
        due.into_iter()
            .map(|(handle, callback)| {
                trace!(task = handle.0, "Task fired");
                tokio::spawn(callback())
            })
            .collect()
    }

    /// Run the tick loop on a background task until `shutdown` turns true or
    /// its sender is dropped.
    pub fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let wheel = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(wheel.config.frequency);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
            // The first tick of a tokio interval completes immediately and
            // only sets the wall-clock reference.
            let started = ticker.tick().await;
            wheel.lock().last_tick = Some(started.into_std());

            info!(
                frequency_ms = wheel.config.frequency.as_millis() as u64,
                slots = wheel.config.slot_num,
                "Time wheel started"
            );

            loop {
                tokio::select! {
                    deadline = ticker.tick() => {
                        wheel.tick_at(deadline.into_std());
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!(pending = wheel.len(), "Time wheel stopped");
        })
    }

    fn insert(&self, delay: Duration, cron: bool, callback: TaskFn) -> TaskHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task = Task {
            laps: 0,
            // Later cron firings are spaced from the tick that fired them.
            period: cron.then(|| self.ticks_for(delay)),
            callback,
        };

        let mut state = self.lock();
        let since_tick = state
            .last_tick
            .map_or(Duration::ZERO, |due| due.elapsed());
        let ticks = self.ticks_for(delay.saturating_add(since_tick));
        state.place(id, ticks, task);
        drop(state);

        debug!(task = id, ticks, cron, "Task added to wheel");
        TaskHandle(id)
    }

    /// `ceil(delay / frequency)`, never less than one tick.
    fn ticks_for(&self, delay: Duration) -> usize {
        let frequency = self.config.frequency.as_nanos();
        let ticks = delay.as_nanos().div_ceil(frequency).max(1);
        usize::try_from(ticks).unwrap_or(usize::MAX)
    }

    fn advance(&self, deadline: Option<Instant>) -> Vec<(TaskHandle, TaskFn)> {
        let mut state = self.lock();
        if deadline.is_some() {
            state.last_tick = deadline;
        }
        let slot_num = state.slots.len();
        state.cursor = (state.cursor + 1) % slot_num;
        let slot = state.cursor;

        let ids: Vec<u64> = state.slots[slot].keys().copied().collect();
        let mut due = Vec::new();
        for id in ids {
            let Some(task) = state.slots[slot].get_mut(&id) else {
                continue;
            };
            if task.laps > 0 {
                task.laps -= 1;
                continue;
            }

            let Some(task) = state.slots[slot].remove(&id) else {
                continue;
            };
            state.locations.remove(&id);
            due.push((TaskHandle(id), Arc::clone(&task.callback)));

            if let Some(period) = task.period {
                state.place(id, period, task);
            }
        }
        due
    }

    fn lock(&self) -> MutexGuard<'_, WheelState> {
        // Callbacks never run under this lock, so a poisoned state is still consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn boxed<F, Fut>(callback: F) -> TaskFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move || callback().boxed())
}
