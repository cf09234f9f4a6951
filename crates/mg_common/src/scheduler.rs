//! Tick-based task scheduling used to drip chunk work to viewers.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::prelude::*;

/// Return value of a repeating task, deciding whether it runs again.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TaskControl {
    /// Run again after the period.
    Continue,
    /// Never run again, the task's handle becomes cancelled.
    Stop,
}

/// A task run on every period until it returns [`TaskControl::Stop`] or its handle is cancelled.
pub type RepeatingTask = Box<dyn FnMut() -> TaskControl + Send + 'static>;
/// A task run once, as soon as possible.
pub type OnceTask = Box<dyn FnOnce() + Send + 'static>;

/// Cancellation handle of a scheduled task, cheap to clone.
#[derive(Clone, Debug, Default)]
pub struct TaskHandle {
    token: CancellationToken,
}

impl TaskHandle {
    /// A fresh, not yet cancelled handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Prevents any further runs of the task. A run that's already in progress completes.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Checks if the task was cancelled or stopped itself.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// The host's scheduling capability.
pub trait TickScheduler: Send + Sync + 'static {
    /// Runs `task` after `delay`, then every `period`, until stopped or cancelled.
    fn schedule_repeating(&self, task: RepeatingTask, delay: Duration, period: Duration) -> TaskHandle;
    /// Runs `task` once, off the calling thread.
    fn run_once(&self, task: OnceTask);
}

/// A [`TickScheduler`] driven by tokio timers on the given runtime.
pub struct TokioTickScheduler {
    runtime: Handle,
}

impl TokioTickScheduler {
    /// Creates a scheduler spawning its timers on `runtime`.
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }
}

impl TickScheduler for TokioTickScheduler {
    fn schedule_repeating(&self, mut task: RepeatingTask, delay: Duration, period: Duration) -> TaskHandle {
        let handle = TaskHandle::new();
        let token = handle.token.clone();
        let period = period.max(Duration::from_millis(1));
        self.runtime.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        if task() == TaskControl::Stop {
                            token.cancel();
                            break;
                        }
                    }
                }
            }
        });
        handle
    }

    fn run_once(&self, task: OnceTask) {
        drop(self.runtime.spawn_blocking(task));
    }
}

struct ManualTask {
    handle: TaskHandle,
    next_tick: u64,
    period_ticks: u64,
    task: RepeatingTask,
}

/// A [`TickScheduler`] that only runs tasks when [`ManualScheduler::tick`] is called, for hosts that own their game loop.
///
/// Durations are rounded up to whole ticks of `tick_period`.
pub struct ManualScheduler {
    tick_period: Duration,
    current_tick: AtomicU64,
    tasks: Mutex<Vec<ManualTask>>,
    once: Mutex<Vec<OnceTask>>,
}

impl ManualScheduler {
    /// Creates an idle scheduler.
    pub fn new(tick_period: Duration) -> Self {
        Self {
            tick_period,
            current_tick: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
            once: Mutex::new(Vec::new()),
        }
    }

    fn ticks(&self, duration: Duration) -> u64 {
        let period = self.tick_period.as_nanos().max(1);
        duration.as_nanos().div_ceil(period) as u64
    }

    /// Number of ticks elapsed so far.
    pub fn current_tick(&self) -> u64 {
        self.current_tick.load(AtomicOrdering::Acquire)
    }

    /// Advances by one tick, running every one-shot task and every repeating task that is due.
    /// Returns the number of task runs.
    pub fn tick(&self) -> usize {
        let now = self.current_tick.fetch_add(1, AtomicOrdering::AcqRel) + 1;
        let mut ran = 0;
        let once = std::mem::take(&mut *self.once.lock());
        for task in once {
            task();
            ran += 1;
        }

        // Tasks are run outside of the lock so they can schedule or cancel other tasks.
        let mut due = std::mem::take(&mut *self.tasks.lock());
        for entry in due.iter_mut() {
            if entry.handle.is_cancelled() || entry.next_tick > now {
                continue;
            }
            ran += 1;
            match (entry.task)() {
                TaskControl::Stop => entry.handle.cancel(),
                TaskControl::Continue => entry.next_tick = now + entry.period_ticks,
            }
        }
        due.retain(|entry| !entry.handle.is_cancelled());
        let mut tasks = self.tasks.lock();
        let added = std::mem::replace(&mut *tasks, due);
        tasks.extend(added);
        ran
    }

    /// Ticks until nothing is scheduled anymore or `max_ticks` have passed, returns the number of ticks taken.
    pub fn run_until_idle(&self, max_ticks: u64) -> u64 {
        let mut taken = 0;
        while taken < max_ticks && self.pending() > 0 {
            self.tick();
            taken += 1;
        }
        taken
    }

    /// Number of scheduled tasks that can still run.
    pub fn pending(&self) -> usize {
        let repeating = self.tasks.lock().iter().filter(|t| !t.handle.is_cancelled()).count();
        repeating + self.once.lock().len()
    }
}

impl TickScheduler for ManualScheduler {
    fn schedule_repeating(&self, task: RepeatingTask, delay: Duration, period: Duration) -> TaskHandle {
        let handle = TaskHandle::new();
        self.tasks.lock().push(ManualTask {
            handle: handle.clone(),
            next_tick: self.current_tick() + self.ticks(delay).max(1),
            period_ticks: self.ticks(period).max(1),
            task,
        });
        handle
    }

    fn run_once(&self, task: OnceTask) {
        self.once.lock().push(task);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn counting_task(counter: &Arc<AtomicUsize>, stop_after: usize) -> RepeatingTask {
        let counter = Arc::clone(counter);
        Box::new(move || {
            let runs = counter.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            if runs >= stop_after {
                TaskControl::Stop
            } else {
                TaskControl::Continue
            }
        })
    }

    #[test]
    fn manual_scheduler_respects_delay_and_period() {
        let scheduler = ManualScheduler::new(Duration::from_millis(50));
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = scheduler.schedule_repeating(
            counting_task(&counter, 3),
            Duration::from_millis(100),
            Duration::from_millis(100),
        );
        scheduler.tick();
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 0);
        scheduler.tick();
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 1);
        scheduler.tick();
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(scheduler.run_until_idle(100), 3);
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 3);
        assert!(handle.is_cancelled());
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn cancelled_tasks_never_run() {
        let scheduler = ManualScheduler::new(Duration::from_millis(50));
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = scheduler.schedule_repeating(counting_task(&counter, 10), Duration::ZERO, Duration::ZERO);
        handle.cancel();
        scheduler.tick();
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 0);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn one_shot_tasks_run_on_next_tick() {
        let scheduler = ManualScheduler::new(Duration::from_millis(50));
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        scheduler.run_once(Box::new(move || {
            c.fetch_add(1, AtomicOrdering::SeqCst);
        }));
        assert_eq!(scheduler.pending(), 1);
        assert_eq!(scheduler.tick(), 1);
        assert_eq!(scheduler.tick(), 0);
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tokio_scheduler_stops_itself() {
        let scheduler = TokioTickScheduler::new(Handle::current());
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = scheduler.schedule_repeating(
            counting_task(&counter, 2),
            Duration::from_millis(5),
            Duration::from_millis(20),
        );
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 2);
        assert!(handle.is_cancelled());
    }
}
