//! Cancellable one-shot timers.
//!
//! Every timer carries a generation. Re-arming or cancelling bumps it, and the fire callback
//! re-checks the generation under the owning agent's lock, so a fire that raced with a cancel
//! is discarded.

use crate::time::{MonotonicClock, INFINITE};
use tokio::{runtime::Handle, task::JoinHandle};

/// Clock plus the runtime timers are spawned on.
#[derive(Debug, Clone)]
pub struct Scheduler {
    pub clock: MonotonicClock,
    runtime: Handle,
}

impl Scheduler {
    /// Captures the runtime of the calling task.
    pub fn current(clock: MonotonicClock) -> Self {
        Self {
            clock,
            runtime: Handle::current(),
        }
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(future)
    }
}

#[derive(Debug)]
pub struct ScheduledTask {
    generation: u64,
    deadline: i64,
    handle: Option<JoinHandle<()>>,
}

impl Default for ScheduledTask {
    fn default() -> Self {
        Self {
            generation: 0,
            deadline: INFINITE,
            handle: None,
        }
    }
}

impl ScheduledTask {
    /// Cancels any pending fire and schedules `fire(generation)` at engine time `at`.
    /// An `INFINITE` deadline leaves the timer idle.
    pub fn arm<F>(&mut self, scheduler: &Scheduler, at: i64, fire: F)
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.cancel();
        let Some(instant) = scheduler.clock.instant_at(at) else {
            return;
        };
        let generation = self.generation;
        self.deadline = at;
        self.handle = Some(scheduler.spawn(async move {
            tokio::time::sleep_until(instant).await;
            fire(generation);
        }));
    }

    pub fn cancel(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.deadline = INFINITE;
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.handle.is_some()
    }

    pub fn deadline(&self) -> i64 {
        self.deadline
    }

    /// Accepts a fire for `generation`, returning false when it is stale.
    pub fn take_fire(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.handle.is_none() {
            return false;
        }
        self.handle = None;
        self.deadline = INFINITE;
        true
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// The independent timers of one remote lease agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RlaTimer {
    Subject,
    Monitor,
    RenewOrArbitrate,
    PreArbitrationSubject,
    PreArbitrationMonitor,
    PostArbitration,
    PingRetry,
}

impl RlaTimer {
    pub const ALL: [RlaTimer; 7] = [
        RlaTimer::Subject,
        RlaTimer::Monitor,
        RlaTimer::RenewOrArbitrate,
        RlaTimer::PreArbitrationSubject,
        RlaTimer::PreArbitrationMonitor,
        RlaTimer::PostArbitration,
        RlaTimer::PingRetry,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Default)]
pub struct RlaTimers {
    tasks: [ScheduledTask; 7],
}

impl RlaTimers {
    pub fn get_mut(&mut self, timer: RlaTimer) -> &mut ScheduledTask {
        &mut self.tasks[timer.index()]
    }

    pub fn get(&self, timer: RlaTimer) -> &ScheduledTask {
        &self.tasks[timer.index()]
    }

    pub fn cancel(&mut self, timer: RlaTimer) {
        self.get_mut(timer).cancel();
    }

    pub fn cancel_all(&mut self) {
        for task in &mut self.tasks {
            task.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    };
    use std::time::Duration;

    fn counter_fire(counter: &Arc<AtomicU64>) -> impl FnOnce(u64) + Send + 'static {
        let counter = counter.clone();
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_at_deadline() {
        let scheduler = Scheduler::current(MonotonicClock::new());
        let fired = Arc::new(AtomicU64::new(0));
        let mut task = ScheduledTask::default();
        task.arm(&scheduler, 100, counter_fire(&fired));
        assert!(task.is_armed());
        assert_eq!(task.deadline(), 100);

        tokio::time::sleep(Duration::from_millis(99)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_cancels_previous() {
        let scheduler = Scheduler::current(MonotonicClock::new());
        let fired = Arc::new(AtomicU64::new(0));
        let mut task = ScheduledTask::default();
        task.arm(&scheduler, 50, counter_fire(&fired));
        task.arm(&scheduler, 200, counter_fire(&fired));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_infinite_never_fires() {
        let scheduler = Scheduler::current(MonotonicClock::new());
        let fired = Arc::new(AtomicU64::new(0));
        let mut task = ScheduledTask::default();
        task.arm(&scheduler, INFINITE, counter_fire(&fired));
        assert!(!task.is_armed());
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_generation_rejected() {
        let scheduler = Scheduler::current(MonotonicClock::new());
        let mut task = ScheduledTask::default();
        task.arm(&scheduler, 10, |_| {});
        let stale = 0;
        task.arm(&scheduler, 20, |_| {});
        assert!(!task.take_fire(stale));
        assert!(task.is_armed());
    }
}
