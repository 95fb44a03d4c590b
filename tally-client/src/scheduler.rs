//! Timer that drives periodic reconciliation.
//!
//! The scheduler only owns cadence and the timer task. What a tick does is
//! supplied by the engine as a closure; each tick is spawned as its own task
//! so that cancelling the timer never cancels a cycle that is already running.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tally_core::config::EngineConfig;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Disabled,
    Idle,
    Urgent,
}

impl SchedulerState {
    fn for_urgency(urgent: bool) -> Self {
        if urgent {
            SchedulerState::Urgent
        } else {
            SchedulerState::Idle
        }
    }
}

struct Slot {
    state: SchedulerState,
    timer: Option<JoinHandle<()>>,
}

pub struct SyncScheduler {
    idle_interval: Duration,
    urgent_interval: Duration,
    slot: Mutex<Slot>,
}

impl SyncScheduler {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            idle_interval: config.idle_interval,
            urgent_interval: config.urgent_interval,
            slot: Mutex::new(Slot {
                state: SchedulerState::Disabled,
                timer: None,
            }),
        }
    }

    // A poisoned lock only means a panic elsewhere; the slot itself is
    // always consistent, so keep going with it.
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> SchedulerState {
        self.slot().state
    }

    pub fn is_enabled(&self) -> bool {
        self.state() != SchedulerState::Disabled
    }

    pub fn interval_for(&self, urgent: bool) -> Duration {
        if urgent {
            self.urgent_interval
        } else {
            self.idle_interval
        }
    }

    /// Period of the armed timer, `None` while disabled.
    pub fn armed_interval(&self) -> Option<Duration> {
        match self.state() {
            SchedulerState::Disabled => None,
            SchedulerState::Idle => Some(self.idle_interval),
            SchedulerState::Urgent => Some(self.urgent_interval),
        }
    }

    /// Arm the recurring timer. Returns false (and changes nothing) if the
    /// scheduler was already enabled.
    pub fn enable<F, Fut>(&self, urgent: bool, tick: F) -> bool
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.slot();
        if slot.state != SchedulerState::Disabled {
            return false;
        }

        let period = self.interval_for(urgent);
        slot.state = SchedulerState::for_urgency(urgent);
        slot.timer = Some(spawn_timer(period, tick));

        tracing::info!(
            "SCHEDULER: Enabled ({:?}) with {:?} interval",
            slot.state,
            period
        );
        true
    }

    /// Cancel the timer. Returns false if it was not running.
    pub fn disable(&self) -> bool {
        let mut slot = self.slot();
        if let Some(timer) = slot.timer.take() {
            timer.abort();
        }
        let was_enabled = slot.state != SchedulerState::Disabled;
        slot.state = SchedulerState::Disabled;

        if was_enabled {
            tracing::info!("SCHEDULER: Disabled");
        }
        was_enabled
    }

    /// Switch between idle and urgent cadence while enabled. Returns true if
    /// the timer was torn down and rearmed.
    pub fn rearm<F, Fut>(&self, urgent: bool, tick: F) -> bool
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.slot();
        let target = SchedulerState::for_urgency(urgent);
        if slot.state == SchedulerState::Disabled || slot.state == target {
            return false;
        }

        if let Some(timer) = slot.timer.take() {
            timer.abort();
        }
        let period = self.interval_for(urgent);
        slot.state = target;
        slot.timer = Some(spawn_timer(period, tick));

        tracing::info!("SCHEDULER: Rearmed ({:?}) with {:?} interval", target, period);
        true
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        if let Some(timer) = self.slot().timer.take() {
            timer.abort();
        }
    }
}

fn spawn_timer<F, Fut>(period: Duration, tick: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            tokio::spawn(tick());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn config() -> EngineConfig {
        EngineConfig {
            idle_interval: Duration::from_millis(40),
            urgent_interval: Duration::from_millis(20),
            settle_delay: Duration::from_millis(5),
        }
    }

    fn counting_tick(counter: Arc<AtomicUsize>) -> impl Fn() -> std::future::Ready<()> + Send + Sync {
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test]
    async fn test_state_machine_transitions() {
        let scheduler = SyncScheduler::new(&config());
        let ticks = Arc::new(AtomicUsize::new(0));
        assert_eq!(scheduler.state(), SchedulerState::Disabled);
        assert_eq!(scheduler.armed_interval(), None);

        assert!(scheduler.enable(false, counting_tick(ticks.clone())));
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert_eq!(scheduler.armed_interval(), Some(Duration::from_millis(40)));
        assert!(!scheduler.enable(true, counting_tick(ticks.clone())));

        assert!(scheduler.rearm(true, counting_tick(ticks.clone())));
        assert_eq!(scheduler.state(), SchedulerState::Urgent);
        assert!(!scheduler.rearm(true, counting_tick(ticks.clone())));

        assert!(scheduler.disable());
        assert_eq!(scheduler.state(), SchedulerState::Disabled);
        assert!(!scheduler.disable());
        assert!(!scheduler.rearm(false, counting_tick(ticks)));
        assert_eq!(scheduler.state(), SchedulerState::Disabled);
    }

    #[tokio::test]
    async fn test_enable_urgent_uses_short_interval() {
        let scheduler = SyncScheduler::new(&config());
        let ticks = Arc::new(AtomicUsize::new(0));

        scheduler.enable(true, counting_tick(ticks));
        assert_eq!(scheduler.state(), SchedulerState::Urgent);
        assert_eq!(scheduler.armed_interval(), Some(Duration::from_millis(20)));
    }

    #[tokio::test]
    async fn test_timer_ticks_until_disabled() {
        let scheduler = SyncScheduler::new(&config());
        let ticks = Arc::new(AtomicUsize::new(0));

        scheduler.enable(true, counting_tick(ticks.clone()));
        time::sleep(Duration::from_millis(150)).await;
        assert!(ticks.load(Ordering::SeqCst) >= 2);

        scheduler.disable();
        time::sleep(Duration::from_millis(10)).await;
        let after_disable = ticks.load(Ordering::SeqCst);
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after_disable);
    }
}
