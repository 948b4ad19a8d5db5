use crate::types::UpdateInterval;
use log::{debug, info};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Shared busy flag; at most one [`FlightPermit`] exists at a time.
#[derive(Debug, Clone, Default)]
pub struct FlightGuard {
    busy: Arc<AtomicBool>,
}

impl FlightGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Option<FlightPermit> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightPermit {
                busy: Arc::clone(&self.busy),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Released on drop, including early returns and panics.
#[derive(Debug)]
pub struct FlightPermit {
    busy: Arc<AtomicBool>,
}

impl Drop for FlightPermit {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Disabled,
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Completed,
    /// Another run held the guard; the tick was dropped.
    Skipped,
}

/// Work the scheduler runs on every tick.
pub trait ScheduledJob: Send + Sync + 'static {
    fn run_scheduled(&self) -> impl Future<Output = TickOutcome> + Send;

    fn is_running(&self) -> bool;
}

struct Timer {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct UpdateScheduler<J: ScheduledJob> {
    job: Arc<J>,
    interval: Arc<Mutex<UpdateInterval>>,
    timer: Mutex<Option<Timer>>,
}

impl<J: ScheduledJob> UpdateScheduler<J> {
    pub fn new(job: Arc<J>, interval: UpdateInterval) -> Self {
        Self {
            job,
            interval: Arc::new(Mutex::new(interval)),
            timer: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> UpdateInterval {
        self.interval.lock().map(|i| *i).unwrap_or(UpdateInterval::Daily)
    }

    /// Applies from the next wait; a wait already started keeps its length.
    pub fn set_interval(&self, interval: UpdateInterval) {
        if let Ok(mut current) = self.interval.lock() {
            *current = interval;
        }
        info!("Update interval set to {:?}", interval);
    }

    /// Starts the timer. Enabling an enabled scheduler does nothing.
    pub fn enable(&self) {
        let Ok(mut timer) = self.timer.lock() else {
            return;
        };
        if timer.as_ref().is_some_and(|t| !t.task.is_finished()) {
            debug!("Scheduler already enabled");
            return;
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_timer(
            Arc::clone(&self.job),
            Arc::clone(&self.interval),
            cancel.clone(),
        ));
        *timer = Some(Timer { cancel, task });
        info!("Automatic updates enabled ({:?})", self.interval());
    }

    /// Stops the timer. A run already in progress finishes on its own.
    pub fn disable(&self) {
        let stopped = self
            .timer
            .lock()
            .ok()
            .and_then(|mut timer| timer.take());
        if let Some(timer) = stopped {
            timer.cancel.cancel();
            info!("Automatic updates disabled");
        }
    }

    pub fn state(&self) -> SchedulerState {
        let enabled = self
            .timer
            .lock()
            .map(|t| t.as_ref().is_some_and(|t| !t.task.is_finished()))
            .unwrap_or(false);
        if !enabled {
            SchedulerState::Disabled
        } else if self.job.is_running() {
            SchedulerState::Running
        } else {
            SchedulerState::Idle
        }
    }
}

impl<J: ScheduledJob> Drop for UpdateScheduler<J> {
    fn drop(&mut self) {
        self.disable();
    }
}

async fn run_timer<J: ScheduledJob>(
    job: Arc<J>,
    interval: Arc<Mutex<UpdateInterval>>,
    cancel: CancellationToken,
) {
    let current_period = || {
        interval
            .lock()
            .map(|i| i.duration())
            .unwrap_or(UpdateInterval::Daily.duration())
    };

    let mut period = current_period();
    let mut ticker = fixed_rate(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // Runs go on their own task so the timer keeps its rate; ticks that
        // land on a busy job are dropped by the job's guard.
        info!("Running scheduled update check");
        let job = Arc::clone(&job);
        tokio::spawn(async move {
            if job.run_scheduled().await == TickOutcome::Skipped {
                info!("Update check already in progress, tick dropped");
            }
        });

        let next = current_period();
        if next != period {
            period = next;
            ticker = fixed_rate(period);
        }
    }
    debug!("Scheduler timer stopped");
}

fn fixed_rate(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}
