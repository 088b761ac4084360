//! Recurrence scheduler: runs the watering task daily at a fixed local time
//! and a lightweight heartbeat at a fixed interval.
//!
//! Each recurrence is a single tokio task that awaits every run before
//! re-arming, so two runs of the same recurrence never overlap. A firing that
//! comes due while the previous run is still busy is skipped, not queued.
//! Runs execute on their own task; a panicking run is logged and the
//! recurrence carries on. The two recurrences are independent of each other.
//!
//! The daily fire time is recomputed from the wall clock after every run, so
//! it stays pinned to the same local hour and minute. Daylight-saving and
//! timezone shifts get no special treatment.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{Local, NaiveDateTime, NaiveTime, TimeDelta};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::state::SharedState;

// ---------------------------------------------------------------------------
// Daily time
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("hour {0} out of range 0-23")]
    Hour(u32),
    #[error("minute {0} out of range 0-59")]
    Minute(u32),
    #[error("expected HH:MM, got {0:?}")]
    Format(String),
}

/// Local time of day at which the daily recurrence fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DailyTime {
    hour: u32,
    minute: u32,
}

impl DailyTime {
    pub const DEFAULT: DailyTime = DailyTime { hour: 8, minute: 50 };

    pub fn new(hour: u32, minute: u32) -> Result<Self, ScheduleError> {
        if hour > 23 {
            return Err(ScheduleError::Hour(hour));
        }
        if minute > 59 {
            return Err(ScheduleError::Minute(minute));
        }
        Ok(Self { hour, minute })
    }

    fn as_time(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour, self.minute, 0).unwrap_or_default()
    }
}

impl FromStr for DailyTime {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let format_err = || ScheduleError::Format(s.to_string());
        let (h, m) = s.trim().split_once(':').ok_or_else(format_err)?;
        let hour = h.parse().map_err(|_| format_err())?;
        let minute = m.parse().map_err(|_| format_err())?;
        Self::new(hour, minute)
    }
}

impl fmt::Display for DailyTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Next instant at `at` (seconds zeroed) that is not before `now`: today if
/// still ahead, otherwise tomorrow.
pub fn next_occurrence(now: NaiveDateTime, at: DailyTime) -> NaiveDateTime {
    let today = now.date().and_time(at.as_time());
    if today < now {
        today + TimeDelta::days(1)
    } else {
        today
    }
}

// ---------------------------------------------------------------------------
// Wall clock
// ---------------------------------------------------------------------------

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> NaiveDateTime;
}

/// Host local time.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalClock;

impl Clock for LocalClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Owns the recurrence tasks and their shutdown signal.
pub struct RecurrenceScheduler {
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for RecurrenceScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl RecurrenceScheduler {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Run `job` at `at` local time today (or tomorrow if already past),
    /// then at the same local time every following day.
    pub fn spawn_daily<C, F, Fut>(
        &self,
        name: &'static str,
        at: DailyTime,
        clock: C,
        shared: SharedState,
        job: F,
    ) where
        C: Clock,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut stop = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut earliest = clock.now();
            loop {
                if *stop.borrow_and_update() {
                    break;
                }

                let now = clock.now();
                let next = next_occurrence(now.max(earliest), at);
                let wait = (next - now).to_std().unwrap_or_default();
                shared.write().await.next_watering = Some(next);
                info!(
                    recurrence = name,
                    next = %next.format("%Y-%m-%d %H:%M:%S"),
                    wait_sec = wait.as_secs(),
                    "scheduler: armed"
                );

                tokio::select! {
                    biased;
                    _ = stop.changed() => break,
                    _ = tokio::time::sleep(wait) => {}
                }

                info!(recurrence = name, "scheduler: firing");
                if run_isolated(name, job()).await {
                    shared.write().await.completed_runs += 1;
                }

                // Never fire twice for the same slot, even if the job was
                // instant or the wall clock lags the timer.
                earliest = next + TimeDelta::seconds(1);
                let late = clock.now() - next;
                if late > TimeDelta::days(1) {
                    warn!(
                        recurrence = name,
                        late_min = late.num_minutes(),
                        "scheduler: run overran, skipping missed slots"
                    );
                }
            }
            shared.write().await.next_watering = None;
            debug!(recurrence = name, "scheduler: stopped");
        });
        self.track(handle);
    }

    /// Run `job` immediately and then every `period`. Ticks that come due
    /// while the job is still running are skipped.
    pub fn spawn_every<F, Fut>(&self, name: &'static str, period: Duration, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut stop = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(recurrence = name, period_sec = period.as_secs(), "scheduler: interval started");

            loop {
                if *stop.borrow_and_update() {
                    break;
                }
                tokio::select! {
                    biased;
                    _ = stop.changed() => break,
                    _ = ticker.tick() => {}
                }
                run_isolated(name, job()).await;
            }
            debug!(recurrence = name, "scheduler: stopped");
        });
        self.track(handle);
    }

    /// Stop all recurrences and wait for their tasks to finish. A run in
    /// progress completes first. Calling this again is a no-op.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);

        let handles = match self.handles.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        if handles.is_empty() {
            return;
        }

        info!(recurrences = handles.len(), "scheduler: shutting down");
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("scheduler: recurrence task ended abnormally: {e}");
            }
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        match self.handles.lock() {
            Ok(mut guard) => guard.push(handle),
            Err(poisoned) => poisoned.into_inner().push(handle),
        }
    }
}

/// Run one firing on its own task so a panic ends only that run. Returns
/// whether the run completed.
async fn run_isolated<Fut>(name: &'static str, run: Fut) -> bool
where
    Fut: Future<Output = ()> + Send + 'static,
{
    match tokio::spawn(run).await {
        Ok(()) => true,
        Err(e) => {
            error!(recurrence = name, "scheduler: run failed: {e}");
            false
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SystemState;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::RwLock;

    /// Wall clock that advances with tokio's (paused) clock.
    struct TestClock {
        base: NaiveDateTime,
        start: tokio::time::Instant,
    }

    impl TestClock {
        fn at(hour: u32, minute: u32) -> Self {
            Self {
                base: dt(1, hour, minute),
                start: tokio::time::Instant::now(),
            }
        }
    }

    impl Clock for TestClock {
        fn now(&self) -> NaiveDateTime {
            let elapsed = TimeDelta::from_std(self.start.elapsed()).unwrap_or_default();
            self.base + elapsed
        }
    }

    fn dt(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, day)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn test_shared() -> SharedState {
        Arc::new(RwLock::new(SystemState::new()))
    }

    fn counting_job(counter: &Arc<AtomicUsize>) -> impl Fn() -> std::future::Ready<()> + Send + Sync + 'static {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    const MINUTE: Duration = Duration::from_secs(60);
    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    // -- DailyTime ----------------------------------------------------------

    #[test]
    fn daily_time_bounds() {
        assert!(DailyTime::new(0, 0).is_ok());
        assert!(DailyTime::new(23, 59).is_ok());
        assert_eq!(DailyTime::new(24, 0), Err(ScheduleError::Hour(24)));
        assert_eq!(DailyTime::new(8, 60), Err(ScheduleError::Minute(60)));
    }

    #[test]
    fn daily_time_parse_and_display() {
        let t: DailyTime = "8:05".parse().unwrap();
        assert_eq!(t, DailyTime::new(8, 5).unwrap());
        assert_eq!(t.to_string(), "08:05");
        assert!(matches!("0850".parse::<DailyTime>(), Err(ScheduleError::Format(_))));
        assert!(matches!("ab:cd".parse::<DailyTime>(), Err(ScheduleError::Format(_))));
        assert_eq!("12:75".parse::<DailyTime>(), Err(ScheduleError::Minute(75)));
    }

    // -- next_occurrence ----------------------------------------------------

    #[test]
    fn next_occurrence_later_today() {
        let at = DailyTime::new(8, 50).unwrap();
        assert_eq!(next_occurrence(dt(1, 8, 0), at), dt(1, 8, 50));
    }

    #[test]
    fn next_occurrence_already_passed_is_tomorrow() {
        let at = DailyTime::new(8, 50).unwrap();
        assert_eq!(next_occurrence(dt(1, 9, 0), at), dt(2, 8, 50));
    }

    #[test]
    fn next_occurrence_exactly_now_is_today() {
        let at = DailyTime::new(8, 50).unwrap();
        assert_eq!(next_occurrence(dt(1, 8, 50), at), dt(1, 8, 50));
    }

    #[test]
    fn next_occurrence_seconds_past_is_tomorrow() {
        let at = DailyTime::new(8, 50).unwrap();
        let now = dt(1, 8, 50) + TimeDelta::seconds(1);
        assert_eq!(next_occurrence(now, at), dt(2, 8, 50));
    }

    #[test]
    fn next_occurrence_crosses_month_end() {
        let at = DailyTime::new(6, 0).unwrap();
        let now = NaiveDate::from_ymd_opt(2024, 6, 30).unwrap().and_hms_opt(7, 0, 0).unwrap();
        let expected = NaiveDate::from_ymd_opt(2024, 7, 1).unwrap().and_hms_opt(6, 0, 0).unwrap();
        assert_eq!(next_occurrence(now, at), expected);
    }

    // -- Daily recurrence ---------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn daily_fires_at_target_then_every_day() {
        let runs = Arc::new(AtomicUsize::new(0));
        let shared = test_shared();
        let scheduler = RecurrenceScheduler::new();
        scheduler.spawn_daily(
            "watering",
            DailyTime::new(8, 50).unwrap(),
            TestClock::at(8, 0),
            Arc::clone(&shared),
            counting_job(&runs),
        );

        tokio::time::sleep(49 * MINUTE).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(shared.read().await.next_watering, Some(dt(1, 8, 50)));

        tokio::time::sleep(2 * MINUTE).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(shared.read().await.next_watering, Some(dt(2, 8, 50)));

        tokio::time::sleep(DAY).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        tokio::time::sleep(DAY).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(shared.read().await.completed_runs, 3);

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn daily_after_target_waits_for_tomorrow() {
        let runs = Arc::new(AtomicUsize::new(0));
        let scheduler = RecurrenceScheduler::new();
        scheduler.spawn_daily(
            "watering",
            DailyTime::new(8, 50).unwrap(),
            TestClock::at(9, 0),
            test_shared(),
            counting_job(&runs),
        );

        // 09:00 -> next day 08:50 is 23h50m away.
        tokio::time::sleep(23 * 60 * MINUTE + 49 * MINUTE).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        tokio::time::sleep(2 * MINUTE).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn slow_daily_job_never_overlaps() {
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let scheduler = RecurrenceScheduler::new();
        {
            let active = Arc::clone(&active);
            let max_active = Arc::clone(&max_active);
            scheduler.spawn_daily(
                "watering",
                DailyTime::new(8, 50).unwrap(),
                TestClock::at(8, 49),
                test_shared(),
                move || {
                    let active = Arc::clone(&active);
                    let max_active = Arc::clone(&max_active);
                    async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        max_active.fetch_max(now, Ordering::SeqCst);
                        // Runs past the next day's slot.
                        tokio::time::sleep(DAY + 60 * MINUTE).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    }
                },
            );
        }

        tokio::time::sleep(4 * DAY).await;
        assert_eq!(max_active.load(Ordering::SeqCst), 1);

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_run_does_not_stop_daily_recurrence() {
        let runs = Arc::new(AtomicUsize::new(0));
        let shared = test_shared();
        let scheduler = RecurrenceScheduler::new();
        {
            let runs = Arc::clone(&runs);
            scheduler.spawn_daily(
                "watering",
                DailyTime::new(8, 50).unwrap(),
                TestClock::at(8, 49),
                Arc::clone(&shared),
                move || {
                    let first = runs.fetch_add(1, Ordering::SeqCst) == 0;
                    async move {
                        if first {
                            panic!("first run fails");
                        }
                    }
                },
            );
        }

        tokio::time::sleep(4 * DAY).await;
        assert_eq!(runs.load(Ordering::SeqCst), 4);
        assert_eq!(shared.read().await.completed_runs, 3);
        assert!(shared.read().await.next_watering.is_some());

        scheduler.shutdown().await;
    }

    // -- Interval recurrence ------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn interval_fires_immediately_then_every_period() {
        let beats = Arc::new(AtomicUsize::new(0));
        let scheduler = RecurrenceScheduler::new();
        scheduler.spawn_every("heartbeat", 60 * MINUTE, counting_job(&beats));

        tokio::time::sleep(MINUTE).await;
        assert_eq!(beats.load(Ordering::SeqCst), 1);

        tokio::time::sleep(3 * 60 * MINUTE).await;
        assert_eq!(beats.load(Ordering::SeqCst), 4);

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_tick_does_not_stop_interval() {
        let beats = Arc::new(AtomicUsize::new(0));
        let scheduler = RecurrenceScheduler::new();
        {
            let beats = Arc::clone(&beats);
            scheduler.spawn_every("heartbeat", 60 * MINUTE, move || {
                let first = beats.fetch_add(1, Ordering::SeqCst) == 0;
                async move {
                    if first {
                        panic!("first beat fails");
                    }
                }
            });
        }

        tokio::time::sleep(3 * 60 * MINUTE + MINUTE).await;
        assert_eq!(beats.load(Ordering::SeqCst), 4);

        scheduler.shutdown().await;
    }

    // -- Shutdown -----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn shutdown_twice_stops_all_future_firings() {
        let runs = Arc::new(AtomicUsize::new(0));
        let beats = Arc::new(AtomicUsize::new(0));
        let scheduler = RecurrenceScheduler::new();
        scheduler.spawn_daily(
            "watering",
            DailyTime::new(8, 50).unwrap(),
            TestClock::at(8, 0),
            test_shared(),
            counting_job(&runs),
        );
        scheduler.spawn_every("heartbeat", 60 * MINUTE, counting_job(&beats));

        tokio::time::sleep(DAY + 30 * MINUTE).await;
        let runs_before = runs.load(Ordering::SeqCst);
        let beats_before = beats.load(Ordering::SeqCst);
        assert_eq!(runs_before, 1);
        assert!(beats_before > 0);

        scheduler.shutdown().await;
        scheduler.shutdown().await;

        tokio::time::sleep(3 * DAY).await;
        assert_eq!(runs.load(Ordering::SeqCst), runs_before);
        assert_eq!(beats.load(Ordering::SeqCst), beats_before);
    }

    #[tokio::test]
    async fn shutdown_without_recurrences_is_noop() {
        let scheduler = RecurrenceScheduler::new();
        scheduler.shutdown().await;
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_clears_next_watering() {
        let shared = test_shared();
        let scheduler = RecurrenceScheduler::new();
        scheduler.spawn_daily(
            "watering",
            DailyTime::new(8, 50).unwrap(),
            TestClock::at(8, 0),
            Arc::clone(&shared),
            || async {},
        );

        tokio::time::sleep(MINUTE).await;
        assert!(shared.read().await.next_watering.is_some());

        scheduler.shutdown().await;
        assert!(shared.read().await.next_watering.is_none());
    }
}
