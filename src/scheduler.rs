use chrono::{Days, NaiveDateTime, NaiveTime};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;
use tracing::{debug, info};

pub const POLL_INTERVAL: Duration = Duration::from_secs(30);

pub const DEFAULT_TIME: &str = "08:00";

/// Parse `HH:MM` (24h).
pub fn parse_time_of_day(s: &str) -> Result<NaiveTime, chrono::ParseError> {
    NaiveTime::parse_from_str(s, "%H:%M")
}

/// First `at` strictly after `after`.
pub fn next_occurrence(at: NaiveTime, after: NaiveDateTime) -> NaiveDateTime {
    let today = after.date().and_time(at);
    if today > after {
        today
    } else {
        // Days::new(1) can only overflow at the end of chrono's calendar.
        today.checked_add_days(Days::new(1)).unwrap_or(today)
    }
}

struct DailyJob {
    at: NaiveTime,
    next_run: NaiveDateTime,
    task: Box<dyn FnMut()>,
}

/// Holds at most one daily job.
#[derive(Default)]
pub struct Scheduler {
    job: Option<DailyJob>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace whatever was registered with a job firing daily at `at`.
    pub fn every_day_at(&mut self, at: NaiveTime, now: NaiveDateTime, task: impl FnMut() + 'static) {
        self.clear();
        let next_run = next_occurrence(at, now);
        debug!(%next_run, "Registered daily job");
        self.job = Some(DailyJob {
            at,
            next_run,
            task: Box::new(task),
        });
    }

    pub fn clear(&mut self) {
        self.job = None;
    }

    pub fn pending_jobs(&self) -> usize {
        usize::from(self.job.is_some())
    }

    pub fn next_run(&self) -> Option<NaiveDateTime> {
        self.job.as_ref().map(|job| job.next_run)
    }

    /// Run the job if it is due. Returns whether it ran.
    ///
    /// Missed days are not replayed: the job is re-armed relative to `now`.
    pub fn run_pending(&mut self, now: NaiveDateTime) -> bool {
        let Some(job) = self.job.as_mut() else {
            return false;
        };
        if now < job.next_run {
            return false;
        }
        (job.task)();
        job.next_run = next_occurrence(job.at, now);
        debug!(next_run = %job.next_run, "Daily job re-armed");
        true
    }
}

/// Poll the scheduler until a stop signal arrives (or its sender is dropped).
pub fn run_until_stopped(
    scheduler: &mut Scheduler,
    stop: &Receiver<()>,
    poll: Duration,
    mut now: impl FnMut() -> NaiveDateTime,
) {
    loop {
        scheduler.run_pending(now());
        match stop.recv_timeout(poll) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    info!("Scheduler stopped by user");
}

/// Register `task` daily at `at` (local time) and block until stopped.
pub fn run_daily(at: NaiveTime, stop: &Receiver<()>, task: impl FnMut() + 'static) {
    let mut scheduler = Scheduler::new();
    scheduler.every_day_at(at, chrono::Local::now().naive_local(), task);
    info!("Scheduled daily email at {}", at.format("%H:%M"));
    run_until_stopped(&mut scheduler, stop, POLL_INTERVAL, || {
        chrono::Local::now().naive_local()
    });
}
