//! Scheduler: one run across every subscription, on an external trigger.
//!
//! The process never waits for wall-clock time itself. Something outside (cron,
//! the operator, the API) calls [`Scheduler::run_once`]; the scheduler decides
//! whether the call is due, snapshots the subscription list, and fans out to
//! the fetcher with a small fixed worker count.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use chrono::{DateTime, Local, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::fetcher::{ChannelFetchOutcome, SubscriptionFetcher};
use crate::store::{RunLog, ScheduleStore, Settings, SettingsStore, Subscription, SubscriptionStore};

#[derive(Debug, Clone, Copy)]
pub enum RunTrigger {
    /// Fired by the time-based job runner; only runs when due.
    Scheduled(DateTime<Local>),
    /// Operator request; ignores the schedule.
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Disabled,
    NotDue,
    AlreadyRunning,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub outcomes: Vec<ChannelFetchOutcome>,
}

impl RunReport {
    fn idle(status: RunStatus) -> Self {
        Self {
            status,
            started_at: None,
            finished_at: None,
            outcomes: Vec::new(),
        }
    }

    pub fn downloaded(&self) -> usize {
        self.outcomes
            .iter()
            .map(|outcome| outcome.downloaded_count)
            .sum()
    }

    pub fn failed_channels(&self) -> usize {
        self.outcomes.iter().filter(|outcome| !outcome.success).count()
    }
}

pub struct Scheduler {
    fetcher: Arc<SubscriptionFetcher>,
    subscriptions: Arc<SubscriptionStore>,
    settings: Arc<SettingsStore>,
    schedule: Arc<ScheduleStore>,
    run_log: Arc<RunLog>,
    workers: usize,
    running: AtomicBool,
}

/// Returns the scheduler to idle however the run ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Scheduler {
    pub fn new(
        fetcher: Arc<SubscriptionFetcher>,
        subscriptions: Arc<SubscriptionStore>,
        settings: Arc<SettingsStore>,
        schedule: Arc<ScheduleStore>,
        run_log: Arc<RunLog>,
        workers: usize,
    ) -> Self {
        Self {
            fetcher,
            subscriptions,
            settings,
            schedule,
            run_log,
            workers: workers.max(1),
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn run_once(&self, trigger: RunTrigger) -> RunReport {
        if let RunTrigger::Scheduled(now) = trigger {
            let schedule = self.schedule.get();
            if !schedule.enabled {
                info!("schedule disabled, nothing to do");
                return RunReport::idle(RunStatus::Disabled);
            }
            if !schedule.is_due(&now) {
                info!(
                    hour = schedule.hour,
                    minute = schedule.minute,
                    "not the scheduled minute, nothing to do"
                );
                return RunReport::idle(RunStatus::NotDue);
            }
        }

        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("a run is already in progress");
            return RunReport::idle(RunStatus::AlreadyRunning);
        }
        let _running = RunningGuard(&self.running);

        let started_at = Utc::now();
        let subscriptions = self.subscriptions.list();
        let settings = self.settings.get();
        let label = match trigger {
            RunTrigger::Scheduled(_) => "Scheduled",
            RunTrigger::Manual => "Manual",
        };
        info!(subscriptions = subscriptions.len(), "{label} run started");
        self.run_log.note(&format!(
            "{label} run started: {} subscription(s)",
            subscriptions.len()
        ));

        let outcomes = self.fetch_all(&subscriptions, &settings);
        let report = RunReport {
            status: RunStatus::Completed,
            started_at: Some(started_at),
            finished_at: Some(Utc::now()),
            outcomes,
        };

        self.run_log.note(&format!(
            "{label} run finished: {} new download(s), {} channel(s) failed",
            report.downloaded(),
            report.failed_channels()
        ));
        info!(downloaded = report.downloaded(), "{label} run finished");
        report
    }

    /// Bounded fan-out over a fixed snapshot. Results keep snapshot order.
    fn fetch_all(
        &self,
        subscriptions: &[Subscription],
        settings: &Settings,
    ) -> Vec<ChannelFetchOutcome> {
        let workers = self.workers.min(subscriptions.len()).max(1);
        let next = AtomicUsize::new(0);
        let results = Mutex::new(Vec::with_capacity(subscriptions.len()));

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let index = next.fetch_add(1, Ordering::SeqCst);
                        let Some(subscription) = subscriptions.get(index) else {
                            break;
                        };
                        let outcome = self.fetcher.fetch(subscription, settings);
                        self.run_log
                            .note(&format!("[{}] {}", subscription.id, outcome.summary()));
                        results.lock().push((index, outcome));
                    }
                });
            }
        });

        let mut results = results.into_inner();
        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, outcome)| outcome).collect()
    }
}
