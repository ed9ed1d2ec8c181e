//! Cron-driven dispatch of backup runs.
//!
//! One ticker task wakes at every minute boundary and calls [`Scheduler::tick`].
//! Each due schedule is dispatched onto its own tracked task, so a long run
//! never delays the ticker. A schedule whose previous run is still in flight
//! is skipped, not queued.

use crate::models::schedule::{RunOutcome, Schedule, ScheduleView};
use crate::runner::BackupRunner;
use crate::services::cron::{truncate_to_minute, CronSpec};
use crate::store::StateStore;
use backup_engine::{ArchiveMetadata, BackupError, BackupOptions, Clock, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    entries: Mutex<BTreeMap<String, Entry>>,
    runner: Arc<dyn BackupRunner>,
    clock: Arc<dyn Clock>,
    store: StateStore,
    tracker: TaskTracker,
    /// Parent of every run's cancellation token
    runs_cancel: CancellationToken,
    accepting: AtomicBool,
    ticker: std::sync::Mutex<Option<Ticker>>,
    next_generation: AtomicU64,
}

struct Ticker {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

struct Entry {
    schedule: Schedule,
    cron: CronSpec,
    running: bool,
    /// Distinguishes a re-added schedule from the one it replaced
    generation: u64,
}

impl Entry {
    fn view(&self, now: DateTime<Utc>) -> ScheduleView {
        ScheduleView {
            schedule: self.schedule.clone(),
            running: self.running,
            next_run_at: self
                .schedule
                .enabled
                .then(|| self.cron.next_after(now))
                .flatten(),
        }
    }
}

impl Scheduler {
    /// Build a scheduler from persisted state. Entries whose cron no longer
    /// parses are dropped with an error log.
    pub async fn load(runner: Arc<dyn BackupRunner>, clock: Arc<dyn Clock>, store: StateStore) -> Result<Self> {
        let mut inner = Inner {
            entries: Mutex::new(BTreeMap::new()),
            runner,
            clock,
            store,
            tracker: TaskTracker::new(),
            runs_cancel: CancellationToken::new(),
            accepting: AtomicBool::new(true),
            ticker: std::sync::Mutex::new(None),
            next_generation: AtomicU64::new(1),
        };

        let schedules = inner.store.load().await?;
        let mut entries = BTreeMap::new();
        for schedule in schedules {
            let cron = match CronSpec::parse(&schedule.cron) {
                Ok(cron) => cron,
                Err(e) => {
                    error!(schedule_id = %schedule.id, cron = %schedule.cron, error = %e, "Dropping schedule with invalid cron");
                    continue;
                }
            };
            if entries.contains_key(&schedule.id) {
                warn!(schedule_id = %schedule.id, "Dropping duplicate schedule entry");
                continue;
            }
            let generation = inner.next_generation();
            entries.insert(
                schedule.id.clone(),
                Entry {
                    schedule,
                    cron,
                    running: false,
                    generation,
                },
            );
        }

        info!(count = entries.len(), path = %inner.store.path().display(), "Schedules loaded");
        *inner.entries.get_mut() = entries;

        Ok(Self { inner: Arc::new(inner) })
    }

    /// Register a new enabled schedule.
    pub async fn add(&self, id: &str, options: BackupOptions, cron: &str) -> Result<ScheduleView> {
        let id = id.trim();
        if id.is_empty() {
            return Err(BackupError::InvalidOption("schedule id must not be empty".into()));
        }
        if self.inner.entries.lock().await.contains_key(id) {
            return Err(BackupError::DuplicateId(id.to_string()));
        }

        let cron = CronSpec::parse(cron)?;
        self.inner.runner.validate(&options).await?;

        let mut entries = self.inner.entries.lock().await;
        if entries.contains_key(id) {
            return Err(BackupError::DuplicateId(id.to_string()));
        }

        let schedule = Schedule::new(id, options, cron.expression());
        let entry = Entry {
            schedule,
            cron,
            running: false,
            generation: self.inner.next_generation(),
        };
        let view = entry.view(self.inner.clock.now());
        entries.insert(id.to_string(), entry);

        if let Err(e) = self.inner.persist(&entries).await {
            entries.remove(id);
            return Err(e);
        }

        info!(schedule_id = %id, cron = %view.schedule.cron, "Schedule added");
        Ok(view)
    }

    /// Unregister a schedule. A run already in flight continues, but its
    /// outcome is no longer recorded.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let id = id.trim();
        let mut entries = self.inner.entries.lock().await;
        let entry = entries
            .remove(id)
            .ok_or_else(|| BackupError::NotFound(format!("schedule {}", id)))?;

        if let Err(e) = self.inner.persist(&entries).await {
            entries.insert(id.to_string(), entry);
            return Err(e);
        }

        if entry.running {
            info!(schedule_id = %id, "Schedule removed while a run is in flight");
        } else {
            info!(schedule_id = %id, "Schedule removed");
        }
        Ok(())
    }

    pub async fn enable(&self, id: &str) -> Result<()> {
        self.set_enabled(id, true).await
    }

    pub async fn disable(&self, id: &str) -> Result<()> {
        self.set_enabled(id, false).await
    }

    async fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let id = id.trim();
        let mut entries = self.inner.entries.lock().await;
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| BackupError::NotFound(format!("schedule {}", id)))?;
        if entry.schedule.enabled == enabled {
            return Ok(());
        }
        entry.schedule.enabled = enabled;

        if let Err(e) = self.inner.persist(&entries).await {
            if let Some(entry) = entries.get_mut(id) {
                entry.schedule.enabled = !enabled;
            }
            return Err(e);
        }

        info!(schedule_id = %id, enabled, "Schedule updated");
        Ok(())
    }

    /// Snapshot of every schedule, ordered by id.
    pub async fn list(&self) -> Vec<ScheduleView> {
        let now = self.inner.clock.now();
        let entries = self.inner.entries.lock().await;
        entries.values().map(|entry| entry.view(now)).collect()
    }

    pub async fn get(&self, id: &str) -> Result<ScheduleView> {
        let id = id.trim();
        let now = self.inner.clock.now();
        let entries = self.inner.entries.lock().await;
        entries
            .get(id)
            .map(|entry| entry.view(now))
            .ok_or_else(|| BackupError::NotFound(format!("schedule {}", id)))
    }

    /// Run a schedule once right now and return the result. Probe runs leave
    /// `last_run_at` and `last_result` untouched.
    pub async fn test(&self, id: &str) -> Result<ArchiveMetadata> {
        let id = id.trim();
        let options = {
            let entries = self.inner.entries.lock().await;
            entries
                .get(id)
                .map(|entry| entry.schedule.options.clone())
                .ok_or_else(|| BackupError::NotFound(format!("schedule {}", id)))?
        };

        info!(schedule_id = %id, "Running schedule test");
        let result = self
            .inner
            .runner
            .run(&options, self.inner.runs_cancel.child_token())
            .await;
        match &result {
            Ok(metadata) => info!(schedule_id = %id, archive_id = %metadata.id, "Schedule test succeeded"),
            Err(e) => warn!(schedule_id = %id, error = %e, "Schedule test failed"),
        }
        result
    }

    /// Dispatch every enabled, idle schedule whose cron matches the minute of
    /// `at`. Returns the ids dispatched.
    pub async fn tick(&self, at: DateTime<Utc>) -> Vec<String> {
        self.inner.tick(at).await
    }

    /// Spawn the minute ticker. Calling it again while running does nothing.
    pub fn start(&self) {
        let mut ticker = self.inner.lock_ticker();
        if ticker.is_some() {
            debug!("Scheduler already started");
            return;
        }

        self.inner.accepting.store(true, Ordering::SeqCst);
        self.inner.tracker.reopen();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_ticker(Arc::clone(&self.inner), cancel.clone()));
        *ticker = Some(Ticker { handle, cancel });
        info!("Scheduler started");
    }

    /// Stop dispatching and wait for in-flight runs to finish.
    pub async fn stop(&self) {
        self.halt().await;
        self.inner.tracker.wait().await;
        info!("Scheduler stopped");
    }

    /// Stop dispatching, give in-flight runs `grace` to finish, then cancel
    /// whatever is left and wait for it to wind down.
    pub async fn shutdown(&self, grace: Duration) {
        self.halt().await;

        if tokio::time::timeout(grace, self.inner.tracker.wait()).await.is_err() {
            warn!(
                in_flight = self.inner.tracker.len(),
                grace_secs = grace.as_secs(),
                "Grace period elapsed, cancelling in-flight backups"
            );
            self.inner.runs_cancel.cancel();
            self.inner.tracker.wait().await;
        }
        info!("Scheduler shut down");
    }

    async fn halt(&self) {
        {
            let _entries = self.inner.entries.lock().await;
            self.inner.accepting.store(false, Ordering::SeqCst);
        }

        let ticker = self.inner.lock_ticker().take();
        if let Some(ticker) = ticker {
            ticker.cancel.cancel();
            if let Err(e) = ticker.handle.await {
                warn!(error = %e, "Ticker task ended abnormally");
            }
        }
        self.inner.tracker.close();
    }
}

impl Inner {
    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    fn lock_ticker(&self) -> std::sync::MutexGuard<'_, Option<Ticker>> {
        self.ticker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn persist(&self, entries: &BTreeMap<String, Entry>) -> Result<()> {
        let schedules: Vec<Schedule> = entries.values().map(|entry| entry.schedule.clone()).collect();
        self.store.save(&schedules).await
    }

    async fn tick(self: &Arc<Self>, at: DateTime<Utc>) -> Vec<String> {
        let minute = truncate_to_minute(at);
        let mut due = Vec::new();
        {
            let mut entries = self.entries.lock().await;
            if !self.accepting.load(Ordering::SeqCst) {
                debug!(at = %minute, "Scheduler stopped, ignoring tick");
                return Vec::new();
            }

            for (id, entry) in entries.iter_mut() {
                if !entry.schedule.enabled || !entry.cron.matches(minute) {
                    continue;
                }
                if entry.running {
                    warn!(schedule_id = %id, at = %minute, "Skipping scheduled run: previous run still in progress");
                    continue;
                }
                entry.running = true;
                entry.schedule.last_run_at = Some(minute);
                due.push((id.clone(), entry.schedule.options.clone(), entry.generation));
            }
        }

        let mut dispatched = Vec::with_capacity(due.len());
        for (id, options, generation) in due {
            self.dispatch(id.clone(), options, generation);
            dispatched.push(id);
        }
        dispatched
    }

    fn dispatch(self: &Arc<Self>, id: String, options: BackupOptions, generation: u64) {
        let inner = Arc::clone(self);
        let cancel = self.runs_cancel.child_token();

        self.tracker.spawn(async move {
            info!(schedule_id = %id, source = %options.source_root.display(), "Starting scheduled backup");
            let result = inner.runner.run(&options, cancel).await;

            match &result {
                Ok(metadata) => info!(
                    schedule_id = %id,
                    archive_id = %metadata.id,
                    files = metadata.file_count,
                    bytes = metadata.total_size,
                    "Scheduled backup finished"
                ),
                Err(e) => error!(schedule_id = %id, kind = %e.kind(), error = %e, "Scheduled backup failed"),
            }

            inner.finish(&id, generation, RunOutcome::from_result(&result)).await;
        });
    }

    async fn finish(&self, id: &str, generation: u64, outcome: RunOutcome) {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(id) {
            Some(entry) if entry.generation == generation => {
                entry.running = false;
                entry.schedule.last_result = Some(outcome);
            }
            _ => {
                debug!(schedule_id = %id, "Discarding outcome of a run whose schedule was removed");
                return;
            }
        }

        if let Err(e) = self.persist(&entries).await {
            warn!(schedule_id = %id, error = %e, "Failed to persist run outcome");
        }
    }
}

/// Tracks the last minute the ticker handled and turns wall-clock readings
/// into at most one firing minute each.
#[derive(Debug)]
struct MinuteCursor {
    last: DateTime<Utc>,
}

impl MinuteCursor {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            last: truncate_to_minute(now),
        }
    }

    /// Time until the next minute boundary, never more than a minute.
    fn wait(&self, now: DateTime<Utc>) -> Duration {
        let next = self.last + chrono::Duration::minutes(1);
        (next - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .min(Duration::from_secs(60))
    }

    /// The minute to fire for `now`, if any. A backwards jump re-arms on the
    /// new minute without firing; a forward jump fires only the current one.
    fn observe(&mut self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let minute = truncate_to_minute(now);
        if minute < self.last {
            warn!(from = %self.last, to = %minute, "Clock moved backwards, re-arming ticker");
            self.last = minute;
            return None;
        }
        if minute == self.last {
            return None;
        }
        if minute > self.last + chrono::Duration::minutes(1) {
            let missed = (minute - self.last).num_minutes() - 1;
            warn!(from = %self.last, to = %minute, missed, "Clock jumped forward, skipping missed minutes");
        }
        self.last = minute;
        Some(minute)
    }
}

async fn run_ticker(inner: Arc<Inner>, cancel: CancellationToken) {
    let mut cursor = MinuteCursor::new(inner.clock.now());
    loop {
        let wait = cursor.wait(inner.clock.now());
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        if let Some(minute) = cursor.observe(inner.clock.now()) {
            let dispatched = inner.tick(minute).await;
            if !dispatched.is_empty() {
                debug!(at = %minute, count = dispatched.len(), "Tick dispatched schedules");
            }
        }
    }
    debug!("Ticker stopped");
}
