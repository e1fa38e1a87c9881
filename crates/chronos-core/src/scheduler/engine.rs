//! Scheduler execution engine.
//!
//! Coordinates the trigger parser, the timer core, the persistence store and
//! the task registry:
//! - schedule/cancel/inspect operations, callable concurrently with firings
//! - per-task mutual exclusion (overlapping fires are dropped, not queued)
//! - startup rehydration of persisted schedules
//! - daily retention cleanup of run history

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::registry::TaskRegistry;

use super::events::{ScheduleUpdateInfo, SchedulerEvent, SchedulerListener};
use super::jobs::{JobCallback, JobRunner};
use super::store::SchedulerStore;
use super::triggers::{self, human_readable, CronSchedule, Trigger};
use super::types::{Result, RunStatus, ScheduleInfo, ScheduleKind, SchedulerError, TaskRun};

/// Future type for one task execution
pub type ExecutionFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Callback type for executing tasks.
///
/// The executor receives the task id, performs the actual work, and records
/// the outcome on the task registry itself; the engine reads the registry
/// back after the call returns. An `Err` (or a panic) means the executor
/// itself failed, distinct from the task completing with a failed status.
pub type TaskExecutor = Arc<dyn Fn(String) -> ExecutionFuture + Send + Sync>;

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Window after a missed fire instant within which a late fire is still
    /// honored, in seconds
    pub misfire_grace_secs: u64,
    /// Maximum concurrent callback instances per timer job
    pub max_instances: usize,
    /// Timer core scan interval in milliseconds
    pub tick_interval_ms: u64,
    /// Run-history retention window in days
    pub retention_days: u32,
    /// Wall-clock hour (UTC) of the daily retention cleanup
    pub cleanup_hour: u8,
    /// Data directory for the store, when driven by environment config
    pub persistence_path: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            misfire_grace_secs: 60,
            max_instances: 3,
            tick_interval_ms: 1_000,
            retention_days: 30,
            cleanup_hour: 0,
            persistence_path: None,
        }
    }
}

impl SchedulerConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Read configuration from `SCHEDULER_*` environment variables, falling
    /// back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        fn parse_var<T: std::str::FromStr>(key: &str, default: T) -> T {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }

        let defaults = Self::default();
        Self {
            misfire_grace_secs: parse_var(
                "SCHEDULER_MISFIRE_GRACE_SECS",
                defaults.misfire_grace_secs,
            ),
            max_instances: parse_var("SCHEDULER_MAX_INSTANCES", defaults.max_instances),
            tick_interval_ms: parse_var("SCHEDULER_TICK_INTERVAL_MS", defaults.tick_interval_ms),
            retention_days: parse_var("SCHEDULER_RETENTION_DAYS", defaults.retention_days),
            cleanup_hour: parse_var("SCHEDULER_CLEANUP_HOUR", defaults.cleanup_hour),
            persistence_path: std::env::var("SCHEDULER_PERSISTENCE_PATH")
                .ok()
                .map(PathBuf::from),
        }
    }

    /// Set the misfire grace window
    pub fn with_misfire_grace(mut self, secs: u64) -> Self {
        self.misfire_grace_secs = secs;
        self
    }

    /// Set the per-job instance ceiling
    pub fn with_max_instances(mut self, max: usize) -> Self {
        self.max_instances = max;
        self
    }

    /// Set the timer core scan interval
    pub fn with_tick_interval(mut self, millis: u64) -> Self {
        self.tick_interval_ms = millis;
        self
    }

    /// Set the run-history retention window
    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    /// Set the daily cleanup hour (UTC)
    pub fn with_cleanup_hour(mut self, hour: u8) -> Self {
        self.cleanup_hour = hour;
        self
    }
}

struct EngineInner {
    store: Arc<SchedulerStore>,
    registry: Arc<dyn TaskRegistry>,
    executor: TaskExecutor,
    config: SchedulerConfig,
    jobs: Arc<JobRunner>,
    /// task_id -> timer-core job id for every active schedule
    scheduled_tasks: RwLock<HashMap<String, Uuid>>,
    /// Tasks with an execution currently in flight
    running_tasks: RwLock<HashSet<String>>,
    listeners: RwLock<Vec<(Uuid, Arc<dyn SchedulerListener>)>>,
}

/// Scheduler engine. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SchedulerEngine {
    inner: Arc<EngineInner>,
}

impl SchedulerEngine {
    /// Create a new engine. Call [`SchedulerEngine::start`] to rehydrate
    /// persisted schedules and begin firing.
    pub fn new(
        store: Arc<SchedulerStore>,
        registry: Arc<dyn TaskRegistry>,
        executor: TaskExecutor,
        config: SchedulerConfig,
    ) -> Self {
        let jobs = Arc::new(JobRunner::new(
            Duration::seconds(config.misfire_grace_secs as i64),
            config.max_instances,
            std::time::Duration::from_millis(config.tick_interval_ms),
        ));
        Self {
            inner: Arc::new(EngineInner {
                store,
                registry,
                executor,
                config,
                jobs,
                scheduled_tasks: RwLock::new(HashMap::new()),
                running_tasks: RwLock::new(HashSet::new()),
                listeners: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Start the scheduler: reload persisted schedules, start the timer
    /// core, and register the daily retention-cleanup job.
    pub async fn start(&self) {
        let loaded = self.load_schedules().await;
        self.inner.jobs.start();
        self.register_cleanup_job().await;
        info!(loaded, "task scheduler started");
    }

    /// Stop the timer core. In-flight executions are not cancelled; they
    /// finish cooperatively.
    pub fn shutdown(&self) {
        self.inner.jobs.stop();
        info!("task scheduler shutdown");
    }

    /// Schedule a task for execution, replacing any existing schedule for
    /// the same task id. Returns false (with a log line) if the task is
    /// unknown or the specification does not parse.
    pub async fn schedule_task(
        &self,
        task_id: &str,
        spec: &str,
        start_time: Option<DateTime<Utc>>,
    ) -> bool {
        if !self.inner.registry.exists(task_id).await {
            error!(task_id, "cannot schedule task: not found in registry");
            return false;
        }

        let trigger = match Trigger::parse(spec, start_time) {
            Ok(trigger) => trigger,
            Err(e) => {
                error!(task_id, spec, error = %e, "invalid schedule specification");
                return false;
            }
        };

        let kind = trigger.kind();
        let job_id = Uuid::new_v4();
        let next_run = trigger.next_fire(Utc::now());

        // Replace-on-reschedule: drop the previous job before registering
        // the new one. A missing previous job is fine (one-shots remove
        // themselves after firing).
        let previous = self.inner.scheduled_tasks.read().await.get(task_id).copied();
        if let Some(old_job) = previous {
            if !self.inner.jobs.remove_job(&old_job).await {
                warn!(task_id, job_id = %old_job, "previous job not found in timer core");
            }
        }

        match next_run {
            Some(next) => {
                self.inner
                    .jobs
                    .add_job(job_id, trigger, next, self.fire_callback(task_id))
                    .await;
            }
            None => {
                // Permitted (e.g. a one-shot instant already in the past),
                // but there is nothing to hand the timer core.
                warn!(task_id, spec, "schedule has no future fire time");
            }
        }

        self.inner
            .scheduled_tasks
            .write()
            .await
            .insert(task_id.to_string(), job_id);

        if let Err(e) = self
            .inner
            .store
            .save_schedule(task_id, &job_id.to_string(), kind, spec, next_run)
            .await
        {
            // Degraded mode: the schedule keeps firing in this process but
            // will not survive a restart.
            error!(task_id, error = %e, "failed to persist schedule");
        }

        let human = human_readable(spec);
        self.inner
            .registry
            .set_schedule(task_id, Some(human.clone()), next_run)
            .await;

        self.notify(SchedulerEvent::ScheduleUpdate {
            task_id: task_id.to_string(),
            schedule: ScheduleUpdateInfo {
                job_id,
                schedule_type: kind,
                schedule_value: spec.to_string(),
                human_readable: human,
                next_run_time: next_run,
            },
        })
        .await;

        info!(task_id, spec, "scheduled task");
        true
    }

    /// Cancel a task's schedule. Returns false if the task has none.
    pub async fn cancel_task(&self, task_id: &str) -> bool {
        let job_id = self.inner.scheduled_tasks.write().await.remove(task_id);
        let Some(job_id) = job_id else {
            warn!(task_id, "cannot cancel task: not scheduled");
            return false;
        };

        if !self.inner.jobs.remove_job(&job_id).await {
            // Expected for one-shot jobs that already fired.
            warn!(task_id, job_id = %job_id, "job not found in timer core");
        }

        if let Err(e) = self.inner.store.delete_schedule(task_id).await {
            error!(task_id, error = %e, "failed to delete persisted schedule");
        }

        self.inner.registry.set_schedule(task_id, None, None).await;

        self.notify(SchedulerEvent::ScheduleRemoved {
            task_id: task_id.to_string(),
        })
        .await;

        info!(task_id, "cancelled scheduled task");
        true
    }

    /// Compose the live timer state and the persisted row for one task.
    /// Returns `None` if either side is missing.
    pub async fn get_task_schedule(&self, task_id: &str) -> Option<ScheduleInfo> {
        let job_id = self.inner.scheduled_tasks.read().await.get(task_id).copied()?;
        let (next_fire, trigger) = self.inner.jobs.job_info(&job_id).await?;

        let schedule = match self.inner.store.get_schedule(task_id).await {
            Ok(schedule) => schedule?,
            Err(e) => {
                error!(task_id, error = %e, "failed to read persisted schedule");
                return None;
            }
        };

        Some(ScheduleInfo {
            task_id: task_id.to_string(),
            job_id: job_id.to_string(),
            schedule_type: schedule.schedule_type,
            human_readable: human_readable(&schedule.schedule_value),
            schedule_value: schedule.schedule_value,
            next_run_time: Some(next_fire),
            trigger: trigger.info(),
        })
    }

    /// All composed schedules, keyed by task id. Entries that fail
    /// composition (e.g. a one-shot that just fired) are omitted.
    pub async fn get_all_schedules(&self) -> HashMap<String, ScheduleInfo> {
        let task_ids: Vec<String> = {
            self.inner
                .scheduled_tasks
                .read()
                .await
                .keys()
                .cloned()
                .collect()
        };

        let mut schedules = HashMap::new();
        for task_id in task_ids {
            if let Some(info) = self.get_task_schedule(&task_id).await {
                schedules.insert(task_id, info);
            }
        }
        schedules
    }

    /// Schedules with a planned next firing, soonest first.
    pub async fn upcoming_schedules(&self, limit: usize) -> Vec<ScheduleInfo> {
        let mut upcoming: Vec<ScheduleInfo> = self
            .get_all_schedules()
            .await
            .into_values()
            .filter(|info| info.next_run_time.is_some())
            .collect();
        upcoming.sort_by_key(|info| info.next_run_time);
        upcoming.truncate(limit);
        upcoming
    }

    /// Execution history for a task, newest first.
    pub async fn get_task_runs(&self, task_id: &str, limit: i64) -> Result<Vec<TaskRun>> {
        self.inner.store.get_task_runs(task_id, limit).await
    }

    /// Recent history for every tracked task, newest first per task.
    pub async fn recent_runs(&self, per_task_limit: i64) -> HashMap<String, Vec<TaskRun>> {
        let task_ids: Vec<String> = {
            self.inner
                .scheduled_tasks
                .read()
                .await
                .keys()
                .cloned()
                .collect()
        };

        let mut history = HashMap::new();
        for task_id in task_ids {
            match self.inner.store.get_task_runs(&task_id, per_task_limit).await {
                Ok(runs) => {
                    history.insert(task_id, runs);
                }
                Err(e) => error!(task_id = %task_id, error = %e, "failed to read run history"),
            }
        }
        history
    }

    /// Number of executions currently in flight.
    pub async fn running_count(&self) -> usize {
        self.inner.running_tasks.read().await.len()
    }

    /// Register a listener for scheduler events. Returns an id for
    /// [`SchedulerEngine::remove_listener`].
    pub async fn add_listener(&self, listener: Arc<dyn SchedulerListener>) -> Uuid {
        let listener_id = Uuid::new_v4();
        self.inner
            .listeners
            .write()
            .await
            .push((listener_id, listener));
        listener_id
    }

    /// Remove a listener. Returns false if the id is unknown.
    pub async fn remove_listener(&self, listener_id: Uuid) -> bool {
        let mut listeners = self.inner.listeners.write().await;
        let before = listeners.len();
        listeners.retain(|(id, _)| *id != listener_id);
        listeners.len() != before
    }

    /// Timer callback: execute one scheduled firing of a task.
    ///
    /// All failure modes are contained here; nothing propagates back into
    /// the timer core.
    pub async fn on_fire(&self, task_id: &str) {
        if !self.inner.registry.exists(task_id).await {
            error!(task_id, "cannot execute scheduled task: not found in registry");
            return;
        }

        // Check-and-insert under a single write lock is the per-task
        // mutual-exclusion guard. Overlapping fires are dropped.
        {
            let mut running = self.inner.running_tasks.write().await;
            if !running.insert(task_id.to_string()) {
                warn!(task_id, "task is already running, skipping this fire");
                return;
            }
        }

        let start_time = Utc::now();
        if let Err(e) = self
            .inner
            .store
            .log_task_run(task_id, RunStatus::Running, start_time, None, None)
            .await
        {
            error!(task_id, error = %e, "failed to log run start");
        }

        self.notify(SchedulerEvent::TaskStarted {
            task_id: task_id.to_string(),
            start_time,
        })
        .await;

        self.inner.registry.reset_for_run(task_id).await;

        // No locks are held across this await; the executor may block for an
        // arbitrarily long time. Panics are contained so the slot below is
        // always released.
        let outcome = AssertUnwindSafe((self.inner.executor)(task_id.to_string()))
            .catch_unwind()
            .await;

        let end_time = Utc::now();
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(panic) => Some(panic_message(panic)),
        };

        match failure {
            None => {
                // The executor records the outcome on the registry; read it
                // back for the run record.
                let (status, error) = match self.inner.registry.get(task_id).await {
                    Some(task) => (RunStatus::from(task.status), task.error),
                    None => (
                        RunStatus::Failed,
                        Some("task removed during execution".to_string()),
                    ),
                };

                if let Err(e) = self
                    .inner
                    .store
                    .log_task_run(task_id, status, start_time, Some(end_time), error.as_deref())
                    .await
                {
                    error!(task_id, error = %e, "failed to log run completion");
                }

                self.notify(SchedulerEvent::TaskFinished {
                    task_id: task_id.to_string(),
                    status,
                    start_time,
                    end_time,
                    error,
                })
                .await;
            }
            Some(message) => {
                error!(task_id, error = %message, "scheduled task execution failed");

                if let Err(e) = self
                    .inner
                    .store
                    .log_task_run(
                        task_id,
                        RunStatus::Failed,
                        start_time,
                        Some(end_time),
                        Some(&message),
                    )
                    .await
                {
                    error!(task_id, error = %e, "failed to log run failure");
                }

                self.notify(SchedulerEvent::TaskError {
                    task_id: task_id.to_string(),
                    error: message,
                    end_time,
                })
                .await;
            }
        }

        self.refresh_next_run(task_id).await;

        self.inner.running_tasks.write().await.remove(task_id);
    }

    /// Mirror the timer core's next fire instant onto the registry and the
    /// persisted row after a cycle completes.
    async fn refresh_next_run(&self, task_id: &str) {
        let job_id = self.inner.scheduled_tasks.read().await.get(task_id).copied();
        let next = match job_id {
            Some(job_id) => self
                .inner
                .jobs
                .job_info(&job_id)
                .await
                .map(|(next_fire, _)| next_fire),
            None => None,
        };

        self.inner.registry.set_next_run_time(task_id, next).await;
        if let Err(e) = self.inner.store.update_next_run_time(task_id, next).await {
            debug!(task_id, error = %e, "failed to refresh persisted next run time");
        }
    }

    /// Rehydrate persisted schedules at startup. Unknown tasks are skipped,
    /// as are one-shot schedules whose instant already passed — creating a
    /// past one-shot is permitted, resurrecting one is not.
    async fn load_schedules(&self) -> usize {
        let schedules = match self.inner.store.get_all_schedules().await {
            Ok(schedules) => schedules,
            Err(e) => {
                error!(error = %e, "failed to load persisted schedules");
                return 0;
            }
        };

        let mut loaded = 0;
        for schedule in schedules {
            let task_id = schedule.task_id.as_str();

            if !self.inner.registry.exists(task_id).await {
                warn!(task_id, "cannot load schedule: task not found in registry");
                continue;
            }

            if schedule.schedule_type == ScheduleKind::Date {
                if let Some(at) = triggers::embedded_instant(&schedule.schedule_value) {
                    if at <= Utc::now() {
                        warn!(task_id, instant = %at, "skipping past one-shot schedule");
                        continue;
                    }
                }
            }

            if self
                .schedule_task(task_id, &schedule.schedule_value, None)
                .await
            {
                loaded += 1;
            }
        }
        loaded
    }

    /// Register the daily run-history cleanup with the timer core.
    async fn register_cleanup_job(&self) {
        let expr = format!("0 {} * * *", self.inner.config.cleanup_hour);
        let trigger = match CronSchedule::parse(&expr) {
            Ok(cron) => Trigger::Cron(cron),
            Err(e) => {
                error!(error = %e, "invalid cleanup schedule");
                return;
            }
        };

        let now = Utc::now();
        let Some(next) = trigger.next_fire(now) else {
            return;
        };

        let store = Arc::clone(&self.inner.store);
        let retention_days = self.inner.config.retention_days;
        let callback: JobCallback = Arc::new(move || {
            let store = Arc::clone(&store);
            Box::pin(async move {
                match store.cleanup_old_runs(retention_days).await {
                    Ok(0) => debug!("no old task runs to clean up"),
                    Ok(deleted) => {
                        info!(deleted, retention_days, "cleaned up old task runs");
                    }
                    Err(e) => error!(error = %e, "run history cleanup failed"),
                }
            })
        });

        self.inner
            .jobs
            .add_job(Uuid::new_v4(), trigger, next, callback)
            .await;
    }

    fn fire_callback(&self, task_id: &str) -> JobCallback {
        let engine = self.clone();
        let task_id = task_id.to_string();
        Arc::new(move || {
            let engine = engine.clone();
            let task_id = task_id.clone();
            Box::pin(async move {
                engine.on_fire(&task_id).await;
            })
        })
    }

    /// Deliver an event to every listener. A panicking listener is caught
    /// and logged; it cannot break delivery to the others or abort the
    /// operation that emitted the event.
    async fn notify(&self, event: SchedulerEvent) {
        let listeners: Vec<Arc<dyn SchedulerListener>> = {
            self.inner
                .listeners
                .read()
                .await
                .iter()
                .map(|(_, listener)| Arc::clone(listener))
                .collect()
        };

        for listener in listeners {
            if let Err(panic) =
                std::panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(&event)))
            {
                error!(error = %panic_message(panic), "scheduler listener failed");
            }
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panicked".to_string()
    }
}

/// Builder for creating a [`SchedulerEngine`]
#[derive(Default)]
pub struct SchedulerEngineBuilder {
    store: Option<Arc<SchedulerStore>>,
    registry: Option<Arc<dyn TaskRegistry>>,
    executor: Option<TaskExecutor>,
    config: Option<SchedulerConfig>,
}

impl SchedulerEngineBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence store
    pub fn store(mut self, store: Arc<SchedulerStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the task registry
    pub fn registry(mut self, registry: Arc<dyn TaskRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the executor callback
    pub fn executor(mut self, executor: TaskExecutor) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Set the configuration
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Build the engine
    pub fn build(self) -> Result<SchedulerEngine> {
        let store = self
            .store
            .ok_or_else(|| SchedulerError::InvalidConfig("store is required".to_string()))?;
        let registry = self
            .registry
            .ok_or_else(|| SchedulerError::InvalidConfig("registry is required".to_string()))?;
        let executor = self
            .executor
            .ok_or_else(|| SchedulerError::InvalidConfig("executor is required".to_string()))?;

        Ok(SchedulerEngine::new(
            store,
            registry,
            executor,
            self.config.unwrap_or_default(),
        ))
    }
}

#[cfg(test)]
mod tests;
