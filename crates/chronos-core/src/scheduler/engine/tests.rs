use super::*;
use crate::registry::{InMemoryTaskRegistry, TaskRecord, TaskStatus};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;

use tempfile::TempDir;

struct TestContext {
    engine: SchedulerEngine,
    registry: Arc<InMemoryTaskRegistry>,
    store: Arc<SchedulerStore>,
    executions: Arc<AtomicUsize>,
    _dir: TempDir,
}

/// Executor that marks the task completed on the registry.
fn completing_executor(
    registry: Arc<InMemoryTaskRegistry>,
    executions: Arc<AtomicUsize>,
) -> TaskExecutor {
    Arc::new(move |task_id: String| {
        let registry = Arc::clone(&registry);
        let executions = Arc::clone(&executions);
        Box::pin(async move {
            executions.fetch_add(1, Ordering::SeqCst);
            registry
                .update(&task_id, |record| {
                    record.status = TaskStatus::Completed;
                    record.progress = 100;
                    record.result = Some("done".to_string());
                })
                .await;
            Ok(())
        })
    })
}

async fn create_test_context_with(executor: Option<TaskExecutor>) -> TestContext {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test_scheduler.db");
    let store = Arc::new(SchedulerStore::from_path(&path).await.unwrap());
    let registry = Arc::new(InMemoryTaskRegistry::new());
    registry.insert(TaskRecord::new("t1")).await;

    let executions = Arc::new(AtomicUsize::new(0));
    let executor = executor.unwrap_or_else(|| {
        completing_executor(Arc::clone(&registry), Arc::clone(&executions))
    });

    let engine = SchedulerEngine::new(
        Arc::clone(&store),
        Arc::clone(&registry) as Arc<dyn TaskRegistry>,
        executor,
        SchedulerConfig::new().with_tick_interval(100),
    );

    TestContext {
        engine,
        registry,
        store,
        executions,
        _dir: dir,
    }
}

async fn create_test_context() -> TestContext {
    create_test_context_with(None).await
}

/// Listener that records event type tags.
fn recording_listener() -> (Arc<StdMutex<Vec<String>>>, Arc<dyn SchedulerListener>) {
    let events: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let listener = Arc::new(move |event: &SchedulerEvent| {
        let tag = serde_json::to_value(event).unwrap()["type"]
            .as_str()
            .unwrap()
            .to_string();
        sink.lock().unwrap().push(tag);
    });
    (events, listener)
}

#[tokio::test]
async fn test_schedule_task_success() {
    let ctx = create_test_context().await;

    assert!(ctx.engine.schedule_task("t1", "every 10s", None).await);

    let info = ctx.engine.get_task_schedule("t1").await.unwrap();
    assert_eq!(info.schedule_type, ScheduleKind::Interval);
    assert_eq!(info.schedule_value, "every 10s");
    assert_eq!(info.human_readable, "Every 10 seconds");
    assert!(info.next_run_time.is_some());
    assert_eq!(info.trigger["seconds"], 10);

    let record = ctx.registry.get("t1").await.unwrap();
    assert_eq!(record.schedule.as_deref(), Some("Every 10 seconds"));
    assert!(record.next_run_time.is_some());

    let persisted = ctx.store.get_schedule("t1").await.unwrap().unwrap();
    assert_eq!(persisted.schedule_value, "every 10s");
    assert_eq!(persisted.job_id, info.job_id);
}

#[tokio::test]
async fn test_schedule_unknown_task_fails_fast() {
    let ctx = create_test_context().await;
    let (events, listener) = recording_listener();
    ctx.engine.add_listener(listener).await;

    assert!(!ctx.engine.schedule_task("ghost", "every 10s", None).await);

    assert!(ctx.store.get_schedule("ghost").await.unwrap().is_none());
    assert!(ctx.engine.get_task_schedule("ghost").await.is_none());
    assert!(events.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_schedule_bogus_spec_fails_fast() {
    let ctx = create_test_context().await;
    let (events, listener) = recording_listener();
    ctx.engine.add_listener(listener).await;

    assert!(!ctx.engine.schedule_task("t1", "bogus", None).await);

    assert!(ctx.store.get_schedule("t1").await.unwrap().is_none());
    assert!(ctx.engine.get_task_schedule("t1").await.is_none());
    assert!(events.lock().unwrap().is_empty());

    let record = ctx.registry.get("t1").await.unwrap();
    assert!(record.schedule.is_none());
}

#[tokio::test]
async fn test_reschedule_replaces_previous_job() {
    let ctx = create_test_context().await;

    assert!(ctx.engine.schedule_task("t1", "every 10s", None).await);
    let first = ctx.engine.get_task_schedule("t1").await.unwrap();

    assert!(ctx.engine.schedule_task("t1", "cron:0 9 * * 1-5", None).await);
    let second = ctx.engine.get_task_schedule("t1").await.unwrap();

    assert_ne!(first.job_id, second.job_id);
    assert_eq!(second.schedule_type, ScheduleKind::Cron);
    assert_eq!(second.human_readable, "Cron schedule: 0 9 * * 1-5");

    // Upsert by task id: still exactly one row, one tracked schedule.
    assert_eq!(ctx.store.get_all_schedules().await.unwrap().len(), 1);
    assert_eq!(ctx.engine.get_all_schedules().await.len(), 1);
}

#[tokio::test]
async fn test_cancel_task() {
    let ctx = create_test_context().await;
    let (events, listener) = recording_listener();
    ctx.engine.add_listener(listener).await;

    assert!(ctx.engine.schedule_task("t1", "every 10s", None).await);
    assert!(ctx.engine.cancel_task("t1").await);

    assert!(ctx.engine.get_task_schedule("t1").await.is_none());
    assert!(ctx.store.get_schedule("t1").await.unwrap().is_none());

    let record = ctx.registry.get("t1").await.unwrap();
    assert!(record.schedule.is_none());
    assert!(record.next_run_time.is_none());

    assert_eq!(
        *events.lock().unwrap(),
        vec!["schedule_update", "schedule_removed"]
    );

    // Cancelling again is a no-op.
    assert!(!ctx.engine.cancel_task("t1").await);
}

#[tokio::test]
async fn test_on_fire_records_history() {
    let ctx = create_test_context().await;
    let (events, listener) = recording_listener();
    ctx.engine.add_listener(listener).await;

    ctx.engine.on_fire("t1").await;

    assert_eq!(ctx.executions.load(Ordering::SeqCst), 1);

    let runs = ctx.engine.get_task_runs("t1", 10).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].status, RunStatus::Completed);
    assert!(runs[0].end_time.is_some());
    assert_eq!(runs[1].status, RunStatus::Running);
    assert!(runs[1].end_time.is_none());

    let record = ctx.registry.get("t1").await.unwrap();
    assert_eq!(record.status, TaskStatus::Completed);
    assert_eq!(record.progress, 100);

    assert_eq!(*events.lock().unwrap(), vec!["task_started", "task_finished"]);
    assert_eq!(ctx.engine.running_count().await, 0);
}

#[tokio::test]
async fn test_on_fire_unknown_task_is_noop() {
    let ctx = create_test_context().await;

    ctx.engine.on_fire("ghost").await;

    assert_eq!(ctx.executions.load(Ordering::SeqCst), 0);
    assert!(ctx.engine.get_task_runs("ghost", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_overlapping_fires_are_skipped() {
    let registry = Arc::new(InMemoryTaskRegistry::new());
    registry.insert(TaskRecord::new("t1")).await;
    let executions = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(tokio::sync::Notify::new());

    let executor: TaskExecutor = {
        let registry = Arc::clone(&registry);
        let executions = Arc::clone(&executions);
        let gate = Arc::clone(&gate);
        Arc::new(move |task_id: String| {
            let registry = Arc::clone(&registry);
            let executions = Arc::clone(&executions);
            let gate = Arc::clone(&gate);
            Box::pin(async move {
                executions.fetch_add(1, Ordering::SeqCst);
                gate.notified().await;
                registry
                    .update(&task_id, |record| {
                        record.status = TaskStatus::Completed;
                    })
                    .await;
                Ok(())
            })
        })
    };

    let dir = TempDir::new().unwrap();
    let store = Arc::new(
        SchedulerStore::from_path(&dir.path().join("test_scheduler.db"))
            .await
            .unwrap(),
    );
    let engine = SchedulerEngine::new(
        store,
        Arc::clone(&registry) as Arc<dyn TaskRegistry>,
        executor,
        SchedulerConfig::new(),
    );

    // First fire blocks inside the executor, holding the running slot.
    let first = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.on_fire("t1").await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(executions.load(Ordering::SeqCst), 1);

    // Overlapping fire is dropped without touching the executor or history.
    engine.on_fire("t1").await;
    assert_eq!(executions.load(Ordering::SeqCst), 1);

    gate.notify_waiters();
    first.await.unwrap();

    let runs = engine.get_task_runs("t1", 10).await.unwrap();
    let running_rows = runs
        .iter()
        .filter(|run| run.status == RunStatus::Running)
        .count();
    assert_eq!(running_rows, 1);
    assert_eq!(runs.len(), 2);
    assert_eq!(engine.running_count().await, 0);
}

#[tokio::test]
async fn test_executor_error_records_failed_run() {
    let failing: TaskExecutor = Arc::new(|_task_id: String| {
        Box::pin(async { Err(SchedulerError::Execution("boom".to_string())) })
    });
    let ctx = create_test_context_with(Some(failing)).await;
    let (events, listener) = recording_listener();
    ctx.engine.add_listener(listener).await;

    ctx.engine.on_fire("t1").await;

    let runs = ctx.engine.get_task_runs("t1", 10).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert_eq!(runs[0].error.as_deref(), Some("execution error: boom"));

    assert_eq!(*events.lock().unwrap(), vec!["task_started", "task_error"]);
    assert_eq!(ctx.engine.running_count().await, 0);
}

#[tokio::test]
async fn test_executor_panic_is_contained() {
    let panicking: TaskExecutor =
        Arc::new(|_task_id: String| Box::pin(async { panic!("kaboom") }));
    let ctx = create_test_context_with(Some(panicking)).await;

    ctx.engine.on_fire("t1").await;

    let runs = ctx.engine.get_task_runs("t1", 10).await.unwrap();
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert_eq!(runs[0].error.as_deref(), Some("kaboom"));

    // The mutual-exclusion slot is released, so the next fire runs.
    assert_eq!(ctx.engine.running_count().await, 0);
    ctx.engine.on_fire("t1").await;
    assert_eq!(ctx.engine.get_task_runs("t1", 10).await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_listener_panic_does_not_break_delivery() {
    let ctx = create_test_context().await;

    let panicking = Arc::new(|_: &SchedulerEvent| panic!("bad listener"));
    ctx.engine.add_listener(panicking).await;
    let (events, listener) = recording_listener();
    ctx.engine.add_listener(listener).await;

    assert!(ctx.engine.schedule_task("t1", "every 10s", None).await);

    assert_eq!(*events.lock().unwrap(), vec!["schedule_update"]);
}

#[tokio::test]
async fn test_remove_listener_stops_delivery() {
    let ctx = create_test_context().await;
    let (events, listener) = recording_listener();
    let listener_id = ctx.engine.add_listener(listener).await;

    assert!(ctx.engine.remove_listener(listener_id).await);
    assert!(!ctx.engine.remove_listener(listener_id).await);

    ctx.engine.schedule_task("t1", "every 10s", None).await;
    assert!(events.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_past_one_shot_schedules_but_is_pruned_on_reload() {
    let ctx = create_test_context().await;

    // Creating a past-dated one-shot succeeds; only a warning is logged.
    assert!(
        ctx.engine
            .schedule_task("t1", "at:2020-01-01T00:00:00", None)
            .await
    );
    let persisted = ctx.store.get_schedule("t1").await.unwrap().unwrap();
    assert_eq!(persisted.schedule_type, ScheduleKind::Date);
    assert!(persisted.next_run_time.is_none());

    // A fresh engine over the same store drops it at reload.
    let executions = Arc::new(AtomicUsize::new(0));
    let engine2 = SchedulerEngine::new(
        Arc::clone(&ctx.store),
        Arc::clone(&ctx.registry) as Arc<dyn TaskRegistry>,
        completing_executor(Arc::clone(&ctx.registry), executions),
        SchedulerConfig::new().with_tick_interval(100),
    );
    engine2.start().await;

    assert!(engine2.get_task_schedule("t1").await.is_none());
    assert!(engine2.get_all_schedules().await.is_empty());

    engine2.shutdown();
}

#[tokio::test]
async fn test_reload_restores_schedules() {
    let ctx = create_test_context().await;
    ctx.registry.insert(TaskRecord::new("t2")).await;

    assert!(ctx.engine.schedule_task("t1", "every 1h", None).await);
    assert!(ctx.engine.schedule_task("t2", "cron:0 9 * * *", None).await);

    let executions = Arc::new(AtomicUsize::new(0));
    let engine2 = SchedulerEngine::new(
        Arc::clone(&ctx.store),
        Arc::clone(&ctx.registry) as Arc<dyn TaskRegistry>,
        completing_executor(Arc::clone(&ctx.registry), executions),
        SchedulerConfig::new().with_tick_interval(100),
    );
    engine2.start().await;

    let schedules = engine2.get_all_schedules().await;
    assert_eq!(schedules.len(), 2);
    assert_eq!(schedules["t1"].schedule_value, "every 1h");
    assert_eq!(schedules["t2"].schedule_value, "cron:0 9 * * *");

    engine2.shutdown();
}

#[tokio::test]
async fn test_reload_skips_unknown_tasks() {
    let ctx = create_test_context().await;

    assert!(ctx.engine.schedule_task("t1", "every 1h", None).await);
    ctx.registry.remove("t1").await;

    let executions = Arc::new(AtomicUsize::new(0));
    let engine2 = SchedulerEngine::new(
        Arc::clone(&ctx.store),
        Arc::clone(&ctx.registry) as Arc<dyn TaskRegistry>,
        completing_executor(Arc::clone(&ctx.registry), executions),
        SchedulerConfig::new().with_tick_interval(100),
    );
    engine2.start().await;

    assert!(engine2.get_all_schedules().await.is_empty());
    engine2.shutdown();
}

#[tokio::test]
async fn test_upcoming_schedules_sorted() {
    let ctx = create_test_context().await;
    ctx.registry.insert(TaskRecord::new("t2")).await;
    ctx.registry.insert(TaskRecord::new("t3")).await;

    assert!(ctx.engine.schedule_task("t1", "every 1d", None).await);
    assert!(ctx.engine.schedule_task("t2", "every 10s", None).await);
    assert!(ctx.engine.schedule_task("t3", "every 1h", None).await);

    let upcoming = ctx.engine.upcoming_schedules(10).await;
    assert_eq!(upcoming.len(), 3);
    assert_eq!(upcoming[0].task_id, "t2");
    assert_eq!(upcoming[1].task_id, "t3");
    assert_eq!(upcoming[2].task_id, "t1");

    let top = ctx.engine.upcoming_schedules(1).await;
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].task_id, "t2");
}

#[tokio::test]
async fn test_recent_runs_covers_tracked_tasks() {
    let ctx = create_test_context().await;
    ctx.registry.insert(TaskRecord::new("t2")).await;

    assert!(ctx.engine.schedule_task("t1", "every 1h", None).await);
    assert!(ctx.engine.schedule_task("t2", "every 1h", None).await);
    ctx.engine.on_fire("t1").await;

    let history = ctx.engine.recent_runs(5).await;
    assert_eq!(history.len(), 2);
    assert_eq!(history["t1"].len(), 2);
    assert!(history["t2"].is_empty());
}

#[tokio::test]
async fn test_timer_fires_scheduled_task() {
    let ctx = create_test_context().await;
    ctx.engine.start().await;

    assert!(ctx.engine.schedule_task("t1", "every 1s", None).await);
    let first_next = ctx.registry.get("t1").await.unwrap().next_run_time.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(2_500)).await;

    assert!(ctx.executions.load(Ordering::SeqCst) >= 1);
    let runs = ctx.engine.get_task_runs("t1", 10).await.unwrap();
    assert!(runs.len() >= 2);

    // The advertised next fire advances with each cycle.
    let record = ctx.registry.get("t1").await.unwrap();
    assert!(record.next_run_time.unwrap() > first_next);
    assert_eq!(record.status, TaskStatus::Completed);

    ctx.engine.shutdown();
}

#[tokio::test]
async fn test_builder_requires_collaborators() {
    let result = SchedulerEngineBuilder::new().build();
    assert!(matches!(result, Err(SchedulerError::InvalidConfig(_))));

    let ctx = create_test_context().await;
    let executions = Arc::new(AtomicUsize::new(0));
    let engine = SchedulerEngineBuilder::new()
        .store(Arc::clone(&ctx.store))
        .registry(Arc::clone(&ctx.registry) as Arc<dyn TaskRegistry>)
        .executor(completing_executor(Arc::clone(&ctx.registry), executions))
        .config(SchedulerConfig::new().with_retention_days(7))
        .build()
        .unwrap();

    assert_eq!(engine.running_count().await, 0);
}

#[test]
fn test_config_builders() {
    let config = SchedulerConfig::new()
        .with_misfire_grace(120)
        .with_max_instances(5)
        .with_tick_interval(250)
        .with_retention_days(14)
        .with_cleanup_hour(3);

    assert_eq!(config.misfire_grace_secs, 120);
    assert_eq!(config.max_instances, 5);
    assert_eq!(config.tick_interval_ms, 250);
    assert_eq!(config.retention_days, 14);
    assert_eq!(config.cleanup_hour, 3);
    assert!(config.persistence_path.is_none());
}
