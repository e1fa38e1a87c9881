//! Trigger-driven task scheduling.
//!
//! Decides **when** a registered task runs, guarantees at most one concurrent
//! execution per task, and durably records what happened:
//!
//! ```text
//! ┌─────────────────┐
//! │ SchedulerEngine │  Registration, firing, mutual exclusion
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │    JobRunner    │  Timer core: due-scan loop, misfire grace
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ SchedulerStore  │  SQLite persistence (schedules + run history)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │     Trigger     │  Spec parsing and next-fire computation
//! └─────────────────┘
//! ```
//!
//! Schedule specifications are short human-authored strings:
//!
//! - `"cron:0 9 * * 1-5"` — crontab expression (minute hour dom month dow)
//! - `"every 30m"` — fixed interval, unit one of `s`/`m`/`h`/`d`
//! - `"at:2025-06-01T00:00:00"` — one-shot at an ISO-8601 instant
//! - `"in 2h"` — one-shot relative to now
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use chronos_core::{
//!     InMemoryTaskRegistry, SchedulerConfig, SchedulerEngine, SchedulerStore, TaskRecord,
//! };
//!
//! let store = Arc::new(SchedulerStore::open(&data_dir).await?);
//! let registry = Arc::new(InMemoryTaskRegistry::new());
//! registry.insert(TaskRecord::new("daily_report")).await;
//!
//! let engine = SchedulerEngine::new(store, registry, executor, SchedulerConfig::from_env());
//! engine.start().await?;
//! engine.schedule_task("daily_report", "cron:0 9 * * 1-5", None).await;
//! ```

mod engine;
mod events;
mod jobs;
mod store;
mod triggers;
mod types;

pub use engine::{
    ExecutionFuture, SchedulerConfig, SchedulerEngine, SchedulerEngineBuilder, TaskExecutor,
};
pub use events::{ScheduleUpdateInfo, SchedulerEvent, SchedulerListener};
pub use store::SchedulerStore;
pub use triggers::{
    human_readable, CronField, CronSchedule, DateSchedule, IntervalSchedule, IntervalUnit,
    ParseError, Trigger,
};
pub use types::{
    Result, RunStatus, Schedule, ScheduleInfo, ScheduleKind, SchedulerError, TaskRun,
};
