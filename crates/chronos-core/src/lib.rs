//! Chronos Core - Task Scheduling Engine
//!
//! This crate provides the persistent, trigger-driven task scheduler for the
//! Chronos agent:
//! - Triggers: parsing schedule specifications (cron, interval, one-shot)
//! - Store: SQLite persistence for schedules and run history
//! - Engine: registration, firing, mutual exclusion, rehydration, retention
//! - Registry: the task-registry collaborator contract
//!
//! The scheduler treats the actual work as opaque: an async executor callback
//! is invoked per firing, and the task registry is updated as a side effect
//! of the execution lifecycle.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod registry;
pub mod scheduler;

pub use registry::{InMemoryTaskRegistry, TaskRecord, TaskRegistry, TaskStatus};
pub use scheduler::{
    human_readable, Result as SchedulerResult, RunStatus, Schedule, ScheduleInfo, ScheduleKind,
    SchedulerConfig, SchedulerEngine, SchedulerEngineBuilder, SchedulerError, SchedulerEvent,
    SchedulerListener, SchedulerStore, TaskExecutor, TaskRun, Trigger,
};
