//! Scheduler types and error definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::registry::TaskStatus;

use super::triggers::ParseError;

/// Result type for scheduler operations
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Scheduler error types
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed schedule specification
    #[error("invalid schedule: {0}")]
    Parse(#[from] ParseError),
    /// Task not found in the registry
    #[error("task not found: {0}")]
    TaskNotFound(String),
    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Task execution error
    #[error("execution error: {0}")]
    Execution(String),
}

/// Kind of schedule attached to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    /// Crontab expression
    Cron,
    /// Fixed repeating interval
    Interval,
    /// One-shot at an absolute instant
    Date,
    /// Unrecognized legacy shape; never produced by the engine itself
    Unknown,
}

impl ScheduleKind {
    /// Stable string form used in the database and in events.
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleKind::Cron => "cron",
            ScheduleKind::Interval => "interval",
            ScheduleKind::Date => "date",
            ScheduleKind::Unknown => "unknown",
        }
    }

    fn from_db(value: &str) -> Self {
        match value {
            "cron" => ScheduleKind::Cron,
            "interval" => ScheduleKind::Interval,
            "date" => ScheduleKind::Date,
            _ => ScheduleKind::Unknown,
        }
    }
}

/// Terminal status of a single execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Attempt has started and not yet finished
    Running,
    /// Attempt finished successfully
    Completed,
    /// Attempt finished with an error (or without reaching a terminal state)
    Failed,
}

impl RunStatus {
    /// Stable string form used in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    fn from_db(value: &str) -> Self {
        match value {
            "running" => RunStatus::Running,
            "completed" => RunStatus::Completed,
            _ => RunStatus::Failed,
        }
    }
}

impl From<TaskStatus> for RunStatus {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Completed => RunStatus::Completed,
            // A record still pending/running after the executor returned did
            // not reach a terminal state; the run table only admits the
            // three run statuses.
            TaskStatus::Pending | TaskStatus::Running | TaskStatus::Failed => RunStatus::Failed,
        }
    }
}

/// A persisted schedule. At most one exists per task id.
#[derive(Debug, Clone, Serialize)]
pub struct Schedule {
    /// Owning task id (unique key)
    pub task_id: String,
    /// Timer-core job id from the most recent registration
    pub job_id: String,
    /// Schedule kind
    pub schedule_type: ScheduleKind,
    /// The raw specification string; re-parsed on every load
    pub schedule_value: String,
    /// When the schedule was first created
    pub created_at: DateTime<Utc>,
    /// Next planned firing at the time of the last save
    pub next_run_time: Option<DateTime<Utc>>,
}

/// One row of execution history for a task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRun {
    /// Monotonic row id
    pub id: i64,
    /// Owning task id
    pub task_id: String,
    /// Run status recorded by this row
    pub status: RunStatus,
    /// When the attempt started
    pub start_time: DateTime<Utc>,
    /// When the attempt finished, if this is a terminal row
    pub end_time: Option<DateTime<Utc>>,
    /// Error message, if the attempt failed
    pub error: Option<String>,
}

/// Composed live + persisted view of a task's schedule.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleInfo {
    /// Owning task id
    pub task_id: String,
    /// Timer-core job id
    pub job_id: String,
    /// Schedule kind
    pub schedule_type: ScheduleKind,
    /// The raw specification string
    pub schedule_value: String,
    /// Human-readable rendering of the specification
    pub human_readable: String,
    /// Next planned firing per the live timer core
    pub next_run_time: Option<DateTime<Utc>>,
    /// Trigger introspection (per-field cron strings, interval seconds, ...)
    pub trigger: serde_json::Value,
}

/// Internal row type for schedule queries
#[derive(FromRow)]
pub(super) struct ScheduleRow {
    pub task_id: String,
    pub job_id: String,
    pub schedule_type: String,
    pub schedule_value: String,
    pub created_at: DateTime<Utc>,
    pub next_run_time: Option<DateTime<Utc>>,
}

impl From<ScheduleRow> for Schedule {
    fn from(row: ScheduleRow) -> Self {
        Schedule {
            task_id: row.task_id,
            job_id: row.job_id,
            schedule_type: ScheduleKind::from_db(&row.schedule_type),
            schedule_value: row.schedule_value,
            created_at: row.created_at,
            next_run_time: row.next_run_time,
        }
    }
}

/// Internal row type for run-history queries
#[derive(FromRow)]
pub(super) struct TaskRunRow {
    pub id: i64,
    pub task_id: String,
    pub status: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl From<TaskRunRow> for TaskRun {
    fn from(row: TaskRunRow) -> Self {
        TaskRun {
            id: row.id,
            task_id: row.task_id,
            status: RunStatus::from_db(&row.status),
            start_time: row.start_time,
            end_time: row.end_time,
            error: row.error,
        }
    }
}
