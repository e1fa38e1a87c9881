//! Scheduler lifecycle events delivered to registered listeners.
//!
//! Event shapes (tag and field names) are part of the external contract;
//! WebSocket and SSE layers forward them to clients as-is.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::types::{RunStatus, ScheduleKind};

/// Events emitted by the scheduler engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    /// A schedule was created or replaced
    ScheduleUpdate {
        /// Owning task id
        task_id: String,
        /// The new schedule
        schedule: ScheduleUpdateInfo,
    },
    /// A schedule was cancelled
    ScheduleRemoved {
        /// Owning task id
        task_id: String,
    },
    /// A scheduled execution began
    TaskStarted {
        /// Owning task id
        task_id: String,
        /// When the attempt started
        start_time: DateTime<Utc>,
    },
    /// A scheduled execution finished (the task itself may still have failed)
    TaskFinished {
        /// Owning task id
        task_id: String,
        /// Terminal run status
        status: RunStatus,
        /// When the attempt started
        start_time: DateTime<Utc>,
        /// When the attempt finished
        end_time: DateTime<Utc>,
        /// Error reported by the task, if any
        error: Option<String>,
    },
    /// The executor itself failed or panicked, distinct from the task
    /// reporting a failed status
    TaskError {
        /// Owning task id
        task_id: String,
        /// Executor error text
        error: String,
        /// When the attempt ended
        end_time: DateTime<Utc>,
    },
}

/// Schedule details carried by [`SchedulerEvent::ScheduleUpdate`].
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleUpdateInfo {
    /// Timer-core job id for this registration
    pub job_id: Uuid,
    /// Schedule kind
    pub schedule_type: ScheduleKind,
    /// The raw specification string
    pub schedule_value: String,
    /// Human-readable rendering
    pub human_readable: String,
    /// Next planned firing
    pub next_run_time: Option<DateTime<Utc>>,
}

/// Listener for scheduler events.
///
/// Listeners are invoked synchronously on the firing path; a panicking
/// listener is caught and logged without affecting delivery to the others.
/// Any `Fn(&SchedulerEvent)` closure implements this trait.
pub trait SchedulerListener: Send + Sync {
    /// Handle one event.
    fn on_event(&self, event: &SchedulerEvent);
}

impl<F> SchedulerListener for F
where
    F: Fn(&SchedulerEvent) + Send + Sync,
{
    fn on_event(&self, event: &SchedulerEvent) {
        self(event)
    }
}
