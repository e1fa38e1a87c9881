//! Task registry collaborator contract.
//!
//! The scheduler does not own task definitions; it looks them up in a
//! registry and mirrors execution state onto them. Hosts implement
//! [`TaskRegistry`] over their own task storage, or use the bundled
//! [`InMemoryTaskRegistry`].

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Lifecycle status of a registered task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued or reset, waiting to run
    Pending,
    /// Currently executing
    Running,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
}

/// A task as seen by the scheduler.
///
/// The executor owns `status`/`progress`/`result`/`error` during a run; the
/// scheduler resets them before each firing and reads them back afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique task id
    pub id: String,
    /// Current lifecycle status
    pub status: TaskStatus,
    /// Completion percentage (0-100)
    pub progress: u8,
    /// Final output, if any
    pub result: Option<String>,
    /// Error message, if the last run failed
    pub error: Option<String>,
    /// Human-readable schedule description, set while scheduled
    pub schedule: Option<String>,
    /// Next planned firing, set while scheduled
    pub next_run_time: Option<DateTime<Utc>>,
    /// Last modification timestamp
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Create a fresh pending task record.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: TaskStatus::Pending,
            progress: 0,
            result: None,
            error: None,
            schedule: None,
            next_run_time: None,
            updated_at: Utc::now(),
        }
    }
}

/// Registry of tasks known to the host application.
///
/// Deleting a task on the registry side must be paired with a
/// `cancel_task` call on the engine; the scheduler does not watch for
/// removals.
#[async_trait]
pub trait TaskRegistry: Send + Sync {
    /// Whether a task with this id exists.
    async fn exists(&self, task_id: &str) -> bool;

    /// Fetch a snapshot of the task record.
    async fn get(&self, task_id: &str) -> Option<TaskRecord>;

    /// Mirror schedule info onto the task. `None` clears both fields.
    async fn set_schedule(
        &self,
        task_id: &str,
        schedule: Option<String>,
        next_run_time: Option<DateTime<Utc>>,
    );

    /// Update only the advertised next firing.
    async fn set_next_run_time(&self, task_id: &str, next_run_time: Option<DateTime<Utc>>);

    /// Reset execution state ahead of a scheduled run: status back to
    /// pending, progress zeroed, result and error cleared.
    async fn reset_for_run(&self, task_id: &str);
}

/// Simple in-memory registry, suitable for tests and single-process hosts.
#[derive(Default)]
pub struct InMemoryTaskRegistry {
    tasks: RwLock<HashMap<String, TaskRecord>>,
}

impl InMemoryTaskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a task record.
    pub async fn insert(&self, record: TaskRecord) {
        self.tasks.write().await.insert(record.id.clone(), record);
    }

    /// Remove a task record, returning it if present.
    pub async fn remove(&self, task_id: &str) -> Option<TaskRecord> {
        self.tasks.write().await.remove(task_id)
    }

    /// Apply a mutation to a task record in place. Returns false if the
    /// task does not exist.
    pub async fn update<F>(&self, task_id: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut TaskRecord),
    {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(task_id) {
            Some(record) => {
                mutate(record);
                record.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl TaskRegistry for InMemoryTaskRegistry {
    async fn exists(&self, task_id: &str) -> bool {
        self.tasks.read().await.contains_key(task_id)
    }

    async fn get(&self, task_id: &str) -> Option<TaskRecord> {
        self.tasks.read().await.get(task_id).cloned()
    }

    async fn set_schedule(
        &self,
        task_id: &str,
        schedule: Option<String>,
        next_run_time: Option<DateTime<Utc>>,
    ) {
        self.update(task_id, |record| {
            record.schedule = schedule;
            record.next_run_time = next_run_time;
        })
        .await;
    }

    async fn set_next_run_time(&self, task_id: &str, next_run_time: Option<DateTime<Utc>>) {
        self.update(task_id, |record| {
            record.next_run_time = next_run_time;
        })
        .await;
    }

    async fn reset_for_run(&self, task_id: &str) {
        self.update(task_id, |record| {
            record.status = TaskStatus::Pending;
            record.progress = 0;
            record.result = None;
            record.error = None;
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_and_get() {
        let registry = InMemoryTaskRegistry::new();
        registry.insert(TaskRecord::new("t1")).await;

        assert!(registry.exists("t1").await);
        assert!(!registry.exists("t2").await);

        let record = registry.get("t1").await.unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.progress, 0);
    }

    #[tokio::test]
    async fn test_set_schedule_and_clear() {
        let registry = InMemoryTaskRegistry::new();
        registry.insert(TaskRecord::new("t1")).await;

        let next = Utc::now();
        registry
            .set_schedule("t1", Some("Every 1 hour".into()), Some(next))
            .await;

        let record = registry.get("t1").await.unwrap();
        assert_eq!(record.schedule.as_deref(), Some("Every 1 hour"));
        assert_eq!(record.next_run_time, Some(next));

        registry.set_schedule("t1", None, None).await;
        let record = registry.get("t1").await.unwrap();
        assert!(record.schedule.is_none());
        assert!(record.next_run_time.is_none());
    }

    #[tokio::test]
    async fn test_reset_for_run() {
        let registry = InMemoryTaskRegistry::new();
        registry.insert(TaskRecord::new("t1")).await;
        registry
            .update("t1", |record| {
                record.status = TaskStatus::Failed;
                record.progress = 80;
                record.error = Some("boom".into());
                record.result = Some("partial".into());
            })
            .await;

        registry.reset_for_run("t1").await;

        let record = registry.get("t1").await.unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.progress, 0);
        assert!(record.result.is_none());
        assert!(record.error.is_none());
    }

    #[tokio::test]
    async fn test_update_missing_task() {
        let registry = InMemoryTaskRegistry::new();
        assert!(!registry.update("ghost", |_| {}).await);
    }
}
