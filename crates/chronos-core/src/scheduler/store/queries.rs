use chrono::{DateTime, Duration, Utc};

use super::SchedulerStore;
use crate::scheduler::types::{
    Result, RunStatus, Schedule, ScheduleKind, ScheduleRow, TaskRun, TaskRunRow,
};

impl SchedulerStore {
    /// Save a schedule, replacing any existing one for the same task.
    pub async fn save_schedule(
        &self,
        task_id: &str,
        job_id: &str,
        schedule_type: ScheduleKind,
        schedule_value: &str,
        next_run_time: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO schedules (task_id, job_id, schedule_type, schedule_value, created_at, next_run_time)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(task_id) DO UPDATE SET
                job_id = excluded.job_id,
                schedule_type = excluded.schedule_type,
                schedule_value = excluded.schedule_value,
                next_run_time = excluded.next_run_time
            "#,
        )
        .bind(task_id)
        .bind(job_id)
        .bind(schedule_type.as_str())
        .bind(schedule_value)
        .bind(Utc::now())
        .bind(next_run_time)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Delete a task's schedule. Deleting an absent schedule is a no-op.
    pub async fn delete_schedule(&self, task_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM schedules WHERE task_id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Get a task's schedule, if one exists.
    pub async fn get_schedule(&self, task_id: &str) -> Result<Option<Schedule>> {
        let row: Option<ScheduleRow> =
            sqlx::query_as("SELECT * FROM schedules WHERE task_id = ?")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(Schedule::from))
    }

    /// All persisted schedules.
    pub async fn get_all_schedules(&self) -> Result<Vec<Schedule>> {
        let rows: Vec<ScheduleRow> = sqlx::query_as("SELECT * FROM schedules")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Schedule::from).collect())
    }

    /// Update only the advertised next firing of a task's schedule.
    pub async fn update_next_run_time(
        &self,
        task_id: &str,
        next_run_time: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query("UPDATE schedules SET next_run_time = ? WHERE task_id = ?")
            .bind(next_run_time)
            .bind(task_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Append one run-history row. Rows are never updated in place.
    pub async fn log_task_run(
        &self,
        task_id: &str,
        status: RunStatus,
        start_time: DateTime<Utc>,
        end_time: Option<DateTime<Utc>>,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO task_runs (task_id, status, start_time, end_time, error)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(task_id)
        .bind(status.as_str())
        .bind(start_time)
        .bind(end_time)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Recent run history for a task, newest first.
    pub async fn get_task_runs(&self, task_id: &str, limit: i64) -> Result<Vec<TaskRun>> {
        let rows: Vec<TaskRunRow> = sqlx::query_as(
            r#"
            SELECT id, task_id, status, start_time, end_time, error
            FROM task_runs
            WHERE task_id = ?
            ORDER BY start_time DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(task_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(TaskRun::from).collect())
    }

    /// Delete run-history rows older than the retention window. Returns the
    /// number of rows removed.
    pub async fn cleanup_old_runs(&self, retention_days: u32) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));

        let result = sqlx::query("DELETE FROM task_runs WHERE start_time < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
