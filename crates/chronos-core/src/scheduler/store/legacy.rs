//! One-time import of the deprecated JSON schedule file.
//!
//! Earlier releases persisted schedules as a single JSON map keyed by task
//! id. The import reconstructs a spec string from each legacy trigger shape,
//! skips task ids that already have a row (so a partial import can be
//! re-run safely), and renames the file afterwards as an audit trail. Any
//! failure leaves the file untouched for a retry on the next startup.

use std::collections::HashMap;
use std::path::Path;

use chrono::Utc;
use serde::Deserialize;
use tracing::debug;

use super::SchedulerStore;
use crate::scheduler::triggers::parse_instant;
use crate::scheduler::types::Result;

#[derive(Debug, Deserialize)]
struct LegacyEntry {
    #[serde(default)]
    job_id: String,
    #[serde(default)]
    trigger: LegacyTrigger,
    #[serde(default)]
    next_run_time: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LegacyTrigger {
    #[serde(rename = "type")]
    kind: Option<String>,
    minute: Option<String>,
    hour: Option<String>,
    day: Option<String>,
    month: Option<String>,
    day_of_week: Option<String>,
    seconds: Option<u64>,
    run_date: Option<String>,
}

impl LegacyTrigger {
    /// Reconstruct `(schedule_type, schedule_value)` from the legacy shape.
    /// Unrecognized shapes map to the literal value "unknown" rather than
    /// failing the whole migration.
    fn to_schedule_value(&self) -> (String, String) {
        let kind = self.kind.as_deref().unwrap_or("unknown").to_string();

        let value = match kind.as_str() {
            "cron" => match (
                self.minute.as_deref(),
                self.hour.as_deref(),
                self.day.as_deref(),
                self.month.as_deref(),
                self.day_of_week.as_deref(),
            ) {
                (Some(minute), Some(hour), Some(day), Some(month), Some(dow)) => {
                    format!("cron:{} {} {} {} {}", minute, hour, day, month, dow)
                }
                _ => "unknown".to_string(),
            },
            "interval" => match self.seconds {
                Some(seconds) if seconds > 0 => {
                    if seconds < 60 {
                        format!("every {}s", seconds)
                    } else if seconds < 3_600 {
                        format!("every {}m", seconds / 60)
                    } else if seconds < 86_400 {
                        format!("every {}h", seconds / 3_600)
                    } else {
                        format!("every {}d", seconds / 86_400)
                    }
                }
                _ => "unknown".to_string(),
            },
            "date" => match &self.run_date {
                Some(run_date) => format!("at:{}", run_date),
                None => "unknown".to_string(),
            },
            _ => "unknown".to_string(),
        };

        (kind, value)
    }
}

impl SchedulerStore {
    /// Import schedules from the legacy JSON file, renaming it with a
    /// `.migrated` suffix on success. Returns the number of rows inserted.
    ///
    /// Already-present task ids are skipped, so running the import against a
    /// partially-populated table never produces duplicates.
    pub(crate) async fn migrate_legacy_json(&self, path: &Path) -> Result<usize> {
        let raw = std::fs::read_to_string(path)?;
        let entries: HashMap<String, LegacyEntry> = serde_json::from_str(&raw)?;
        if entries.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut migrated = 0usize;

        for (task_id, entry) in &entries {
            let existing: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM schedules WHERE task_id = ?")
                    .bind(task_id)
                    .fetch_one(&mut *tx)
                    .await?;
            if existing > 0 {
                debug!(task_id = %task_id, "schedule already migrated, skipping");
                continue;
            }

            let (schedule_type, schedule_value) = entry.trigger.to_schedule_value();
            let next_run_time = entry.next_run_time.as_deref().and_then(parse_instant);

            sqlx::query(
                r#"
                INSERT INTO schedules (task_id, job_id, schedule_type, schedule_value, created_at, next_run_time)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(task_id)
            .bind(&entry.job_id)
            .bind(&schedule_type)
            .bind(&schedule_value)
            .bind(Utc::now())
            .bind(next_run_time)
            .execute(&mut *tx)
            .await?;

            migrated += 1;
        }

        tx.commit().await?;

        // Rename rather than delete, preserving an audit trail.
        std::fs::rename(path, path.with_extension("json.migrated"))?;

        Ok(migrated)
    }
}
