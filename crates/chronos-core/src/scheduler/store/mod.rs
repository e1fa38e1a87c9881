//! Schedule and run-history storage using SQLite.
//!
//! Persists active schedules and execution history for durability across
//! restarts, and performs the one-time import of the deprecated JSON
//! schedule file.

mod legacy;
mod migrations;
mod queries;


use std::path::Path;

use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use tracing::{error, info};

use super::types::Result;

/// Name of the database file inside the scheduler data directory.
const DB_FILE: &str = "scheduler.db";

/// Name of the deprecated flat-file schedule store.
const LEGACY_FILE: &str = "scheduled_tasks.json";

/// SQLite-based scheduler store
pub struct SchedulerStore {
    pub(super) pool: Pool<Sqlite>,
}

impl SchedulerStore {
    /// Open the store in a data directory, creating `scheduler.db` as
    /// needed and importing the legacy JSON file if one is present.
    pub async fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let store = Self::from_path(&dir.join(DB_FILE)).await?;

        let legacy_path = dir.join(LEGACY_FILE);
        if legacy_path.exists() {
            // A failed import is not fatal: the file is left in place and
            // retried on the next startup.
            match store.migrate_legacy_json(&legacy_path).await {
                Ok(count) => info!(count, "migrated schedules from JSON to SQLite"),
                Err(e) => error!(error = %e, "legacy schedule migration failed"),
            }
        }

        info!(path = %dir.display(), "scheduler store initialized");
        Ok(store)
    }

    /// Create a store from an explicit database path. No legacy import.
    pub async fn from_path(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }
}
