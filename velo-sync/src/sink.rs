//! Durable record of sync runs
//!
//! The engine works entirely in memory; the sink is the only persistence
//! boundary. Sink failures are logged by callers and never abort a run.

use crate::error::{SyncError, SyncResult};
use crate::types::{SyncJobType, SyncRun, SyncRunStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn record_run(&self, run: &SyncRun) -> SyncResult<()>;

    /// Recent runs for a job, newest first
    async fn recent_runs(&self, job: SyncJobType, limit: u32) -> SyncResult<Vec<SyncRun>>;

    /// Delete runs that started before the cutoff; returns rows removed
    async fn prune_runs_before(&self, cutoff: DateTime<Utc>) -> SyncResult<u64>;
}

/// SQLite-backed sink
pub struct SqliteSink {
    pool: SqlitePool,
}

impl SqliteSink {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> SyncResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_runs (
                id TEXT PRIMARY KEY,
                job_type TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                status TEXT NOT NULL,
                items_processed INTEGER NOT NULL DEFAULT 0,
                items_new INTEGER NOT NULL DEFAULT 0,
                items_updated INTEGER NOT NULL DEFAULT 0,
                error_count INTEGER NOT NULL DEFAULT 0,
                error_message TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sync_runs_job_started \
             ON sync_runs (job_type, started_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

fn db_err(e: sqlx::Error) -> SyncError {
    SyncError::Internal(format!("database: {e}"))
}

fn row_to_run(row: sqlx::sqlite::SqliteRow) -> SyncResult<SyncRun> {
    let parse_ts = |s: &str| {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| SyncError::Internal(format!("bad timestamp in sync_runs: {e}")))
    };

    let id: String = row.get("id");
    let job_type: String = row.get("job_type");
    let started_at: String = row.get("started_at");
    let completed_at: Option<String> = row.get("completed_at");
    let status: String = row.get("status");

    Ok(SyncRun {
        id: Uuid::parse_str(&id)
            .map_err(|e| SyncError::Internal(format!("bad run id in sync_runs: {e}")))?,
        job_type: job_type.parse::<SyncJobType>().map_err(SyncError::Internal)?,
        started_at: parse_ts(&started_at)?,
        completed_at: completed_at.as_deref().map(parse_ts).transpose()?,
        status: status.parse::<SyncRunStatus>().map_err(SyncError::Internal)?,
        items_processed: row.get::<i64, _>("items_processed") as u64,
        items_new: row.get::<i64, _>("items_new") as u64,
        items_updated: row.get::<i64, _>("items_updated") as u64,
        error_count: row.get::<i64, _>("error_count") as u64,
        error_message: row.get("error_message"),
    })
}

#[async_trait]
impl PersistenceSink for SqliteSink {
    async fn record_run(&self, run: &SyncRun) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO sync_runs
                (id, job_type, started_at, completed_at, status,
                 items_processed, items_new, items_updated, error_count, error_message)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run.id.to_string())
        .bind(run.job_type.as_str())
        .bind(run.started_at.to_rfc3339())
        .bind(run.completed_at.map(|t| t.to_rfc3339()))
        .bind(run.status.as_str())
        .bind(run.items_processed as i64)
        .bind(run.items_new as i64)
        .bind(run.items_updated as i64)
        .bind(run.error_count as i64)
        .bind(run.error_message.as_deref())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn recent_runs(&self, job: SyncJobType, limit: u32) -> SyncResult<Vec<SyncRun>> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_type, started_at, completed_at, status,
                   items_processed, items_new, items_updated, error_count, error_message
            FROM sync_runs
            WHERE job_type = ?
            ORDER BY started_at DESC
            LIMIT ?
            "#,
        )
        .bind(job.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(row_to_run).collect()
    }

    async fn prune_runs_before(&self, cutoff: DateTime<Utc>) -> SyncResult<u64> {
        let result = sqlx::query("DELETE FROM sync_runs WHERE started_at < ?")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}

/// No-op sink for tests and database-less operation
pub struct NullSink;

#[async_trait]
impl PersistenceSink for NullSink {
    async fn record_run(&self, _run: &SyncRun) -> SyncResult<()> {
        Ok(())
    }

    async fn recent_runs(&self, _job: SyncJobType, _limit: u32) -> SyncResult<Vec<SyncRun>> {
        Ok(Vec::new())
    }

    async fn prune_runs_before(&self, _cutoff: DateTime<Utc>) -> SyncResult<u64> {
        Ok(0)
    }
}
