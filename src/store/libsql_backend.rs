//! libSQL backend — async `JobHistory` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::model::{JobProgress, JobRecord};
use crate::store::migrations;
use crate::store::traits::JobHistory;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_datetime)
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn opt_datetime(dt: Option<DateTime<Utc>>) -> libsql::Value {
    opt_text_owned(dt.map(|dt| dt.to_rfc3339()))
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String, DatabaseError> {
    serde_json::to_string(value)
        .map_err(|e| DatabaseError::Serialization(format!("{what}: {e}")))
}

const JOB_COLUMNS: &str = "id, kind, config, command, status, created_at, started_at, completed_at, output_lines, files_processed, current_file, last_progress_update, return_code, stats, stats_error, error";

/// Map a libsql Row to a JobRecord.
///
/// Column order matches JOB_COLUMNS.
fn row_to_job(row: &libsql::Row) -> Result<JobRecord, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Query(format!("row_to_job: {e}"));

    let id_str: String = row.get(0).map_err(read)?;
    let kind_str: String = row.get(1).map_err(read)?;
    let command_str: String = row.get(3).map_err(read)?;
    let status_str: String = row.get(4).map_err(read)?;
    let created_str: String = row.get(5).map_err(read)?;
    let output_str: String = row.get::<String>(8).unwrap_or_else(|_| "[]".to_string());

    // Unreadable stats are dropped rather than hiding the whole job.
    let stats = row
        .get::<String>(13)
        .ok()
        .and_then(|s| match serde_json::from_str(&s) {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!(job_id = %id_str, "Ignoring unreadable stats column: {e}");
                None
            }
        });

    Ok(JobRecord {
        id: Uuid::parse_str(&id_str).map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        kind: kind_str.parse().map_err(DatabaseError::Serialization)?,
        command: serde_json::from_str(&command_str)
            .map_err(|e| DatabaseError::Serialization(format!("command: {e}")))?,
        config: row.get(2).map_err(read)?,
        status: status_str.parse().map_err(DatabaseError::Serialization)?,
        created_at: parse_datetime(&created_str),
        started_at: parse_optional_datetime(row.get::<String>(6).ok()),
        completed_at: parse_optional_datetime(row.get::<String>(7).ok()),
        output_lines: serde_json::from_str(&output_str).unwrap_or_default(),
        progress: JobProgress {
            files_processed: row.get::<i64>(9).unwrap_or(0).max(0) as u64,
            current_file: row.get::<String>(10).ok(),
            last_update: parse_optional_datetime(row.get::<String>(11).ok()),
        },
        return_code: row.get::<i64>(12).ok().map(|c| c as i32),
        stats,
        stats_error: row.get::<String>(14).ok(),
        error: row.get::<String>(15).ok(),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl JobHistory for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn save_job(&self, job: &JobRecord) -> Result<(), DatabaseError> {
        let conn = self.conn();

        let stats = job
            .stats
            .as_ref()
            .map(|stats| to_json(stats, "stats"))
            .transpose()?;
        let return_code = match job.return_code {
            Some(code) => libsql::Value::Integer(code as i64),
            None => libsql::Value::Null,
        };

        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO job_history ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
            ),
            params![
                job.id.to_string(),
                job.kind.to_string(),
                job.config.clone(),
                to_json(&job.command, "command")?,
                job.status.to_string(),
                job.created_at.to_rfc3339(),
                opt_datetime(job.started_at),
                opt_datetime(job.completed_at),
                to_json(&job.output_lines, "output_lines")?,
                job.progress.files_processed as i64,
                opt_text_owned(job.progress.current_file.clone()),
                opt_datetime(job.progress.last_update),
                return_code,
                opt_text_owned(stats),
                opt_text_owned(job.stats_error.clone()),
                opt_text_owned(job.error.clone()),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("save_job: {e}")))?;

        debug!(job_id = %job.id, status = %job.status, "Job saved");
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<JobRecord>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM job_history WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_job: {e}"))),
        }
    }

    async fn list_jobs(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<JobRecord>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM job_history ORDER BY created_at DESC LIMIT ?1 OFFSET ?2"
                ),
                params![limit as i64, offset as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_jobs: {e}")))?;

        let mut jobs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_job(&row) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!("Skipping job row: {e}"),
            }
        }
        Ok(jobs)
    }

    async fn delete_job(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let count = conn
            .execute(
                "DELETE FROM job_history WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_job: {e}")))?;
        Ok(count > 0)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
