//! `JobHistory` trait — durable persistence for finished jobs.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::model::JobRecord;

/// Backend-agnostic durable job table.
///
/// Written once per job, when it reaches a terminal status.
#[async_trait]
pub trait JobHistory: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    /// Persist a terminal job record (insert or replace by id).
    async fn save_job(&self, job: &JobRecord) -> Result<(), DatabaseError>;

    /// Look up one job by id.
    async fn get_job(&self, id: Uuid) -> Result<Option<JobRecord>, DatabaseError>;

    /// Jobs ordered by creation time, newest first.
    async fn list_jobs(&self, limit: usize, offset: usize)
    -> Result<Vec<JobRecord>, DatabaseError>;

    /// Delete a job. Returns whether a row was removed.
    async fn delete_job(&self, id: Uuid) -> Result<bool, DatabaseError>;
}
