//! Read-side merge of the volatile and durable job stores.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::JobError;
use crate::jobs::model::JobRecord;
use crate::jobs::volatile::VolatileJobStore;
use crate::store::JobHistory;

/// Merge durable rows with the live table and cut one page out of the result.
///
/// `durable` must hold the newest `offset + limit` durable rows. Rows whose
/// id is live are replaced by the live copy. Live jobs listed in
/// `unpersisted` have no durable row yet and are merged in by creation time.
/// The merged list is ordered newest first, then `offset`/`limit` apply.
pub fn merge_listing(
    durable: Vec<JobRecord>,
    live: &HashMap<Uuid, JobRecord>,
    unpersisted: &HashSet<Uuid>,
    limit: usize,
    offset: usize,
) -> Vec<JobRecord> {
    let mut seen = HashSet::with_capacity(durable.len());
    let mut merged: Vec<JobRecord> = durable
        .into_iter()
        .filter(|job| seen.insert(job.id))
        .map(|job| live.get(&job.id).cloned().unwrap_or(job))
        .collect();

    merged.extend(
        unpersisted
            .iter()
            .filter(|id| !seen.contains(*id))
            .filter_map(|id| live.get(id).cloned()),
    );

    merged.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    merged.into_iter().skip(offset).take(limit).collect()
}

/// Consistent view over both stores. Holds no state of its own.
#[derive(Clone)]
pub struct JobReconciler {
    live: Arc<VolatileJobStore>,
    history: Arc<dyn JobHistory>,
}

impl JobReconciler {
    pub fn new(live: Arc<VolatileJobStore>, history: Arc<dyn JobHistory>) -> Self {
        Self { live, history }
    }

    /// Live record if present, else the durable one.
    pub async fn get(&self, id: Uuid) -> Result<JobRecord, JobError> {
        if let Some(job) = self.live.get(id).await {
            return Ok(job);
        }
        match self.history.get_job(id).await {
            Ok(Some(job)) => Ok(job),
            Ok(None) => Err(JobError::NotFound { id }),
            Err(e) => {
                warn!(job_id = %id, "Durable lookup failed: {e}");
                Err(JobError::NotFound { id })
            }
        }
    }

    /// One page of jobs, newest first, never longer than `limit`.
    pub async fn list(&self, limit: usize, offset: usize) -> Vec<JobRecord> {
        // Live-only jobs can sit anywhere in the order, so read every durable
        // row up to the end of the page and slice after merging.
        let window = offset.saturating_add(limit);
        let durable = match self.history.list_jobs(window, 0).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!("Durable listing failed, showing live jobs only: {e}");
                Vec::new()
            }
        };
        let unpersisted = self.live.unpersisted_ids().await;
        let live = self.live.snapshot().await;
        merge_listing(durable, &live, &unpersisted, limit, offset)
    }

    /// Remove a job from both stores.
    pub async fn delete(&self, id: Uuid) -> Result<(), JobError> {
        let removed_live = self.live.remove(id).await;
        let removed_durable = match self.history.delete_job(id).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(job_id = %id, "Durable delete failed: {e}");
                false
            }
        };

        if removed_live || removed_durable {
            debug!(job_id = %id, removed_live, removed_durable, "Job deleted");
            Ok(())
        } else {
            Err(JobError::NotFound { id })
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::{Duration, Utc};

    use super::*;
    use crate::error::DatabaseError;
    use crate::jobs::model::{JobKind, JobStatus};
    use crate::store::LibSqlBackend;

    fn job_at(seconds_ago: i64) -> JobRecord {
        let mut job = JobRecord::new(JobKind::Prune, vec!["borgmatic".into()], "c.yaml");
        job.created_at = Utc::now() - Duration::seconds(seconds_ago);
        job
    }

    fn finished(mut job: JobRecord) -> JobRecord {
        job.transition_to(JobStatus::Running).unwrap();
        job.transition_to(JobStatus::Completed).unwrap();
        job
    }

    async fn reconciler() -> (JobReconciler, Arc<VolatileJobStore>, Arc<LibSqlBackend>) {
        let live = Arc::new(VolatileJobStore::new());
        let history = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let reconciler = JobReconciler::new(live.clone(), history.clone());
        (reconciler, live, history)
    }

    /// History backend whose every call fails.
    struct BrokenHistory;

    #[async_trait]
    impl JobHistory for BrokenHistory {
        async fn run_migrations(&self) -> Result<(), DatabaseError> {
            Ok(())
        }
        async fn save_job(&self, _job: &JobRecord) -> Result<(), DatabaseError> {
            Err(DatabaseError::Query("save_job: disk full".into()))
        }
        async fn get_job(&self, _id: Uuid) -> Result<Option<JobRecord>, DatabaseError> {
            Err(DatabaseError::Query("get_job: locked".into()))
        }
        async fn list_jobs(
            &self,
            _limit: usize,
            _offset: usize,
        ) -> Result<Vec<JobRecord>, DatabaseError> {
            Err(DatabaseError::Query("list_jobs: locked".into()))
        }
        async fn delete_job(&self, _id: Uuid) -> Result<bool, DatabaseError> {
            Err(DatabaseError::Query("delete_job: locked".into()))
        }
    }

    #[test]
    fn merge_prefers_live_copy() {
        let mut stale = finished(job_at(10));
        stale.output_lines = vec!["old".into()];
        let mut fresh = stale.clone();
        fresh.output_lines = vec!["old".into(), "new".into()];

        let live = HashMap::from([(fresh.id, fresh.clone())]);
        let merged = merge_listing(vec![stale], &live, &HashSet::new(), 50, 0);

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].output_lines, ["old", "new"]);
    }

    #[test]
    fn merge_sorts_newest_first() {
        let old = finished(job_at(30));
        let mid = finished(job_at(20));
        let new = job_at(1);

        let live = HashMap::from([(new.id, new.clone())]);
        let unpersisted = HashSet::from([new.id]);
        let merged = merge_listing(vec![mid.clone(), old.clone()], &live, &unpersisted, 50, 0);

        let ids: Vec<Uuid> = merged.iter().map(|j| j.id).collect();
        assert_eq!(ids, [new.id, mid.id, old.id]);
    }

    #[test]
    fn merge_pages_never_exceed_limit() {
        let newest_live = job_at(1);
        let durable: Vec<JobRecord> = (0..4).map(|i| finished(job_at(10 + i))).collect();
        let live = HashMap::from([(newest_live.id, newest_live.clone())]);
        let unpersisted = HashSet::from([newest_live.id]);

        let first = merge_listing(durable.clone(), &live, &unpersisted, 2, 0);
        let ids: Vec<Uuid> = first.iter().map(|j| j.id).collect();
        assert_eq!(ids, [newest_live.id, durable[0].id]);

        let second = merge_listing(durable.clone(), &live, &unpersisted, 2, 2);
        let ids: Vec<Uuid> = second.iter().map(|j| j.id).collect();
        assert_eq!(ids, [durable[1].id, durable[2].id]);
    }

    #[test]
    fn persisted_live_jobs_outside_the_window_are_not_added() {
        let in_window = finished(job_at(5));
        let evicted_from_window = finished(job_at(500));
        let live = HashMap::from([(evicted_from_window.id, evicted_from_window.clone())]);

        let merged = merge_listing(vec![in_window.clone()], &live, &HashSet::new(), 1, 0);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, in_window.id);
    }

    #[tokio::test]
    async fn get_checks_live_then_durable() {
        let (reconciler, live, history) = reconciler().await;

        let running = job_at(1);
        live.insert(running.clone()).await.unwrap();
        let archived = finished(job_at(60));
        history.save_job(&archived).await.unwrap();

        assert_eq!(reconciler.get(running.id).await.unwrap().id, running.id);
        assert_eq!(
            reconciler.get(archived.id).await.unwrap().status,
            JobStatus::Completed
        );
        assert!(matches!(
            reconciler.get(Uuid::new_v4()).await,
            Err(JobError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn list_returns_shared_job_once_with_live_values() {
        let (reconciler, live, history) = reconciler().await;

        let mut job = finished(job_at(5));
        history.save_job(&job).await.unwrap();
        job.output_lines.push("only in memory".into());
        live.insert(job.clone()).await.unwrap();

        let listed = reconciler.list(50, 0).await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].output_lines, ["only in memory"]);
    }

    #[tokio::test]
    async fn pages_cover_live_and_durable_jobs_exactly_once() {
        let (reconciler, live, history) = reconciler().await;
        let mut stored = Vec::new();
        for i in 0..3 {
            let job = finished(job_at(100 + i));
            history.save_job(&job).await.unwrap();
            stored.push(job.id);
        }
        let running = job_at(1);
        live.insert(running.clone()).await.unwrap();

        let first: Vec<Uuid> = reconciler.list(2, 0).await.iter().map(|j| j.id).collect();
        let second: Vec<Uuid> = reconciler.list(2, 2).await.iter().map(|j| j.id).collect();
        assert_eq!(first, [running.id, stored[0]]);
        assert_eq!(second, [stored[1], stored[2]]);
        assert!(reconciler.list(2, 4).await.is_empty());
    }

    #[tokio::test]
    async fn delete_durable_only_succeeds() {
        let (reconciler, _live, history) = reconciler().await;
        let job = finished(job_at(5));
        history.save_job(&job).await.unwrap();

        reconciler.delete(job.id).await.unwrap();
        assert!(history.get_job(job.id).await.unwrap().is_none());
        assert!(matches!(
            reconciler.delete(job.id).await,
            Err(JobError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn delete_removes_from_both_stores() {
        let (reconciler, live, history) = reconciler().await;
        let job = finished(job_at(5));
        history.save_job(&job).await.unwrap();
        live.insert(job.clone()).await.unwrap();

        reconciler.delete(job.id).await.unwrap();
        assert!(live.get(job.id).await.is_none());
        assert!(history.get_job(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn durable_failures_degrade_to_live_view() {
        let live = Arc::new(VolatileJobStore::new());
        let reconciler = JobReconciler::new(live.clone(), Arc::new(BrokenHistory));

        let job = job_at(1);
        live.insert(job.clone()).await.unwrap();

        let listed = reconciler.list(50, 0).await;
        assert_eq!(listed.len(), 1);
        assert_eq!(reconciler.get(job.id).await.unwrap().id, job.id);
        reconciler.delete(job.id).await.unwrap();
        assert!(matches!(
            reconciler.get(job.id).await,
            Err(JobError::NotFound { .. })
        ));
    }
}
