//! In-memory table of live job records.
//!
//! Process-wide, created at startup. Entries live until they are deleted,
//! the process restarts, or the retention sweep evicts them after they
//! have been mirrored to the durable store.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::JobError;
use crate::jobs::model::JobRecord;

#[derive(Debug)]
struct Entry {
    record: JobRecord,
    /// Set once the terminal record has been written durably.
    persisted: bool,
}

/// Shared job table: one writer per job, any number of readers.
///
/// Readers always get a full clone of the record, so they never observe a
/// half-applied update.
#[derive(Debug, Default)]
pub struct VolatileJobStore {
    entries: RwLock<HashMap<Uuid, Entry>>,
}

impl VolatileJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly submitted job.
    pub async fn insert(&self, record: JobRecord) -> Result<(), JobError> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&record.id) {
            return Err(JobError::Duplicate { id: record.id });
        }
        entries.insert(
            record.id,
            Entry {
                record,
                persisted: false,
            },
        );
        Ok(())
    }

    /// Snapshot of one record.
    pub async fn get(&self, id: Uuid) -> Option<JobRecord> {
        self.entries
            .read()
            .await
            .get(&id)
            .map(|entry| entry.record.clone())
    }

    /// Snapshot of every record.
    pub async fn snapshot(&self) -> HashMap<Uuid, JobRecord> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(id, entry)| (*id, entry.record.clone()))
            .collect()
    }

    /// Ids of records that have no durable copy yet.
    pub async fn unpersisted_ids(&self) -> HashSet<Uuid> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|(_, entry)| !entry.persisted)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Apply `f` to a record under the write lock.
    pub async fn update<F, R>(&self, id: Uuid, f: F) -> Result<R, JobError>
    where
        F: FnOnce(&mut JobRecord) -> R,
    {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&id).ok_or(JobError::NotFound { id })?;
        Ok(f(&mut entry.record))
    }

    /// Flag a record as mirrored to the durable store.
    pub async fn mark_persisted(&self, id: Uuid) {
        if let Some(entry) = self.entries.write().await.get_mut(&id) {
            entry.persisted = true;
        }
    }

    /// Remove a record. Returns whether it was present.
    pub async fn remove(&self, id: Uuid) -> bool {
        self.entries.write().await.remove(&id).is_some()
    }

    /// Drop finished, persisted records completed more than `age` ago.
    /// Returns the number of records evicted.
    pub async fn evict_persisted_older_than(&self, age: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| {
            let expired = entry.persisted
                && entry.record.status.is_terminal()
                && entry.record.completed_at.is_some_and(|at| at < cutoff);
            !expired
        });
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(count = evicted, "Evicted persisted jobs from memory");
        }
        evicted
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

/// Spawn a background task that periodically evicts old persisted jobs.
pub fn spawn_retention_task(
    store: Arc<VolatileJobStore>,
    interval: Duration,
    retention: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        // tokio panics on a zero period
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        loop {
            ticker.tick().await;
            let evicted = store.evict_persisted_older_than(retention).await;
            if evicted > 0 {
                info!(count = evicted, "Retention sweep");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::{JobKind, JobStatus};

    fn make_job() -> JobRecord {
        JobRecord::new(JobKind::Prune, vec!["true".into()], "config.yaml")
    }

    fn finished(mut job: JobRecord, ago: chrono::Duration) -> JobRecord {
        job.transition_to(JobStatus::Running).unwrap();
        job.transition_to(JobStatus::Completed).unwrap();
        job.completed_at = Some(Utc::now() - ago);
        job
    }

    #[tokio::test]
    async fn insert_and_get() {
        let store = VolatileJobStore::new();
        assert!(store.is_empty().await);

        let job = make_job();
        let id = job.id;
        store.insert(job).await.unwrap();

        assert_eq!(store.len().await, 1);
        assert_eq!(store.get(id).await.unwrap().status, JobStatus::Pending);
        assert!(store.get(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn insert_twice_is_rejected() {
        let store = VolatileJobStore::new();
        let job = make_job();
        store.insert(job.clone()).await.unwrap();
        let err = store.insert(job).await.unwrap_err();
        assert!(matches!(err, JobError::Duplicate { .. }));
    }

    #[tokio::test]
    async fn update_and_copy_on_read() {
        let store = VolatileJobStore::new();
        let job = make_job();
        let id = job.id;
        store.insert(job).await.unwrap();

        let before = store.get(id).await.unwrap();
        store
            .update(id, |job| job.output_lines.push("line".into()))
            .await
            .unwrap();

        assert!(before.output_lines.is_empty());
        assert_eq!(store.get(id).await.unwrap().output_lines, ["line"]);

        let missing = store.update(Uuid::new_v4(), |_| ()).await;
        assert!(matches!(missing, Err(JobError::NotFound { .. })));
    }

    #[tokio::test]
    async fn unpersisted_ids_track_the_flag() {
        let store = VolatileJobStore::new();
        let (a, b) = (make_job(), make_job());
        let (a_id, b_id) = (a.id, b.id);
        store.insert(a).await.unwrap();
        store.insert(b).await.unwrap();

        store.mark_persisted(a_id).await;
        assert_eq!(store.unpersisted_ids().await, HashSet::from([b_id]));
    }

    #[tokio::test]
    async fn remove_reports_presence() {
        let store = VolatileJobStore::new();
        let job = make_job();
        let id = job.id;
        store.insert(job).await.unwrap();

        assert!(store.remove(id).await);
        assert!(!store.remove(id).await);
    }

    #[tokio::test]
    async fn eviction_only_drops_old_persisted_terminal_jobs() {
        let store = VolatileJobStore::new();

        let old_persisted = finished(make_job(), chrono::Duration::hours(2));
        let old_unpersisted = finished(make_job(), chrono::Duration::hours(2));
        let fresh_persisted = finished(make_job(), chrono::Duration::seconds(1));
        let running = make_job();

        let (a, b, c, d) = (
            old_persisted.id,
            old_unpersisted.id,
            fresh_persisted.id,
            running.id,
        );
        for job in [old_persisted, old_unpersisted, fresh_persisted, running] {
            store.insert(job).await.unwrap();
        }
        store.mark_persisted(a).await;
        store.mark_persisted(c).await;
        store.mark_persisted(d).await;

        let evicted = store
            .evict_persisted_older_than(Duration::from_secs(3600))
            .await;
        assert_eq!(evicted, 1);
        assert!(store.get(a).await.is_none());
        assert!(store.get(b).await.is_some());
        assert!(store.get(c).await.is_some());
        assert!(store.get(d).await.is_some());
    }
}
