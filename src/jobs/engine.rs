//! Job engine: submission, execution units and the public job API.
//!
//! Every submission gets its own tokio task (an execution unit) that owns
//! the job's record for the whole run:
//! - moves it `pending -> running` and spawns the process
//! - appends each output line and applies the progress extractor
//! - resolves backup statistics after a successful create-backup
//! - applies the terminal transition, then writes the durable copy once
//!
//! Reads never touch the execution unit; they go through the reconciler.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{Error, JobError};
use crate::jobs::model::{JobKind, JobRecord, JobStatus};
use crate::jobs::progress::{BorgProgressExtractor, LineEvent, ProgressExtractor};
use crate::jobs::reconcile::JobReconciler;
use crate::jobs::runner::ProcessRunner;
use crate::jobs::stats::{BackupStats, BorgmaticStatsResolver, StatsResolver};
use crate::jobs::volatile::VolatileJobStore;
use crate::store::JobHistory;

/// Error recorded on a job that was cancelled while running.
pub const CANCELLED_ERROR: &str = "Job cancelled";

/// Handle on a job whose execution unit has not returned yet.
#[derive(Debug)]
struct TrackedJob {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

type RunningJobs = Arc<RwLock<HashMap<Uuid, TrackedJob>>>;

/// Submits jobs and answers queries about them.
pub struct JobEngine {
    config: EngineConfig,
    live: Arc<VolatileJobStore>,
    history: Arc<dyn JobHistory>,
    reconciler: JobReconciler,
    extractor: Arc<dyn ProgressExtractor>,
    stats: Option<Arc<dyn StatsResolver>>,
    /// Jobs whose execution unit is still alive. An entry is removed only
    /// after the unit's durable write.
    running: RunningJobs,
}

impl JobEngine {
    /// Create an engine with the borg extractor and, when enabled in
    /// `config`, the borgmatic follow-up stats query.
    pub fn new(config: EngineConfig, history: Arc<dyn JobHistory>) -> Self {
        let stats: Option<Arc<dyn StatsResolver>> = if config.stats_follow_up {
            Some(Arc::new(BorgmaticStatsResolver::new(
                config.tool.clone(),
                config.stats_timeout,
            )))
        } else {
            None
        };
        let live = Arc::new(VolatileJobStore::new());

        Self {
            reconciler: JobReconciler::new(live.clone(), history.clone()),
            config,
            live,
            history,
            extractor: Arc::new(BorgProgressExtractor),
            stats,
            running: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Replace the progress extractor.
    pub fn with_extractor(mut self, extractor: Arc<dyn ProgressExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    /// Replace (or disable, with `None`) the follow-up stats resolver.
    pub fn with_stats_resolver(mut self, resolver: Option<Arc<dyn StatsResolver>>) -> Self {
        self.stats = resolver;
        self
    }

    /// The in-memory job table, shared with the retention sweep.
    pub fn live_store(&self) -> Arc<VolatileJobStore> {
        self.live.clone()
    }

    /// Register a job and start running `command` in the background.
    ///
    /// Returns as soon as the job is registered, before the process exits.
    pub async fn submit(
        &self,
        kind: JobKind,
        command: Vec<String>,
        config_label: impl Into<String>,
    ) -> Result<Uuid, JobError> {
        let record = JobRecord::new(kind, command, config_label);
        let id = record.id;
        self.live.insert(record).await?;

        let cancel = CancellationToken::new();
        let unit = ExecutionUnit {
            id,
            kind,
            live: self.live.clone(),
            history: self.history.clone(),
            extractor: self.extractor.clone(),
            stats: self.stats.clone(),
            cancel: cancel.clone(),
            running: self.running.clone(),
        };

        // Hold the lock across the spawn so the unit cannot deregister
        // before it is registered.
        let mut running = self.running.write().await;
        let handle = tokio::spawn(unit.run());
        running.insert(id, TrackedJob { cancel, handle });
        drop(running);

        info!(job_id = %id, kind = %kind, "Job submitted");
        Ok(id)
    }

    /// Submit `kind` against a config file label, building the tool command.
    pub async fn submit_kind(&self, kind: JobKind, config_label: &str) -> Result<Uuid, Error> {
        let config_path = self.config.config_path(config_label)?;
        let command = kind.command(&self.config.tool, &config_path);
        Ok(self.submit(kind, command, config_label).await?)
    }

    pub async fn get_job(&self, id: Uuid) -> Result<JobRecord, JobError> {
        self.reconciler.get(id).await
    }

    /// Jobs from both stores, newest first.
    pub async fn list_jobs(&self, limit: usize, offset: usize) -> Vec<JobRecord> {
        self.reconciler.list(limit, offset).await
    }

    /// Delete a job from both stores.
    ///
    /// A running job is cancelled and its execution unit awaited first, so
    /// its durable write cannot land after the delete.
    pub async fn delete_job(&self, id: Uuid) -> Result<(), JobError> {
        let tracked = self.running.write().await.remove(&id);
        if let Some(tracked) = tracked {
            tracked.cancel.cancel();
            if let Err(e) = tracked.handle.await {
                warn!(job_id = %id, "Execution unit ended abnormally: {e}");
            }
        }
        self.reconciler.delete(id).await
    }

    /// Cancel a running job. Finished jobs are left untouched.
    pub async fn cancel_job(&self, id: Uuid) -> Result<(), JobError> {
        if let Some(tracked) = self.running.read().await.get(&id) {
            tracked.cancel.cancel();
            info!(job_id = %id, "Job cancellation requested");
            return Ok(());
        }
        self.reconciler.get(id).await.map(|_| ())
    }
}

/// How the process part of a run ended.
#[derive(Debug, Default)]
struct RunOutcome {
    return_code: Option<i32>,
    error: Option<String>,
    inline_stats: Option<Value>,
}

/// Sole writer of one job's record for the lifetime of its run.
struct ExecutionUnit {
    id: Uuid,
    kind: JobKind,
    live: Arc<VolatileJobStore>,
    history: Arc<dyn JobHistory>,
    extractor: Arc<dyn ProgressExtractor>,
    stats: Option<Arc<dyn StatsResolver>>,
    cancel: CancellationToken,
    running: RunningJobs,
}

impl ExecutionUnit {
    async fn run(self) {
        let id = self.id;
        let started = self
            .live
            .update(id, |job| {
                job.transition_to(JobStatus::Running)
                    .map(|()| job.command.clone())
            })
            .await
            .and_then(|result| result);

        match started {
            Ok(command) => {
                let outcome = self.execute(&command).await;
                self.finish(outcome).await;
            }
            Err(e) => warn!(job_id = %id, "Job could not start: {e}"),
        }

        self.running.write().await.remove(&id);
    }

    /// Spawn the process and consume its output until exit or cancellation.
    async fn execute(&self, command: &[String]) -> RunOutcome {
        let mut outcome = RunOutcome::default();

        let mut runner = match ProcessRunner::spawn(command) {
            Ok(runner) => runner,
            Err(e) => {
                warn!(job_id = %self.id, "Failed to start job: {e}");
                outcome.error = Some(e.to_string());
                return outcome;
            }
        };
        info!(job_id = %self.id, kind = %self.kind, "Job running");

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    runner.kill().await;
                    outcome.error = Some(CANCELLED_ERROR.to_string());
                    break;
                }
                line = runner.next_line() => match line {
                    Some(line) => {
                        if let Some(stats) = self.record_line(line).await {
                            outcome.inline_stats.get_or_insert(stats);
                        }
                    }
                    None => break,
                },
            }
        }

        match runner.wait().await {
            Ok(code) => outcome.return_code = Some(code),
            Err(e) => {
                warn!(job_id = %self.id, "Failed to collect exit status: {e}");
                outcome.error.get_or_insert(e.to_string());
            }
        }
        outcome
    }

    /// Append one line and advance progress in a single update.
    /// Returns inline statistics if the line carried them.
    async fn record_line(&self, line: String) -> Option<Value> {
        debug!(job_id = %self.id, line = %line, "Job output");
        let extractor = &self.extractor;
        let event = self
            .live
            .update(self.id, |job| {
                let event = extractor.extract(&line, &mut job.progress);
                job.output_lines.push(line);
                event
            })
            .await;

        match event {
            Ok(LineEvent::InlineStats(stats)) => Some(stats),
            Ok(LineEvent::File | LineEvent::Plain) => None,
            Err(e) => {
                debug!(job_id = %self.id, "Dropping output line: {e}");
                None
            }
        }
    }

    /// Apply the terminal transition and persist the final record.
    async fn finish(&self, outcome: RunOutcome) {
        let id = self.id;
        let mut error = outcome.error;
        let mut succeeded = error.is_none() && outcome.return_code == Some(0);

        let (stats, stats_error) = if succeeded && self.kind.yields_stats() {
            match self.resolve_stats(outcome.inline_stats).await {
                Some(resolved) => resolved,
                None => {
                    error = Some(CANCELLED_ERROR.to_string());
                    succeeded = false;
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        let target = if succeeded {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        let finished = self
            .live
            .update(id, |job| {
                job.return_code = outcome.return_code;
                job.error = error;
                job.stats = stats;
                job.stats_error = stats_error;
                job.transition_to(target).map(|()| job.clone())
            })
            .await
            .and_then(|result| result);

        let job = match finished {
            Ok(job) => job,
            Err(e) => {
                // Record vanished; nothing left to persist.
                debug!(job_id = %id, "Skipping persistence: {e}");
                return;
            }
        };

        info!(
            job_id = %id,
            kind = %job.kind,
            status = %job.status,
            return_code = ?job.return_code,
            lines = job.output_lines.len(),
            "Job finished"
        );

        match self.history.save_job(&job).await {
            Ok(()) => self.live.mark_persisted(id).await,
            Err(e) => error!(job_id = %id, "Failed to persist job: {e}"),
        }
    }

    /// Statistics for a successful backup. The follow-up query wins when
    /// configured; otherwise the inline statistics line is used.
    /// Returns `None` if the job was cancelled while the query ran.
    async fn resolve_stats(
        &self,
        inline: Option<Value>,
    ) -> Option<(Option<BackupStats>, Option<String>)> {
        let result = match &self.stats {
            Some(resolver) => {
                let job = self.live.get(self.id).await?;
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        info!(job_id = %self.id, "Stats query cancelled");
                        return None;
                    }
                    result = resolver.resolve(&job) => result,
                }
            }
            None => match inline {
                Some(value) => BackupStats::normalize(&value),
                None => return Some((None, None)),
            },
        };

        Some(match result {
            Ok(stats) => (Some(stats), None),
            Err(e) => {
                warn!(job_id = %self.id, "Backup stats unavailable: {e}");
                (None, Some(e.to_string()))
            }
        })
    }
}
