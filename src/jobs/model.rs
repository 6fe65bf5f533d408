//! Job records and the job state machine.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;
use crate::jobs::stats::BackupStats;

/// Consistency-check scope passed to `check --only`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckVariant {
    Repository,
    Archives,
    Data,
    Extract,
    Spot,
}

impl CheckVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Repository => "repository",
            Self::Archives => "archives",
            Self::Data => "data",
            Self::Extract => "extract",
            Self::Spot => "spot",
        }
    }
}

impl std::str::FromStr for CheckVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "repository" => Ok(Self::Repository),
            "archives" => Ok(Self::Archives),
            "data" => Ok(Self::Data),
            "extract" => Ok(Self::Extract),
            "spot" => Ok(Self::Spot),
            other => Err(format!("Unknown check variant: {other}")),
        }
    }
}

/// Category of a job. Serialized as `create-backup`, `prune`,
/// `prune-dry-run` or `check-<variant>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum JobKind {
    CreateBackup,
    Prune,
    PruneDryRun,
    Check(CheckVariant),
}

impl JobKind {
    /// Argument vector for this kind against one config file.
    pub fn command(&self, tool: &str, config_path: &Path) -> Vec<String> {
        let config = config_path.display().to_string();
        let (subcommand, flags) = match self {
            Self::CreateBackup => ("create", vec!["--list", "--stats", "--json"]),
            Self::Prune => ("prune", vec!["--list", "--stats"]),
            Self::PruneDryRun => ("prune", vec!["--list", "--stats", "--dry-run"]),
            Self::Check(variant) => ("check", vec!["--only", variant.as_str()]),
        };

        let mut argv: Vec<String> = [tool, subcommand, "--config", config.as_str()]
            .into_iter()
            .chain(["--verbosity", "1"])
            .map(String::from)
            .collect();
        argv.extend(flags.into_iter().map(String::from));
        argv
    }

    /// Whether a successful run of this kind produces backup statistics.
    pub fn yields_stats(&self) -> bool {
        matches!(self, Self::CreateBackup)
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreateBackup => write!(f, "create-backup"),
            Self::Prune => write!(f, "prune"),
            Self::PruneDryRun => write!(f, "prune-dry-run"),
            Self::Check(variant) => write!(f, "check-{}", variant.as_str()),
        }
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create-backup" => Ok(Self::CreateBackup),
            "prune" => Ok(Self::Prune),
            "prune-dry-run" => Ok(Self::PruneDryRun),
            other => match other.strip_prefix("check-") {
                Some(variant) => variant.parse().map(Self::Check),
                None => Err(format!("Unknown job kind: {other}")),
            },
        }
    }
}

impl TryFrom<String> for JobKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<JobKind> for String {
    fn from(kind: JobKind) -> Self {
        kind.to_string()
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Created, not yet owned by an execution unit.
    Pending,
    /// The process has been spawned.
    Running,
    /// The process exited with code 0.
    Completed,
    /// Non-zero exit, spawn failure, cancellation or another execution error.
    Failed,
}

impl JobStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Pending, Running) | (Running, Completed) | (Running, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("Unknown job status: {other}")),
        }
    }
}

/// Running progress summary extracted from the output stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub current_file: Option<String>,
    pub files_processed: u64,
    pub last_update: Option<DateTime<Utc>>,
}

/// One execution of the external backup tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub kind: JobKind,
    /// Exact argument vector the process was launched with.
    pub command: Vec<String>,
    /// Config label the job was submitted for.
    pub config: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output_lines: Vec<String>,
    pub progress: JobProgress,
    pub return_code: Option<i32>,
    pub stats: Option<BackupStats>,
    pub stats_error: Option<String>,
    pub error: Option<String>,
}

impl JobRecord {
    /// Create a pending record with a fresh id.
    pub fn new(kind: JobKind, command: Vec<String>, config: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            command,
            config: config.into(),
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            output_lines: Vec::new(),
            progress: JobProgress::default(),
            return_code: None,
            stats: None,
            stats_error: None,
            error: None,
        }
    }

    /// Transition to a new status, stamping `started_at`/`completed_at`.
    pub fn transition_to(&mut self, target: JobStatus) -> Result<(), JobError> {
        if !self.status.can_transition_to(target) {
            return Err(JobError::InvalidTransition {
                id: self.id,
                state: self.status.to_string(),
                target: target.to_string(),
            });
        }

        self.status = target;
        match target {
            JobStatus::Running => self.started_at = Some(Utc::now()),
            JobStatus::Completed | JobStatus::Failed => self.completed_at = Some(Utc::now()),
            JobStatus::Pending => {}
        }
        Ok(())
    }

    /// Captured output joined with newlines, or `"No output"`.
    pub fn output_text(&self) -> String {
        if self.output_lines.is_empty() {
            "No output".to_string()
        } else {
            self.output_lines.join("\n")
        }
    }
}
