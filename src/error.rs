//! Error types for DashBorg.

use std::time::Duration;

use uuid::Uuid;

/// Errors from submitting a job by config label.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Job-related errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} already in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },

    #[error("Job {id} is already registered")]
    Duplicate { id: Uuid },
}

/// Errors from launching or reading an external process.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Empty command")]
    EmptyCommand,

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to set up output pipe: {0}")]
    Pipe(#[source] std::io::Error),

    #[error("Failed to wait for process: {0}")]
    Wait(#[source] std::io::Error),
}

/// Follow-up statistics query failures. Advisory only, never fails a job.
#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    #[error("Stats query timed out after {0:?}")]
    Timeout(Duration),

    #[error("Stats query could not run: {0}")]
    Process(#[from] ProcessError),

    #[error("Stats query exited with code {code}: {output}")]
    NonZeroExit { code: i32, output: String },

    #[error("Malformed stats response: {0}")]
    Malformed(String),
}
