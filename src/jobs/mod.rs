//! Job execution and state reconciliation.
//!
//! Core components:
//! - `model`: JobRecord, JobKind, and the status state machine
//! - `runner`: external process with merged line output
//! - `progress`: per-line progress extraction
//! - `stats`: backup statistics normalization and follow-up query
//! - `volatile`: in-memory live job table
//! - `reconcile`: merged view over the live table and durable history
//! - `engine`: submission, execution units, and the job API

pub mod engine;
pub mod model;
pub mod progress;
pub mod reconcile;
pub mod runner;
pub mod stats;
pub mod volatile;

pub use engine::JobEngine;
pub use model::{CheckVariant, JobKind, JobProgress, JobRecord, JobStatus};
pub use progress::{BorgProgressExtractor, LineEvent, ProgressExtractor};
pub use reconcile::JobReconciler;
pub use runner::ProcessRunner;
pub use stats::{BackupStats, BorgmaticStatsResolver, StatsResolver};
pub use volatile::{VolatileJobStore, spawn_retention_task};
