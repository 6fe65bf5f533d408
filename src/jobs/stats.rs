//! Backup statistics: normalization and the follow-up query.
//!
//! The tool reports statistics in two shapes:
//! - `create --json` prints `[{"archive": {...}, "repository": {...}, ...}]`
//! - `info --json` prints `[{"archives": [...], "repository": {...}, ...}]`
//!
//! Both are reshaped into one flat [`BackupStats`] carrying a single archive.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use crate::error::{ProcessError, StatsError};
use crate::jobs::model::JobRecord;

/// Normalized statistics for the most recent archive of a backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupStats {
    pub archive: Value,
    #[serde(default)]
    pub repository: Value,
    #[serde(default)]
    pub encryption: Option<Value>,
    #[serde(default)]
    pub cache: Option<Value>,
}

impl BackupStats {
    /// Reshape either response shape into a single-archive summary.
    pub fn normalize(response: &Value) -> Result<Self, StatsError> {
        let entry = match response {
            Value::Array(items) => items
                .first()
                .ok_or_else(|| StatsError::Malformed("empty response array".into()))?,
            other => other,
        };
        let entry = entry
            .as_object()
            .ok_or_else(|| StatsError::Malformed("repository entry is not an object".into()))?;

        let archive = match (entry.get("archive"), entry.get("archives")) {
            (Some(archive @ Value::Object(_)), _) => archive.clone(),
            (_, Some(Value::Array(archives))) => most_recent(archives)
                .cloned()
                .ok_or_else(|| StatsError::Malformed("no archives in response".into()))?,
            _ => return Err(StatsError::Malformed("response has no archive".into())),
        };

        let optional = |key: &str| entry.get(key).filter(|v| !v.is_null()).cloned();
        Ok(Self {
            archive,
            repository: entry.get("repository").cloned().unwrap_or(Value::Null),
            encryption: optional("encryption"),
            cache: optional("cache"),
        })
    }
}

/// Latest archive by `start` timestamp, falling back to list order.
fn most_recent(archives: &[Value]) -> Option<&Value> {
    let objects = archives.iter().filter(|a| a.is_object());
    let by_start = objects
        .clone()
        .filter_map(|a| a.get("start").and_then(Value::as_str).map(|s| (s, a)))
        .max_by(|(a, _), (b, _)| a.cmp(b))
        .map(|(_, archive)| archive);
    by_start.or_else(|| objects.last())
}

/// Fetches statistics after a successful backup.
#[async_trait]
pub trait StatsResolver: Send + Sync {
    async fn resolve(&self, job: &JobRecord) -> Result<BackupStats, StatsError>;
}

/// Runs `<tool> info --config <path> --archive latest --json`.
#[derive(Debug, Clone)]
pub struct BorgmaticStatsResolver {
    tool: String,
    timeout: Duration,
}

impl BorgmaticStatsResolver {
    pub fn new(tool: impl Into<String>, timeout: Duration) -> Self {
        Self {
            tool: tool.into(),
            timeout,
        }
    }

    fn command(&self, config_path: &str) -> Command {
        let mut command = Command::new(&self.tool);
        command
            .args(["info", "--config", config_path, "--archive", "latest", "--json"])
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl StatsResolver for BorgmaticStatsResolver {
    async fn resolve(&self, job: &JobRecord) -> Result<BackupStats, StatsError> {
        let config_path = config_arg(&job.command)
            .ok_or_else(|| StatsError::Malformed("job command has no --config".into()))?;

        let output = tokio::time::timeout(self.timeout, self.command(config_path).output())
            .await
            .map_err(|_| StatsError::Timeout(self.timeout))?
            .map_err(|source| ProcessError::Spawn {
                program: self.tool.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StatsError::NonZeroExit {
                code: output.status.code().unwrap_or(-1),
                output: stderr.trim().chars().take(500).collect(),
            });
        }

        let response: Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| StatsError::Malformed(e.to_string()))?;
        let stats = BackupStats::normalize(&response)?;
        debug!(job_id = %job.id, "Resolved backup stats");
        Ok(stats)
    }
}

/// Value following `--config` in an argument vector.
fn config_arg(command: &[String]) -> Option<&str> {
    command
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| command.get(i + 1))
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    use serde_json::json;

    use super::*;
    use crate::jobs::model::JobKind;

    fn info_response() -> Value {
        json!([{
            "archives": [
                {"name": "host-2024-01-01", "id": "old", "start": "2024-01-01T00:00:00.000000"},
                {"name": "host-2024-03-01", "id": "new", "start": "2024-03-01T00:00:00.000000"},
                {"name": "host-2024-02-01", "id": "mid", "start": "2024-02-01T00:00:00.000000"}
            ],
            "repository": {"id": "repo1", "location": "ssh://backup/./repo"},
            "encryption": {"mode": "repokey-blake2"},
            "cache": {"stats": {"total_chunks": 10, "unique_size": 2048}}
        }])
    }

    #[test]
    fn normalize_picks_most_recent_archive() {
        let stats = BackupStats::normalize(&info_response()).unwrap();
        assert_eq!(stats.archive["id"], "new");
        assert_eq!(stats.repository["id"], "repo1");
        assert_eq!(stats.encryption.unwrap()["mode"], "repokey-blake2");
        assert_eq!(stats.cache.unwrap()["stats"]["total_chunks"], 10);
    }

    #[test]
    fn normalize_falls_back_to_list_order() {
        let response = json!([{"archives": [{"id": "a"}, {"id": "b"}]}]);
        let stats = BackupStats::normalize(&response).unwrap();
        assert_eq!(stats.archive["id"], "b");
        assert_eq!(stats.repository, Value::Null);
        assert!(stats.encryption.is_none());
        assert!(stats.cache.is_none());
    }

    #[test]
    fn normalize_accepts_single_shot_shape() {
        let stats = BackupStats::normalize(&json!({"archive": {"id": "abc"}})).unwrap();
        assert_eq!(stats.archive, json!({"id": "abc"}));
    }

    #[test]
    fn normalize_rejects_missing_archive() {
        for bad in [json!([]), json!([{"archives": []}]), json!([{"repository": {}}]), json!("x")] {
            assert!(
                matches!(BackupStats::normalize(&bad), Err(StatsError::Malformed(_))),
                "expected malformed for {bad}"
            );
        }
    }

    #[test]
    fn config_arg_lookup() {
        let argv: Vec<String> = ["borgmatic", "create", "--config", "/etc/b/c.yaml"]
            .map(String::from)
            .into();
        assert_eq!(config_arg(&argv), Some("/etc/b/c.yaml"));
        assert_eq!(config_arg(&argv[..3]), None);
    }

    /// Write an executable fake tool that runs `body` as a shell script.
    fn fake_tool(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-borgmatic");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn backup_job() -> JobRecord {
        JobRecord::new(
            JobKind::CreateBackup,
            JobKind::CreateBackup.command("borgmatic", Path::new("/etc/borgmatic/c.yaml")),
            "c.yaml",
        )
    }

    #[tokio::test]
    async fn resolver_parses_tool_output() {
        let dir = tempfile::tempdir().unwrap();
        let body = format!(
            "echo 'log noise' 1>&2\ncat <<'EOF'\n{}\nEOF",
            serde_json::to_string_pretty(&info_response()).unwrap()
        );
        let tool = fake_tool(dir.path(), &body);
        let resolver =
            BorgmaticStatsResolver::new(tool.display().to_string(), Duration::from_secs(5));

        let stats = resolver.resolve(&backup_job()).await.unwrap();
        assert_eq!(stats.archive["id"], "new");
    }

    #[tokio::test]
    async fn resolver_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path(), "exec sleep 10");
        let resolver =
            BorgmaticStatsResolver::new(tool.display().to_string(), Duration::from_millis(100));

        let err = resolver.resolve(&backup_job()).await.unwrap_err();
        assert!(matches!(err, StatsError::Timeout(_)));
    }

    #[tokio::test]
    async fn resolver_reports_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path(), "echo 'repository locked' 1>&2; exit 2");
        let resolver =
            BorgmaticStatsResolver::new(tool.display().to_string(), Duration::from_secs(5));

        match resolver.resolve(&backup_job()).await.unwrap_err() {
            StatsError::NonZeroExit { code, output } => {
                assert_eq!(code, 2);
                assert_eq!(output, "repository locked");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn resolver_rejects_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path(), "echo '[{oops'");
        let resolver =
            BorgmaticStatsResolver::new(tool.display().to_string(), Duration::from_secs(5));

        let err = resolver.resolve(&backup_job()).await.unwrap_err();
        assert!(matches!(err, StatsError::Malformed(_)));
    }
}
